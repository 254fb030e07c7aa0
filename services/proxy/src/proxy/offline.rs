//! Offline status reply.
//!
//! When a backend cannot be reached before relaying starts, the client gets a
//! status-protocol response instead of a bare close, so its server list shows
//! the server as protected rather than timing out.

use std::io;

use bytes::Bytes;
use shield_wire::{StatusDescription, StatusPlayers, StatusResponse, StatusVersion};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Content of the offline status reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineConfig {
    /// Version label shown by the client.
    pub version_name: String,
    /// Protocol number advertised in the reply.
    pub protocol: i32,
    /// Description (MOTD) text.
    pub description: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            version_name: "CloudNord Shield".to_string(),
            protocol: 47,
            description: "§bProtected by §3CloudNord Shield".to_string(),
        }
    }
}

impl OfflineConfig {
    fn status(&self) -> StatusResponse {
        StatusResponse {
            version: StatusVersion {
                name: self.version_name.clone(),
                protocol: self.protocol,
            },
            players: StatusPlayers { max: 0, online: 0 },
            description: StatusDescription {
                text: self.description.clone(),
            },
        }
    }
}

/// Pre-encoded offline status reply, shared by all connections.
#[derive(Debug, Clone)]
pub struct OfflineResponder {
    reply: Bytes,
}

impl OfflineResponder {
    pub fn new(config: &OfflineConfig) -> Result<Self, serde_json::Error> {
        Ok(Self {
            reply: Bytes::from(Self::build_offline_status(config)?),
        })
    }

    /// Encode the offline status frame for `config`.
    pub fn build_offline_status(config: &OfflineConfig) -> Result<Vec<u8>, serde_json::Error> {
        config.status().encode()
    }

    /// The encoded frame.
    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    /// Write the reply and shut down the write side.
    pub async fn send<W>(&self, client: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        client.write_all(&self.reply).await?;
        client.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_wire::{read_string, read_varint};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_reply_decodes() {
        let responder = OfflineResponder::new(&OfflineConfig::default()).unwrap();
        let frame = responder.reply();

        let (len, pos) = read_varint(frame, 0).unwrap().complete().unwrap();
        assert_eq!(pos + len as usize, frame.len());
        let (packet_id, pos) = read_varint(frame, pos).unwrap().complete().unwrap();
        assert_eq!(packet_id, 0);
        let (json, _) = read_string(frame, pos).unwrap().complete().unwrap();

        let status: StatusResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(status.version.name, "CloudNord Shield");
        assert_eq!(status.players.max, 0);
        assert!(status.description.text.contains("CloudNord Shield"));
    }

    #[tokio::test]
    async fn test_send_writes_frame_then_eof() {
        let responder = OfflineResponder::new(&OfflineConfig::default()).unwrap();
        let (mut server, mut client) = tokio::io::duplex(4096);

        responder.send(&mut server).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, responder.reply());
    }
}
