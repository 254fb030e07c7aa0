//! Status-protocol response encoding.
//!
//! A status response frame is `VarInt frame_length | VarInt packet_id (0) |
//! String json`, where the JSON body describes the server as shown in the
//! client's server list.

use serde::{Deserialize, Serialize};

use crate::codec::{put_string, put_varint, varint_len};

/// Packet id of the status response.
pub const STATUS_PACKET_ID: u32 = 0x00;

/// JSON body of a status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    pub description: StatusDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: u32,
    pub online: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDescription {
    pub text: String,
}

impl StatusResponse {
    /// Encode as a complete status response frame.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = serde_json::to_string(self)?;

        let body_len = varint_len(STATUS_PACKET_ID) + varint_len(json.len() as u32) + json.len();
        let mut frame = Vec::with_capacity(varint_len(body_len as u32) + body_len);

        put_varint(&mut frame, body_len as u32);
        put_varint(&mut frame, STATUS_PACKET_ID);
        put_string(&mut frame, &json);

        Ok(frame)
    }
}
