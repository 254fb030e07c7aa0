//! Client handshake frame parsing.
//!
//! Frame layout:
//!
//! ```text
//! VarInt frame_length | VarInt packet_id (0) | VarInt protocol_version
//!   | String hostname | u16 (BE) port | VarInt next_state
//! ```
//!
//! The parser is fed the cumulative bytes received from the client. It never
//! consumes or rewrites them; on success it reports how many leading bytes make
//! up the frame so the caller can forward exactly those bytes.

use std::fmt;

use bytes::BufMut;

use crate::codec::{put_string, put_varint, read_string, read_u16, read_varint};
use crate::{DecodeResult, Decoded, WireError};

/// Packet id of the handshake frame.
pub const HANDSHAKE_PACKET_ID: u32 = 0x00;

/// Default bound on the bytes buffered while waiting for a handshake.
pub const DEFAULT_MAX_HANDSHAKE_BYTES: usize = 4096;

/// State the client asks to switch to after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextState {
    /// Server list ping.
    Status,
    /// Joining the game.
    Login,
    /// Transfer from another server.
    Transfer,
    /// Any value this proxy does not know about.
    Unknown(u32),
}

impl NextState {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Status => 1,
            Self::Login => 2,
            Self::Transfer => 3,
            Self::Unknown(v) => v,
        }
    }
}

impl From<u32> for NextState {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Status,
            2 => Self::Login,
            3 => Self::Transfer,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for NextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => f.write_str("status"),
            Self::Login => f.write_str("login"),
            Self::Transfer => f.write_str("transfer"),
            Self::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

/// A decoded handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    /// Hostname the client typed, as sent. Not normalized.
    pub hostname: String,
    pub port: u16,
    pub next_state: NextState,
}

impl Handshake {
    /// Encode this handshake as a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.hostname.len());
        put_varint(&mut body, HANDSHAKE_PACKET_ID);
        put_varint(&mut body, self.protocol_version);
        put_string(&mut body, &self.hostname);
        body.put_u16(self.port);
        put_varint(&mut body, self.next_state.as_u32());

        let mut frame = Vec::with_capacity(body.len() + 5);
        put_varint(&mut frame, body.len() as u32);
        frame.extend_from_slice(&body);
        frame
    }
}

/// Incremental handshake parser.
#[derive(Debug, Clone)]
pub struct HandshakeParser {
    max_frame_len: usize,
}

impl HandshakeParser {
    /// Create a parser with the default size bound.
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_HANDSHAKE_BYTES,
        }
    }

    /// Create a parser that rejects frames longer than `max_frame_len` bytes
    /// (length prefix included).
    pub fn with_limit(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Try to parse a handshake from the start of `buf`.
    ///
    /// Returns `Incomplete` until the whole declared frame is buffered. On
    /// success `next_offset` is the length of the frame; any bytes after it
    /// belong to the next packet.
    pub fn parse(&self, buf: &[u8]) -> DecodeResult<Handshake> {
        let (declared, body_start) = match read_varint(buf, 0)? {
            Decoded::Complete { value, next_offset } => (value as usize, next_offset),
            Decoded::Incomplete => return Ok(Decoded::Incomplete),
        };

        if declared == 0 {
            return Err(WireError::EmptyFrame);
        }

        let frame_end = body_start.saturating_add(declared);
        if frame_end > self.max_frame_len {
            return Err(WireError::FrameTooLarge {
                declared: frame_end,
                limit: self.max_frame_len,
            });
        }

        if buf.len() < frame_end {
            return Ok(Decoded::Incomplete);
        }

        let frame = &buf[..frame_end];

        let (packet_id, pos) = within_frame(read_varint(frame, body_start), "packet_id")?;
        if packet_id != HANDSHAKE_PACKET_ID {
            return Err(WireError::UnexpectedPacketId {
                expected: HANDSHAKE_PACKET_ID,
                actual: packet_id,
            });
        }

        let (protocol_version, pos) = within_frame(read_varint(frame, pos), "protocol_version")?;
        let (hostname, pos) = within_frame(read_string(frame, pos), "hostname")?;
        let (port, pos) = within_frame(read_u16(frame, pos), "port")?;
        let (next_state, _) = within_frame(read_varint(frame, pos), "next_state")?;

        Ok(Decoded::Complete {
            value: Handshake {
                protocol_version,
                hostname,
                port,
                next_state: NextState::from(next_state),
            },
            next_offset: frame_end,
        })
    }
}

impl Default for HandshakeParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Inside a fully buffered frame, running out of bytes means the field
/// overruns the frame.
fn within_frame<T>(result: DecodeResult<T>, field: &'static str) -> Result<(T, usize), WireError> {
    result?
        .complete()
        .ok_or(WireError::FieldOverrun { field })
}
