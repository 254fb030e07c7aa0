//! Wire codec for the game protocol frames the proxy inspects.
//!
//! This library provides:
//! - VarInt / length-prefixed string primitives ([`codec`])
//! - Incremental parsing of the client handshake frame ([`handshake`])
//! - Classification of the backend's first reply ([`response`])
//! - Encoding of status-protocol replies ([`status`])
//!
//! Everything here is pure: functions take byte slices and return values,
//! nothing performs I/O. Decoders share a three-way contract: a decoded value
//! ([`Decoded::Complete`]), a request for more bytes ([`Decoded::Incomplete`]),
//! or a [`WireError`] when the bytes can never form a valid value.

pub mod codec;
pub mod handshake;
pub mod response;
pub mod status;

mod error;

pub use codec::{put_string, put_varint, read_string, read_u16, read_varint, varint_len};
pub use error::WireError;
pub use handshake::{
    Handshake, HandshakeParser, NextState, DEFAULT_MAX_HANDSHAKE_BYTES, HANDSHAKE_PACKET_ID,
};
pub use response::{classify_response, ResponseFrame, ResponseKind};
pub use status::{StatusDescription, StatusPlayers, StatusResponse, StatusVersion, STATUS_PACKET_ID};

/// Outcome of a decode attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A value was decoded; the next field starts at `next_offset`.
    Complete { value: T, next_offset: usize },
    /// The buffer ended before the value did.
    Incomplete,
}

impl<T> Decoded<T> {
    /// Returns true if more bytes are needed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Decoded::Incomplete)
    }

    /// Convert into `Some((value, next_offset))`, or `None` when incomplete.
    pub fn complete(self) -> Option<(T, usize)> {
        match self {
            Decoded::Complete { value, next_offset } => Some((value, next_offset)),
            Decoded::Incomplete => None,
        }
    }
}

/// Result alias used by every decoder in this crate.
pub type DecodeResult<T> = Result<Decoded<T>, WireError>;
