//! Error types for frame decoding.

use thiserror::Error;

/// Errors raised when bytes can never decode into a valid frame.
///
/// Running out of input is not an error; see [`crate::Decoded::Incomplete`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A VarInt did not terminate within 5 bytes or does not fit in 32 bits.
    #[error("VarInt longer than 5 bytes or wider than 32 bits")]
    VarIntTooLong,

    /// A string field is not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    /// The frame declares a zero length.
    #[error("empty frame")]
    EmptyFrame,

    /// The frame is larger than the caller allows.
    #[error("frame of {declared} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { declared: usize, limit: usize },

    /// The packet id is not the one expected at this point of the exchange.
    #[error("unexpected packet id {actual:#04x} (expected {expected:#04x})")]
    UnexpectedPacketId { expected: u32, actual: u32 },

    /// A field runs past the end of its enclosing frame.
    #[error("field `{field}` overruns the declared frame")]
    FieldOverrun { field: &'static str },
}

impl WireError {
    /// Returns true if the error was raised by a size bound rather than
    /// by the content of the bytes.
    pub fn is_size_limit(&self) -> bool {
        matches!(self, WireError::FrameTooLarge { .. })
    }
}
