//! Classification of the backend's first reply.
//!
//! Only the frame length and packet id are inspected. The rest of the frame is
//! never read, so a classification is available as soon as those two VarInts
//! have arrived.

use std::fmt;

use crate::codec::read_varint;
use crate::{DecodeResult, Decoded, WireError};

/// Coarse kind of a backend reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Packet id 0: a status response (or a login disconnect).
    Status,
    /// Any other packet id: login-sequence traffic.
    Login,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => f.write_str("status"),
            Self::Login => f.write_str("login"),
        }
    }
}

/// Header of a backend frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub packet_id: u32,
    pub kind: ResponseKind,
    /// Total frame length, length prefix included.
    pub frame_len: usize,
}

/// Classify the frame at the start of `buf`.
///
/// On success `next_offset` points just past the packet id.
pub fn classify_response(buf: &[u8]) -> DecodeResult<ResponseFrame> {
    let (declared, body_start) = match read_varint(buf, 0)? {
        Decoded::Complete { value, next_offset } => (value as usize, next_offset),
        Decoded::Incomplete => return Ok(Decoded::Incomplete),
    };

    if declared == 0 {
        return Err(WireError::EmptyFrame);
    }

    let frame_len = body_start.saturating_add(declared);

    let (packet_id, next_offset) = match read_varint(buf, body_start)? {
        Decoded::Complete { value, next_offset } => (value, next_offset),
        Decoded::Incomplete if buf.len() >= frame_len => {
            return Err(WireError::FieldOverrun { field: "packet_id" })
        }
        Decoded::Incomplete => return Ok(Decoded::Incomplete),
    };

    if next_offset > frame_len {
        return Err(WireError::FieldOverrun { field: "packet_id" });
    }

    let kind = if packet_id == 0 {
        ResponseKind::Status
    } else {
        ResponseKind::Login
    };

    Ok(Decoded::Complete {
        value: ResponseFrame {
            packet_id,
            kind,
            frame_len,
        },
        next_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response() {
        // Frame of 200 bytes, packet id 0, body not yet received.
        let buf = [0xc8, 0x01, 0x00, b'{'];
        let (frame, next) = classify_response(&buf).unwrap().complete().unwrap();
        assert_eq!(frame.kind, ResponseKind::Status);
        assert_eq!(frame.packet_id, 0);
        assert_eq!(frame.frame_len, 202);
        assert_eq!(next, 3);
    }

    #[test]
    fn test_login_response() {
        // Set compression: id 3, threshold 256.
        let buf = [0x03, 0x03, 0x80, 0x02];
        let (frame, _) = classify_response(&buf).unwrap().complete().unwrap();
        assert_eq!(frame.kind, ResponseKind::Login);
        assert_eq!(frame.packet_id, 3);
    }

    #[test]
    fn test_needs_packet_id() {
        assert!(classify_response(&[]).unwrap().is_incomplete());
        assert!(classify_response(&[0x05]).unwrap().is_incomplete());
        assert!(classify_response(&[0x05, 0x80]).unwrap().is_incomplete());
    }

    #[test]
    fn test_malformed_responses() {
        assert_eq!(classify_response(&[0x00]), Err(WireError::EmptyFrame));
        assert_eq!(
            classify_response(&[0x01, 0x80, 0x01]),
            Err(WireError::FieldOverrun { field: "packet_id" })
        );
        assert_eq!(
            classify_response(&[0x80, 0x80, 0x80, 0x80, 0x80]),
            Err(WireError::VarIntTooLong)
        );
    }
}
