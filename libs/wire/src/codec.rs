//! Primitive field codecs.
//!
//! VarInt layout: 7 data bits per byte, least significant group first, the
//! high bit of each byte set while more bytes follow. A 32-bit value needs at
//! most 5 bytes.

use bytes::BufMut;

use crate::{DecodeResult, Decoded, WireError};

/// Maximum encoded length of a 32-bit VarInt.
pub const MAX_VARINT_LEN: usize = 5;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Bits of the fifth byte that would fall outside 32 bits.
const FINAL_BYTE_OVERFLOW: u8 = 0xF0;

/// Read a VarInt starting at `offset`.
pub fn read_varint(buf: &[u8], offset: usize) -> DecodeResult<u32> {
    let mut value: u32 = 0;

    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = buf.get(offset.saturating_add(i)) else {
            return Ok(Decoded::Incomplete);
        };

        if i == MAX_VARINT_LEN - 1 && byte & FINAL_BYTE_OVERFLOW != 0 {
            return Err(WireError::VarIntTooLong);
        }

        value |= u32::from(byte & SEGMENT_BITS) << (7 * i);

        if byte & CONTINUE_BIT == 0 {
            return Ok(Decoded::Complete {
                value,
                next_offset: offset + i + 1,
            });
        }
    }

    Err(WireError::VarIntTooLong)
}

/// Append `value` as a VarInt. Returns the number of bytes written.
pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u32) -> usize {
    let mut written = 0;
    loop {
        written += 1;
        if value & !u32::from(SEGMENT_BITS) == 0 {
            buf.put_u8(value as u8);
            return written;
        }
        buf.put_u8((value as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        value >>= 7;
    }
}

/// Number of bytes `value` occupies as a VarInt.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Read a VarInt-length-prefixed UTF-8 string starting at `offset`.
pub fn read_string(buf: &[u8], offset: usize) -> DecodeResult<String> {
    let (len, start) = match read_varint(buf, offset)? {
        Decoded::Complete { value, next_offset } => (value as usize, next_offset),
        Decoded::Incomplete => return Ok(Decoded::Incomplete),
    };

    let Some(end) = start.checked_add(len) else {
        return Err(WireError::FieldOverrun { field: "string" });
    };
    if buf.len() < end {
        return Ok(Decoded::Incomplete);
    }

    let value = std::str::from_utf8(&buf[start..end])
        .map_err(|_| WireError::InvalidUtf8)?
        .to_owned();

    Ok(Decoded::Complete {
        value,
        next_offset: end,
    })
}

/// Append a VarInt-length-prefixed UTF-8 string. Returns the number of bytes
/// written.
///
/// Strings longer than `u32::MAX` bytes cannot be represented on the wire.
pub fn put_string<B: BufMut>(buf: &mut B, value: &str) -> usize {
    let prefix = put_varint(buf, value.len() as u32);
    buf.put_slice(value.as_bytes());
    prefix + value.len()
}

/// Read a big-endian unsigned short starting at `offset`.
pub fn read_u16(buf: &[u8], offset: usize) -> DecodeResult<u16> {
    match buf.get(offset..offset.saturating_add(2)) {
        Some(&[hi, lo]) => Ok(Decoded::Complete {
            value: u16::from_be_bytes([hi, lo]),
            next_offset: offset + 2,
        }),
        _ => Ok(Decoded::Incomplete),
    }
}
