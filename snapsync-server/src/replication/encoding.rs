//! Length/value encoding used on the snapshot stream
//!
//! Lengths use the variable-size prefix of the Redis RDB format:
//! - `00xxxxxx` - 6 bit length in one byte
//! - `01xxxxxx xxxxxxxx` - 14 bit length, big-endian
//! - `0x80` + 4 bytes - 32 bit big-endian length
//! - `0x81` + 8 bytes - 64 bit big-endian length

use bytes::{BufMut, BytesMut};
use thiserror::Error;

const LEN_6BIT: u8 = 0;
const LEN_14BIT: u8 = 1;
const LEN_32BIT: u8 = 0x80;
const LEN_64BIT: u8 = 0x81;

/// Errors raised while decoding a length or value on the replica side
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown length marker: {0:#04x}")]
    InvalidMarker(u8),

    #[error("Length {0} does not fit in memory")]
    TooLarge(u64),
}

/// Append the length prefix for `len` to `buf`
pub fn put_length(buf: &mut BytesMut, len: u64) {
    if len < (1 << 6) {
        buf.put_u8((len as u8) | (LEN_6BIT << 6));
    } else if len < (1 << 14) {
        buf.put_u8(((len >> 8) as u8) | (LEN_14BIT << 6));
        buf.put_u8(len as u8);
    } else if len <= u32::MAX as u64 {
        buf.put_u8(LEN_32BIT);
        buf.put_u32(len as u32);
    } else {
        buf.put_u8(LEN_64BIT);
        buf.put_u64(len);
    }
}

/// Append `encode_value(value)` to `buf`
pub fn put_value(buf: &mut BytesMut, value: &[u8]) {
    put_length(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Encode a length prefix
pub fn encode_length(len: u64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(9);
    put_length(&mut buf, len);
    buf.to_vec()
}

/// Encode a byte string as length prefix followed by the raw bytes
pub fn encode_value(value: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(value.len() + 9);
    put_value(&mut buf, value);
    buf.to_vec()
}

/// Decode a length prefix, returning the length and the number of bytes consumed
pub fn decode_length(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    let first = *buf.first().ok_or(EncodingError::Truncated {
        needed: 1,
        available: 0,
    })?;

    match first >> 6 {
        0 => Ok(((first & 0x3f) as u64, 1)),
        1 => {
            let second = *buf.get(1).ok_or(EncodingError::Truncated {
                needed: 2,
                available: buf.len(),
            })?;
            Ok(((((first & 0x3f) as u64) << 8) | second as u64, 2))
        }
        _ => match first {
            LEN_32BIT => {
                let raw = fixed::<4>(buf)?;
                Ok((u32::from_be_bytes(raw) as u64, 5))
            }
            LEN_64BIT => {
                let raw = fixed::<8>(buf)?;
                Ok((u64::from_be_bytes(raw), 9))
            }
            other => Err(EncodingError::InvalidMarker(other)),
        },
    }
}

/// Decode a length-prefixed value, returning the payload and the number of bytes consumed
pub fn decode_value(buf: &[u8]) -> Result<(&[u8], usize), EncodingError> {
    let (len, header) = decode_length(buf)?;
    let len = usize::try_from(len).map_err(|_| EncodingError::TooLarge(len))?;
    let end = header
        .checked_add(len)
        .ok_or(EncodingError::TooLarge(len as u64))?;

    if buf.len() < end {
        return Err(EncodingError::Truncated {
            needed: end,
            available: buf.len(),
        });
    }

    Ok((&buf[header..end], end))
}

fn fixed<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    buf.get(1..1 + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(EncodingError::Truncated {
            needed: 1 + N,
            available: buf.len(),
        })
}
