//! Replica-side decoding of the snapshot stream

use super::buffer::{CHUNK_COMMAND, COMPLETE_TOKEN};
use super::encoding::{EncodingError, decode_value};
use crate::protocol::MAX_TOKEN_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Largest chunk payload accepted from a peer
pub const MAX_CHUNK_SIZE: usize = MAX_TOKEN_SIZE;

/// One decoded unit of the snapshot stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotFrame {
    /// An `mset` chunk with its pairs in stream order
    Chunk(Vec<(Bytes, Bytes)>),
    /// The `complete` sentinel
    Complete,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Unexpected token: {0:?}")]
    UnexpectedToken(String),

    #[error("Invalid chunk size: {0:?}")]
    InvalidSize(String),

    #[error("Chunk payload ends inside a key/value pair")]
    TrailingPair,
}

/// Incremental decoder for `mset` chunks and the `complete` sentinel
#[derive(Debug, Default)]
pub struct StreamDecoder {
    frames: u64,
    pairs: u64,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames decoded so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Pairs decoded so far
    pub fn pairs(&self) -> u64 {
        self.pairs
    }

    /// Decode the next frame from `buf`, consuming its bytes
    ///
    /// Returns `Ok(None)` without consuming anything when the frame is not
    /// complete yet.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<SnapshotFrame>, StreamError> {
        let (command, command_len) = match decode_value(buf) {
            Ok(token) => token,
            Err(EncodingError::Truncated { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if command == COMPLETE_TOKEN {
            buf.advance(command_len);
            self.frames += 1;
            return Ok(Some(SnapshotFrame::Complete));
        }
        if command != CHUNK_COMMAND {
            return Err(StreamError::UnexpectedToken(
                String::from_utf8_lossy(command).into_owned(),
            ));
        }

        let (size_token, size_len) = match decode_value(&buf[command_len..]) {
            Ok(token) => token,
            Err(EncodingError::Truncated { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size: usize = std::str::from_utf8(size_token)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                StreamError::InvalidSize(String::from_utf8_lossy(size_token).into_owned())
            })?;

        if size > MAX_CHUNK_SIZE {
            return Err(StreamError::InvalidSize(size.to_string()));
        }
        let header = command_len + size_len;
        let frame_len = header
            .checked_add(size)
            .ok_or_else(|| StreamError::InvalidSize(size.to_string()))?;
        if buf.len() < frame_len {
            return Ok(None);
        }

        buf.advance(header);
        let payload = buf.split_to(size).freeze();
        let pairs = decode_pairs(&payload)?;

        self.frames += 1;
        self.pairs += pairs.len() as u64;
        Ok(Some(SnapshotFrame::Chunk(pairs)))
    }
}

fn decode_pairs(payload: &Bytes) -> Result<Vec<(Bytes, Bytes)>, StreamError> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    while pos < payload.len() {
        let (key_start, key_end, next) = span(payload, pos)?;
        if next >= payload.len() {
            return Err(StreamError::TrailingPair);
        }
        let (value_start, value_end, next) = span(payload, next)?;

        pairs.push((
            payload.slice(key_start..key_end),
            payload.slice(value_start..value_end),
        ));
        pos = next;
    }

    Ok(pairs)
}

/// Locate the value encoded at `pos`: (start, end, position after it)
fn span(payload: &Bytes, pos: usize) -> Result<(usize, usize, usize), StreamError> {
    let (value, used) = decode_value(&payload[pos..]).map_err(|e| match e {
        EncodingError::Truncated { .. } => StreamError::TrailingPair,
        other => StreamError::Encoding(other),
    })?;
    let start = pos + used - value.len();
    Ok((start, pos + used, pos + used))
}
