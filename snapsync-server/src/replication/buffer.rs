//! Chunk assembly for the snapshot stream
//!
//! Pairs are staged into a worker-owned buffer and moved into the
//! destination link's output as one frame:
//! `"mset"`, the decimal payload size, then the raw payload.

use super::encoding::put_value;
use bytes::BytesMut;

/// Command token that opens every chunk
pub const CHUNK_COMMAND: &[u8] = b"mset";

/// Sentinel written once the whole snapshot has been streamed
pub const COMPLETE_TOKEN: &[u8] = b"complete";

/// Initial capacity of a staging buffer
pub const STAGING_INITIAL_CAPACITY: usize = 8 * 1024;

/// Staging buffers that grew beyond this are reallocated after a flush
const STAGING_RETAIN_LIMIT: usize = 64 * 1024;

/// Create an empty staging buffer
pub fn staging_buffer() -> BytesMut {
    BytesMut::with_capacity(STAGING_INITIAL_CAPACITY)
}

/// Append one encoded key/value pair to the staging buffer
pub fn append_pair(staging: &mut BytesMut, key: &[u8], value: &[u8]) {
    put_value(staging, key);
    put_value(staging, value);
}

/// Move the staging buffer into `dest` behind its size token
///
/// Returns the payload size. An empty staging buffer produces a `"0"` size
/// token and no payload.
pub fn flush_chunk(dest: &mut BytesMut, staging: &mut BytesMut) -> usize {
    let size = staging.len();
    put_value(dest, size.to_string().as_bytes());
    dest.extend_from_slice(staging);

    staging.clear();
    if staging.capacity() > STAGING_RETAIN_LIMIT {
        *staging = staging_buffer();
    }

    size
}

/// Write a complete chunk frame (command token + sized payload) into `dest`
pub fn write_chunk(dest: &mut BytesMut, staging: &mut BytesMut) -> usize {
    put_value(dest, CHUNK_COMMAND);
    flush_chunk(dest, staging)
}
