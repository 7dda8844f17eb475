//! Block protocol shared by the control link and the replica handshake
//!
//! A block is a sequence of tokens, each written as its decimal length,
//! a newline, the raw bytes and another newline. An empty line ends the block.
pub mod block;

pub use block::{MAX_TOKEN_SIZE, ProtocolError, encode_block, parse_block};
