//! The tinybus wire protocol.
//!
//! Control frames are line-delimited ASCII terminated by `\n`:
//!
//! ```text
//! HELLO <role> <node-id>\n
//! SUB <topic>\n
//! UNSUB <topic>\n
//! PUB <topic> <declared-length>\n
//! PING\n
//! BYE\n
//! ```
//!
//! A `PUB` header is followed by a 4-byte big-endian length prefix (which
//! must repeat the declared length) and exactly that many payload bytes.
//! Subscribers receive deliveries as a bare length prefix plus payload, with
//! no control line.

pub mod command;
pub mod parser;

mod error;

use byteorder::{ByteOrder, NetworkEndian};

pub use command::*;
pub use error::*;
pub use parser::*;

/// Maximum length of a control line, excluding the `\n` terminator.
pub const MAX_LINE: usize = 1024;

/// Maximum payload length of a single publish, in bytes.
pub const MAX_PAYLOAD: usize = 8192;

/// Maximum length of a topic, in bytes.
pub const MAX_TOPIC: usize = 255;

/// Maximum length of a node id, in bytes.
pub const MAX_NODE_ID: usize = 63;

/// Size of the big-endian length prefix that precedes every payload.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Frames a payload for delivery to a subscriber: a 4-byte big-endian length
/// followed by the raw payload bytes.
pub fn frame_delivery(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LEN_PREFIX_SIZE + payload.len());
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    NetworkEndian::write_u32(&mut prefix, payload.len() as u32);
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(payload);
    buf
}

/// Frames a complete wire-level `PUB` transmission: the ASCII header line,
/// the 4-byte big-endian length prefix, and the payload bytes, as one
/// contiguous buffer.
pub fn frame_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!("PUB {} {}\n", topic, payload.len());
    let mut buf = Vec::with_capacity(header.len() + LEN_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(header.as_bytes());
    let mut prefix = [0u8; LEN_PREFIX_SIZE];
    NetworkEndian::write_u32(&mut prefix, payload.len() as u32);
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(payload);
    buf
}
