//! Defines error types and their wire replies.

use thiserror::Error;

use super::Reply;

/// A generic protocol error.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A control line reached the length limit without a terminator.
    #[error("control line too long")]
    LineTooLong,
    /// A control line contained bytes that are not valid UTF-8.
    #[error("control line is not valid UTF-8")]
    InvalidEncoding,
    /// A command keyword the service does not understand.
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    /// A command line was missing a required argument.
    #[error("missing {0} argument")]
    MissingArgument(&'static str),
    /// A topic longer than the protocol allows.
    #[error("topic too long")]
    TopicTooLong,
    /// A node id longer than the protocol allows.
    #[error("node id too long")]
    NodeIdTooLong,
    /// The declared length of a `PUB` header was not a decimal number.
    #[error("malformed payload length: {0:?}")]
    MalformedLength(String),
    /// The declared length of a `PUB` header was out of range.
    #[error("payload length {0} out of range")]
    PayloadOutOfRange(i64),
    /// The 4-byte length prefix disagreed with the header line.
    #[error("length prefix {prefix} does not match declared length {declared}")]
    LengthMismatch {
        /// Length from the `PUB` header line.
        declared: u32,
        /// Length decoded from the 4-byte big-endian prefix.
        prefix: u32,
    },
    /// The connection's input buffer filled up without parser progress.
    #[error("input buffer overflow")]
    InputOverflow,
    /// An I/O error occurred on the connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// The reply to send to the peer before closing the connection, if the
    /// error warrants one. Transport-level failures close silently.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            ProtocolError::LineTooLong
            | ProtocolError::InvalidEncoding
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::MissingArgument(_)
            | ProtocolError::TopicTooLong
            | ProtocolError::NodeIdTooLong
            | ProtocolError::MalformedLength(_) => Some(Reply::Proto),
            ProtocolError::PayloadOutOfRange(_) => Some(Reply::Overflow),
            ProtocolError::LengthMismatch { .. } => Some(Reply::Len),
            ProtocolError::InputOverflow | ProtocolError::Io(_) => None,
        }
    }
}
