//! Parse and encode errors.

use thiserror::Error;

/// Errors produced while parsing a wire line into a [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,

    /// The command was not all-alphabetic or exactly three digits.
    #[error("invalid command at position {position}")]
    InvalidCommand { position: usize },

    #[error("malformed message at position {position}")]
    Malformed { position: usize },
}

/// Errors produced while serializing a [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The encoded line (including `\r\n`) would exceed [`MAX_LINE_LEN`](crate::MAX_LINE_LEN).
    #[error("encoded message is {0} bytes, over the 512-byte limit")]
    TooLong(usize),
}
