//! mesh-proto - wire protocol for TS6-style IRC server links.
//!
//! Parses and serializes single-line messages of the shape
//! `[:prefix] COMMAND [param ...] [:trailing]`, and provides the
//! protocol-level helpers a TS6 daemon needs: RFC 1459 case-mapping,
//! identifier validation (SIDs, UIDs, nicknames, channel names),
//! wildcard mask matching for bans, and numeric reply constants.
//!
//! Prefixes are kept as opaque strings: on a server link the prefix is a
//! SID or UID and is routed, compared, and forwarded verbatim rather than
//! interpreted.

pub mod casemap;
#[cfg(feature = "tokio")]
pub mod codec;
pub mod error;
pub mod message;
mod parser;
pub mod response;
pub mod util;
pub mod valid;

pub use casemap::{irc_eq, irc_to_lower};
pub use error::{EncodeError, ParseError};
pub use message::Message;
pub use util::wildcard_match;

/// Maximum encoded length of a wire line, including the `\r\n` terminator.
pub const MAX_LINE_LEN: usize = 512;
