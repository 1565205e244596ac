//! Owned message type: parsing, construction, serialization.

use std::fmt;
use std::str::FromStr;

use crate::error::{EncodeError, ParseError};
use crate::parser::parse_line;
use crate::MAX_LINE_LEN;

/// A single wire message: `[:prefix] COMMAND [param ...] [:trailing]`.
///
/// The prefix is opaque. On a server link it is a SID or UID; on a client
/// connection it is a server name or `nick!user@host` mask. Commands are
/// stored as received; compare them case-insensitively (`ASCII` uppercase),
/// never the identifiers in the parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no prefix.
    pub fn new<C, I, P>(command: C, params: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Message {
            prefix: None,
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach a prefix (builder style).
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// The command, uppercased for dispatch.
    pub fn command_upper(&self) -> String {
        self.command.to_ascii_uppercase()
    }

    /// Parameter at `i`, if present.
    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }

    /// True when the command is a three-digit numeric.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.chars().all(|c| c.is_ascii_digit())
    }

    /// Encoded length in bytes, including the `\r\n` terminator.
    pub fn encoded_len(&self) -> usize {
        let mut len = 2; // CRLF
        if let Some(prefix) = &self.prefix {
            len += 1 + prefix.len() + 1; // ':' prefix ' '
        }
        len += self.command.len();
        for (i, param) in self.params.iter().enumerate() {
            len += 1 + param.len();
            if i == self.params.len() - 1 && needs_trailing(param) {
                len += 1;
            }
        }
        len
    }

    /// Serialize to a complete wire line ending in `\r\n`.
    ///
    /// Fails when the encoded form would exceed [`MAX_LINE_LEN`].
    pub fn encode(&self) -> Result<String, EncodeError> {
        let len = self.encoded_len();
        if len > MAX_LINE_LEN {
            return Err(EncodeError::TooLong(len));
        }
        Ok(format!("{}\r\n", self))
    }
}

/// A final parameter must carry the `:` marker when it is empty, contains a
/// space, or itself begins with `:`.
fn needs_trailing(param: &str) -> bool {
    param.is_empty() || param.contains(' ') || param.starts_with(':')
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1 && needs_trailing(param) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = parse_line(s)?;
        Ok(Message {
            prefix: line.prefix.map(str::to_owned),
            command: line.command.to_owned(),
            params: line.params.into_iter().map(str::to_owned).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_display() {
        let msg = Message::new("UID", ["alice", "1", "1000", "+i", "alice", "host.example", "0", "2AAAAAAAB", "Alice Real"])
            .with_prefix("2AA");
        assert_eq!(
            msg.to_string(),
            ":2AA UID alice 1 1000 +i alice host.example 0 2AAAAAAAB :Alice Real"
        );
    }

    #[test]
    fn trailing_marker_only_when_needed() {
        let msg = Message::new("PART", ["#x"]);
        assert_eq!(msg.to_string(), "PART #x");

        let msg = Message::new("QUIT", [""]);
        assert_eq!(msg.to_string(), "QUIT :");

        let msg = Message::new("PRIVMSG", ["#x", ":)"]);
        assert_eq!(msg.to_string(), "PRIVMSG #x ::)");
    }

    #[test]
    fn encoded_len_matches_display() {
        let msg = Message::new("SJOIN", ["500", "#x", "+ns", "2AAAAAAAB 2AAAAAAAC"]).with_prefix("2AA");
        assert_eq!(msg.encoded_len(), msg.to_string().len() + 2);
    }

    #[test]
    fn encode_enforces_limit() {
        let long = "x".repeat(600);
        let msg = Message::new("PRIVMSG", ["#c", long.as_str()]);
        assert!(matches!(msg.encode(), Err(EncodeError::TooLong(_))));

        let ok = Message::new("PING", ["hub.example"]);
        assert_eq!(ok.encode().unwrap(), "PING hub.example\r\n");
    }

    #[test]
    fn parse_roundtrip_semantics() {
        let msg: Message = ":2AA TB #x 800 setter!u@h :the topic".parse().unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("2AA"));
        assert_eq!(msg.command, "TB");
        assert_eq!(msg.param(3), Some("the topic"));

        let reparsed: Message = msg.to_string().parse().unwrap();
        assert_eq!(reparsed, msg);
    }

    #[test]
    fn numeric_detection() {
        let msg: Message = ":2AA 311 9ZZAAAAAA alice alice host.example * :Alice".parse().unwrap();
        assert!(msg.is_numeric());
        assert!(!Message::new("PING", ["x"]).is_numeric());
    }
}
