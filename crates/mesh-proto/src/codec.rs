//! tokio-util codec for `\r\n`-framed wire lines.
//!
//! Inbound lines longer than [`MAX_LINE_LEN`](crate::MAX_LINE_LEN) and
//! unparseable lines are decode errors; the connection they arrived on is
//! not worth keeping. Blank lines between messages are skipped.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{EncodeError, ParseError};
use crate::message::Message;
use crate::MAX_LINE_LEN;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line exceeds the {MAX_LINE_LEN} byte limit")]
    LineTooLong,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Frames [`Message`]s over a byte stream.
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Offset up to which the buffer has already been scanned for `\n`.
    scanned: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            let newline = src[self.scanned..].iter().position(|&b| b == b'\n');

            let Some(offset) = newline else {
                self.scanned = src.len();
                if src.len() > MAX_LINE_LEN {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            if end + 1 > MAX_LINE_LEN {
                return Err(CodecError::LineTooLong);
            }

            let line = src.split_to(end + 1);
            self.scanned = 0;

            // 8-bit input is tolerated; undecodable bytes are replaced
            // rather than dropped so the frame structure survives.
            let text = String::from_utf8_lossy(&line[..end]);
            let text = text.trim_end_matches('\r');

            if text.is_empty() {
                continue;
            }

            return Ok(Some(text.parse::<Message>()?));
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let line = msg.encode()?;
        dst.reserve(line.len());
        dst.put_slice(line.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(_codec: &mut MessageCodec, buf: &mut BytesMut, bytes: &[u8]) {
        buf.extend_from_slice(bytes);
    }

    #[test]
    fn decodes_complete_lines() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        feed(&mut codec, &mut buf, b"PING hub.example\r\nPONG a b\r\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command, "PING");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, "PONG");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_partial_line() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        feed(&mut codec, &mut buf, b"PRIVMSG #x :hel");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        feed(&mut codec, &mut buf, b"lo\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.param(1), Some("hello"));
    }

    #[test]
    fn skips_blank_lines() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        feed(&mut codec, &mut buf, b"\r\n\r\nPING x\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn oversized_line_is_fatal() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        let mut long = vec![b'a'; MAX_LINE_LEN + 10];
        long.extend_from_slice(b"\r\n");
        feed(&mut codec, &mut buf, &long);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong)
        ));
    }

    #[test]
    fn bare_lf_accepted() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        feed(&mut codec, &mut buf, b"PING x\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "PING");
    }

    #[test]
    fn encodes_with_crlf() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::new("ERROR", ["Closing Link"]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"ERROR :Closing Link\r\n");
    }
}
