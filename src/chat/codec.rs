//! JSON line codec: frames a TCP byte stream into client frames.
//!
//! Splits on `\n`, parses each line as a [`ClientFrame`], and serializes
//! outgoing [`Reply`]s as one JSON object per line. A line that does not
//! parse is skipped; it never ends the connection.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use super::message::{ClientFrame, Reply};

/// Maximum line length (including `\n`).
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Codec error: an oversized line, a serialization failure, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec for newline-delimited JSON frames.
#[derive(Debug, Default)]
pub struct JsonLineCodec;

impl Decoder for JsonLineCodec {
    type Item = ClientFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                // No complete line yet. Check if buffer is getting too large.
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };
            if pos >= MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            let line_bytes = src.split_to(pos);
            src.advance(1); // skip \n

            let line = line_bytes.trim_ascii();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<ClientFrame>(line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => {
                    debug!(error = %e, "discarding malformed frame");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "discarding unterminated frame at EOF");
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<Reply> for JsonLineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::{AckStatus, FrameKind};

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_complete_line() {
        let mut codec = JsonLineCodec;
        let mut buf =
            BytesMut::from("{\"type\":\"private\",\"target\":\"bob\",\"message\":\"hi\"}\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, ClientFrame::private("bob", "hi"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_line_then_complete() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(r#"{"type":"private","tar"#);

        // Not enough data yet.
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // More data arrives.
        buf.extend_from_slice(b"get\":\"bob\",\"message\":\"hi\"}\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, ClientFrame::private("bob", "hi"));
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(
            "{\"type\":\"join\",\"message\":\"ops\"}\n{\"type\":\"group\",\"target\":\"ops\",\"message\":\"x\"}\n",
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Join);

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Group);

        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_malformed_and_keeps_going() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(
            "not json\n{\"type\":\"teleport\"}\n{\"type\":\"private\",\"target\":\"bob\",\"message\":\"ok\"}\n",
        );
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, ClientFrame::private("bob", "ok"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_only_malformed_yields_nothing() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from("{broken\n");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_tolerates_crlf_and_blank_lines() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from("\r\n\n{\"type\":\"join\",\"message\":\"ops\"}\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, ClientFrame::join("ops"));
    }

    #[test]
    fn decode_rejects_oversized_line() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE_LENGTH + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong));
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_eof_discards_unterminated_tail() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::from(r#"{"type":"private","target":"bob","message":"hi"}"#);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_appends_newline() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::new();
        codec.encode(Reply::ack(AckStatus::Delivered), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{\"ack\":\"delivered\"}\n");
    }

    #[test]
    fn encode_delivery() {
        let mut codec = JsonLineCodec;
        let mut buf = BytesMut::new();
        let reply = Reply::Delivery {
            from: "alice".into(),
            message: "hi bob".into(),
            clock: 3,
        };
        codec.encode(reply, &mut buf).unwrap();
        assert_eq!(
            &buf[..],
            b"{\"from\":\"alice\",\"message\":\"hi bob\",\"clock\":3}\n"
        );
    }
}
