//! Length-prefixed JSON framing.
//!
//! Frame grammar: `u32 BE length L` + `L` bytes of JSON. Bounds enforced
//! here: `0 < L <= MAX_FRAME_BYTES`, total buffered bytes capped at
//! `MAX_BUFFER_BYTES`. A zero length is tolerated (header skipped, stream
//! continues); an oversize length is unrecoverable because the stream can no
//! longer be resynchronized, so it surfaces as a hard error and the caller
//! closes the connection.
//!
//! Malformed JSON inside a well-framed message is *not* a framing error: the
//! frame is consumed and reported as [`DecodedFrame::Malformed`] so the
//! connection can answer with an error reply and keep going.

use {
    bytes::{Buf, BufMut, BytesMut},
    tokio_util::codec::{Decoder, Encoder},
};

use crate::{Envelope, MAX_BUFFER_BYTES, MAX_FRAME_BYTES};

const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds maximum {max}")]
    Oversize { len: usize, max: usize },

    #[error("receive buffer overflow ({len} bytes)")]
    BufferOverflow { len: usize },

    #[error("outbound message of {len} bytes exceeds frame maximum {max}")]
    OutboundTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialize reply: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One decoded inbound frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A well-formed envelope.
    Envelope(Envelope),
    /// Framing was fine but the payload was not a JSON object; carries a
    /// display-safe reason.
    Malformed { reason: String },
}

/// Codec for the length-prefixed JSON wire format.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = DecodedFrame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() > MAX_BUFFER_BYTES {
                let len = src.len();
                src.clear();
                return Err(FrameError::BufferOverflow { len });
            }

            if src.len() < LENGTH_PREFIX_BYTES {
                return Ok(None);
            }

            let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
            prefix.copy_from_slice(&src[..LENGTH_PREFIX_BYTES]);
            let len = u32::from_be_bytes(prefix) as usize;

            if len == 0 {
                // Tolerated: drop the header and keep scanning.
                src.advance(LENGTH_PREFIX_BYTES);
                continue;
            }

            if len > MAX_FRAME_BYTES {
                src.clear();
                return Err(FrameError::Oversize {
                    len,
                    max: MAX_FRAME_BYTES,
                });
            }

            if src.len() < LENGTH_PREFIX_BYTES + len {
                src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_PREFIX_BYTES);
            let payload = src.split_to(len);

            let frame = match serde_json::from_slice::<serde_json::Value>(&payload) {
                Ok(serde_json::Value::Object(_)) => {
                    match serde_json::from_slice::<Envelope>(&payload) {
                        Ok(env) => DecodedFrame::Envelope(env),
                        Err(_) => DecodedFrame::Malformed {
                            reason: "Missing action field".into(),
                        },
                    }
                },
                Ok(_) => DecodedFrame::Malformed {
                    reason: "JSON must be an object".into(),
                },
                Err(_) => DecodedFrame::Malformed {
                    reason: "Invalid JSON format".into(),
                },
            };
            return Ok(Some(frame));
        }
    }
}

impl Encoder<serde_json::Value> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(
        &mut self,
        item: serde_json::Value,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(FrameError::OutboundTooLarge {
                len: payload.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        dst.reserve(LENGTH_PREFIX_BYTES + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(json: &str) -> Vec<u8> {
        let mut out = (json.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(json.as_bytes());
        out
    }

    fn decode_all(bytes: &[u8]) -> Vec<DecodedFrame> {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn decodes_single_frame() {
        let frames = decode_all(&frame_bytes(r#"{"action":"heartbeat"}"#));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DecodedFrame::Envelope(env) => assert_eq!(env.action, "heartbeat"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_messages_in_order_for_every_chunk_boundary() {
        // The decoder must be insensitive to how the stream is sliced into
        // reads: feed two concatenated frames split at every byte position.
        let mut stream = frame_bytes(r#"{"action":"login","request_id":"a"}"#);
        stream.extend_from_slice(&frame_bytes(r#"{"action":"logout","request_id":"b"}"#));

        for split in 0..=stream.len() {
            let mut codec = EnvelopeCodec;
            let mut buf = BytesMut::new();
            let mut actions = Vec::new();

            for chunk in [&stream[..split], &stream[split..]] {
                buf.extend_from_slice(chunk);
                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    match frame {
                        DecodedFrame::Envelope(env) => actions.push(env.action),
                        other => panic!("unexpected frame at split {split}: {other:?}"),
                    }
                }
            }
            assert_eq!(actions, ["login", "logout"], "split at byte {split}");
        }
    }

    #[test]
    fn zero_length_header_is_skipped() {
        let mut bytes = 0u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&frame_bytes(r#"{"action":"heartbeat"}"#));
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn oversize_length_is_a_hard_error_and_emits_nothing() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(65_537u32).to_be_bytes());
        buf.extend_from_slice(b"garbage");

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::Oversize { len: 65_537, .. }));
        assert!(buf.is_empty(), "buffer must be cleared");
    }

    #[test]
    fn max_size_frame_is_accepted() {
        let filler = "x".repeat(MAX_FRAME_BYTES - r#"{"action":""}"#.len());
        let json = format!(r#"{{"action":"{filler}"}}"#);
        assert_eq!(json.len(), MAX_FRAME_BYTES);
        let frames = decode_all(&frame_bytes(&json));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn invalid_json_consumes_frame_and_reports_malformed() {
        let mut bytes = frame_bytes("{not json");
        bytes.extend_from_slice(&frame_bytes(r#"{"action":"heartbeat"}"#));
        let frames = decode_all(&bytes);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], DecodedFrame::Malformed { .. }));
        assert!(matches!(frames[1], DecodedFrame::Envelope(_)));
    }

    #[test]
    fn non_object_json_reports_malformed() {
        let frames = decode_all(&frame_bytes("[1,2,3]"));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            DecodedFrame::Malformed { reason } => {
                assert_eq!(reason, "JSON must be an object");
            },
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn incomplete_frame_waits_for_more_data() {
        let bytes = frame_bytes(r#"{"action":"heartbeat"}"#);
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[bytes.len() - 1..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn encoder_prefixes_length_and_roundtrips() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        let value = serde_json::json!({"action": "heartbeat_response", "timestamp": 1});
        codec.encode(value, &mut buf).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let frames = decode_all(&buf);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn encoder_rejects_oversize_payload() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        let value = serde_json::json!({"blob": "y".repeat(MAX_FRAME_BYTES)});
        let err = codec.encode(value, &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::OutboundTooLarge { .. }));
    }
}
