//! Length-prefixed framing for the bridge TCP stream.
//!
//! Every frame is a 4-byte big-endian length followed by exactly that many
//! payload bytes:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────┐
//! │ Length (4 bytes) │ UTF-8 JSON envelope      │
//! │ Big-endian i32   │ (length bytes)           │
//! └──────────────────┴──────────────────────────┘
//! ```
//!
//! The prefix is read as a signed value. A prefix of zero or below carries no
//! payload: the decoder reports it as malformed, consumes only the prefix and
//! carries on with the next four bytes.

use crate::{ProtocolError, FRAME_HEADER_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Builds a frame from raw payload bytes.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = BytesMut::new();
    FrameCodec::new().encode(Bytes::copy_from_slice(payload), &mut frame)?;
    Ok(frame.to_vec())
}

/// One unit pulled out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete payload.
    Frame(Bytes),
    /// A prefix that cannot describe a payload. Only the prefix was consumed.
    Malformed { length: i32 },
}

/// Frame codec for `FramedRead` / `FramedWrite`.
///
/// A frame is only yielded once all of its payload bytes are buffered, so
/// TCP segmentation never changes what comes out. Nothing is reserved up
/// front for an announced length; the buffer grows only as bytes arrive.
/// A stream that ends inside a frame fails with
/// [`ProtocolError::Truncated`].
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Payload length announced by a prefix whose payload is still incomplete.
    pending: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no prefix is waiting for its payload.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, ProtocolError> {
        let length = match self.pending {
            Some(length) => length,
            None => {
                if src.len() < FRAME_HEADER_LEN {
                    return Ok(None);
                }
                let length = src.get_i32();
                if length <= 0 {
                    return Ok(Some(Decoded::Malformed { length }));
                }
                length as usize
            }
        };

        if src.len() < length {
            self.pending = Some(length);
            return Ok(None);
        }

        self.pending = None;
        Ok(Some(Decoded::Frame(src.split_to(length).freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Decoded>, ProtocolError> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() && self.is_idle() {
            return Ok(None);
        }

        let header = if self.is_idle() { 0 } else { FRAME_HEADER_LEN };
        let buffered = src.len() + header;
        src.clear();
        self.pending = None;
        Err(ProtocolError::Truncated { buffered })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let length =
            i32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge(payload.len()))?;

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_i32(length);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Decoded> {
        let mut items = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            items.push(item);
        }
        items
    }

    fn frame(payload: &'static [u8]) -> Decoded {
        Decoded::Frame(Bytes::from_static(payload))
    }

    #[test]
    fn test_encode_prefix_is_big_endian() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_encode_prefix_for_multi_byte_length() {
        let payload = vec![b'a'; 0x0102];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0x01, 0x02]);
        assert_eq!(frame.len(), 4 + 0x0102);
    }

    #[test]
    fn test_decode_single_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&encode_frame(b"{\"type\":\"subtitle\"}").unwrap()[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(frame(b"{\"type\":\"subtitle\"}"))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(codec.is_idle());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_single_byte_chunks() {
        let payload = "{\"type\":\"subtitle\",\"payload\":\"请用您的视线选择一个目标。\"}";
        let bytes = encode_frame(payload.as_bytes()).unwrap();

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut items = Vec::new();
        for byte in &bytes {
            buf.extend_from_slice(std::slice::from_ref(byte));
            items.extend(decode_all(&mut codec, &mut buf));
        }

        assert_eq!(
            items,
            vec![Decoded::Frame(Bytes::copy_from_slice(payload.as_bytes()))]
        );
        assert!(codec.is_idle());
    }

    #[test]
    fn test_decode_every_split_point() {
        let bytes = encode_frame(b"split me anywhere").unwrap();

        for split in 0..=bytes.len() {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::from(&bytes[..split]);
            let mut items = decode_all(&mut codec, &mut buf);
            buf.extend_from_slice(&bytes[split..]);
            items.extend(decode_all(&mut codec, &mut buf));

            assert_eq!(items, vec![frame(b"split me anywhere")], "split at {}", split);
        }
    }

    #[test]
    fn test_decode_back_to_back_frames_in_one_chunk() {
        let mut bytes = encode_frame(b"first").unwrap();
        bytes.extend(encode_frame(b"second").unwrap());
        bytes.extend(encode_frame(b"third").unwrap());

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&bytes[..]);

        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![frame(b"first"), frame(b"second"), frame(b"third")]
        );
    }

    #[test]
    fn test_zero_prefix_is_malformed_and_skipped() {
        let mut bytes = vec![0, 0, 0, 0];
        bytes.extend(encode_frame(b"after").unwrap());

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&bytes[..]);

        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![Decoded::Malformed { length: 0 }, frame(b"after")]
        );
    }

    #[test]
    fn test_negative_prefix_consumes_no_payload() {
        let mut bytes = (-7i32).to_be_bytes().to_vec();
        bytes.extend(encode_frame(b"next").unwrap());

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&bytes[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Malformed { length: -7 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame(b"next")));
    }

    #[test]
    fn test_top_bit_prefix_is_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x80u8, 0, 0, 0][..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Malformed { length: i32::MIN })
        );
        assert!(codec.is_idle());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_prefix_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0][..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_large_prefix_does_not_preallocate() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&i32::MAX.to_be_bytes());
        buf.extend_from_slice(b"tiny");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(!codec.is_idle());
        assert!(buf.capacity() < 1024);
    }

    #[test]
    fn test_eof_between_frames_is_clean() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&encode_frame(b"last").unwrap()[..]);

        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(frame(b"last")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_eof_mid_prefix_is_truncated() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0][..]);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::Truncated { buffered: 2 })
        ));
    }

    #[test]
    fn test_eof_mid_payload_counts_header() {
        let bytes = encode_frame(b"incomplete").unwrap();
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&bytes[..7]);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(ProtocolError::Truncated { buffered: 7 })
        ));
        assert!(codec.is_idle());
    }

    #[test]
    fn test_large_payload_in_chunks() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let bytes = encode_frame(&payload).unwrap();

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut items = Vec::new();
        for chunk in bytes.chunks(4096) {
            buf.extend_from_slice(chunk);
            items.extend(decode_all(&mut codec, &mut buf));
        }

        assert_eq!(items, vec![Decoded::Frame(Bytes::from(payload))]);
    }
}
