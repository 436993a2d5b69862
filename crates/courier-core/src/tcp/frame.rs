//! Length-prefixed frames
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ length: u32 (BE)     │ payload: length bytes        │
//! └──────────────────────┴──────────────────────────────┘
//! response: single byte 0x01
//! ```
//!
//! The declared length is checked against [`MAX_FRAME_SIZE`] before any
//! payload buffer is reserved. Zero-length frames are rejected too.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::CourierError;

/// Largest accepted payload (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Acknowledgment written after each delivered frame
pub const ACK_BYTE: u8 = 0x01;

/// Codec for `[u32 BE length][payload]` frames.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max: usize,
}

impl FrameCodec {
    /// Codec enforcing [`MAX_FRAME_SIZE`]
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    /// Codec with a custom payload cap
    pub fn with_max_frame(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max)
                .new_codec(),
            max,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn protocol(e: std::io::Error) -> CourierError {
    if e.kind() == std::io::ErrorKind::InvalidData {
        CourierError::Protocol(e.to_string())
    } else {
        CourierError::Io(e)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CourierError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CourierError> {
        match self.inner.decode(src).map_err(protocol)? {
            Some(frame) if frame.is_empty() => {
                Err(CourierError::Protocol("zero-length frame".to_string()))
            }
            Some(frame) => Ok(Some(frame.freeze())),
            None => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CourierError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), CourierError> {
        if item.is_empty() {
            return Err(CourierError::Param("cannot send an empty frame".to_string()));
        }
        if item.len() > self.max {
            return Err(CourierError::Param(format!(
                "frame of {} bytes exceeds {}",
                item.len(),
                self.max
            )));
        }
        self.inner.encode(item, dst).map_err(CourierError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn header(len: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(len);
        buf
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = header(5);
        buf.put_slice(b"hel");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(b"lo");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_header_rejected_before_payload() {
        let mut codec = FrameCodec::new();
        let mut buf = header(MAX_FRAME_SIZE as u32 + 1);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CourierError::Protocol(_)));
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = header(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CourierError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_writes_big_endian_length() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut dst).unwrap();
        assert_eq!(&dst[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        assert!(matches!(
            codec.encode(Bytes::new(), &mut dst),
            Err(CourierError::Param(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let mut codec = FrameCodec::with_max_frame(4);
        let mut dst = BytesMut::new();
        assert!(matches!(
            codec.encode(Bytes::from_static(b"12345"), &mut dst),
            Err(CourierError::Param(_))
        ));
    }
}
