//! Layer 1: length-delimited framing over a byte stream.
//!
//! ```text
//! [Length(4, LE)] [Container(Length)]
//! ```
//!
//! The decoder accumulates partial reads until a whole container is buffered.
//! A length outside the configured bounds can never be resynchronized and is
//! returned as a fatal error.

use crate::config::{FramingConfig, MEDIATOR_FRAME_MAX_LENGTH, MEDIATOR_FRAME_MIN_LENGTH};
use crate::core::frame::Frame;
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Length of the frame length prefix
pub const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    min_length: usize,
    max_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            min_length: MEDIATOR_FRAME_MIN_LENGTH,
            max_length: MEDIATOR_FRAME_MAX_LENGTH,
        }
    }
}

impl FrameCodec {
    pub fn from_config(config: &FramingConfig) -> Self {
        Self {
            min_length: config.min_frame_length,
            max_length: config.max_frame_length,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            if src.len() < LENGTH_PREFIX {
                return Ok(None);
            }

            let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if length < self.min_length || length > self.max_length {
                return Err(ProtocolError::InvalidFrameLength(length));
            }

            let total = LENGTH_PREFIX + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(LENGTH_PREFIX);
            let container = src.split_to(length).freeze();
            match Frame::from_container(container)? {
                Some(frame) => {
                    trace!(kind = ?frame.kind, length, "Decoded frame");
                    return Ok(Some(frame));
                }
                None => {
                    warn!(length, "Discarding frame with unknown payload type");
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = frame.container_length();
        if length > self.max_length {
            return Err(ProtocolError::OversizedFrame(length));
        }

        dst.reserve(LENGTH_PREFIX + length);
        dst.put_u32_le(length as u32);
        frame.write_container(dst);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::core::frame::D2mPayloadType;

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::default();
        let mut encoded = BytesMut::new();
        codec
            .encode(Frame::new(D2mPayloadType::Proxy, vec![1, 2, 3]), &mut encoded)
            .unwrap();

        let mut buffer = BytesMut::from(&encoded[..5]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 5);

        buffer.extend_from_slice(&encoded[5..]);
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&frame.payload[..], &[1, 2, 3]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_length_is_fatal() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::InvalidFrameLength(0))
        ));
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        buffer.put_u32_le((MEDIATOR_FRAME_MAX_LENGTH + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ProtocolError::InvalidFrameLength(_))
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        let frame = Frame::new(D2mPayloadType::Proxy, vec![0u8; MEDIATOR_FRAME_MAX_LENGTH]);
        assert!(matches!(
            codec.encode(frame, &mut buffer),
            Err(ProtocolError::OversizedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_type_skipped_between_frames() {
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        buffer.put_u32_le(5);
        buffer.extend_from_slice(&[0x7f, 0, 0, 0, 9]);
        codec
            .encode(Frame::new(D2mPayloadType::ReflectionQueueDry, vec![]), &mut buffer)
            .unwrap();

        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(frame.kind, D2mPayloadType::ReflectionQueueDry);
        assert!(frame.payload.is_empty());
    }
}
