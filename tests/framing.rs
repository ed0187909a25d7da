//! Layer 1 framing over arbitrarily split reads

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use mdev_protocol::core::codec::FrameCodec;
use mdev_protocol::core::frame::{D2mPayloadType, Frame};
use mdev_protocol::error::ProtocolError;
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn encode_all(payloads: &[Vec<u8>]) -> BytesMut {
    let mut codec = FrameCodec::default();
    let mut wire = BytesMut::new();
    for payload in payloads {
        codec
            .encode(Frame::new(D2mPayloadType::Proxy, payload.clone()), &mut wire)
            .unwrap();
    }
    wire
}

proptest! {
    #[test]
    fn prop_frames_survive_any_read_split(
        payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8),
        chunk in 1usize..97,
    ) {
        let wire = encode_all(&payloads);
        let mut codec = FrameCodec::default();
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();

        for piece in wire.chunks(chunk) {
            buffer.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buffer).unwrap() {
                prop_assert_eq!(frame.kind, D2mPayloadType::Proxy);
                decoded.push(frame.payload.to_vec());
            }
        }

        prop_assert_eq!(decoded, payloads);
        prop_assert!(buffer.is_empty());
    }

    #[test]
    fn prop_short_length_prefix_is_fatal(length in 0u32..4) {
        let mut buffer = BytesMut::from(&length.to_le_bytes()[..]);
        buffer.extend_from_slice(&[0u8; 8]);
        let result = FrameCodec::default().decode(&mut buffer);
        prop_assert!(matches!(result, Err(ProtocolError::InvalidFrameLength(l)) if l == length as usize));
    }
}

#[test]
fn test_oversized_frame_rejected_on_encode() {
    let mut codec = FrameCodec::default();
    let mut wire = BytesMut::new();
    let frame = Frame::new(D2mPayloadType::Proxy, vec![0u8; 70_000]);
    assert!(matches!(
        codec.encode(frame, &mut wire),
        Err(ProtocolError::OversizedFrame(_))
    ));
    assert!(wire.is_empty());
}
