//! Mediator frame container.
//!
//! Every frame on the wire carries one container:
//!
//! ```text
//! [Type(1)] [Reserved(3)] [Payload(N)]
//! ```
//!
//! The type selects between a proxied CSP payload and the D2M control messages.

use crate::error::{constants, ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the container header (payload type and reserved bytes)
pub const CONTAINER_HEADER_LENGTH: usize = 4;

/// Payload type of a mediator container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum D2mPayloadType {
    Proxy = 0x00,
    ServerHello = 0x10,
    ClientHello = 0x11,
    ServerInfo = 0x12,
    ReflectionQueueDry = 0x20,
    RolePromotedToLeader = 0x21,
    GetDevicesInfo = 0x30,
    DevicesInfo = 0x31,
    DropDevice = 0x32,
    DropDeviceAck = 0x33,
    SetSharedDeviceData = 0x34,
    BeginTransaction = 0x40,
    BeginTransactionAck = 0x41,
    CommitTransaction = 0x42,
    CommitTransactionAck = 0x43,
    TransactionRejected = 0x44,
    TransactionEnded = 0x45,
    Reflect = 0x80,
    ReflectAck = 0x81,
    Reflected = 0x82,
    ReflectedAck = 0x83,
}

impl D2mPayloadType {
    /// Whether the mediator may send this payload type to a client
    pub fn is_server_to_client(self) -> bool {
        matches!(
            self,
            D2mPayloadType::Proxy
                | D2mPayloadType::ServerHello
                | D2mPayloadType::ServerInfo
                | D2mPayloadType::ReflectionQueueDry
                | D2mPayloadType::RolePromotedToLeader
                | D2mPayloadType::DevicesInfo
                | D2mPayloadType::DropDeviceAck
                | D2mPayloadType::BeginTransactionAck
                | D2mPayloadType::CommitTransactionAck
                | D2mPayloadType::TransactionRejected
                | D2mPayloadType::TransactionEnded
                | D2mPayloadType::ReflectAck
                | D2mPayloadType::Reflected
        )
    }
}

impl TryFrom<u8> for D2mPayloadType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0x00 => D2mPayloadType::Proxy,
            0x10 => D2mPayloadType::ServerHello,
            0x11 => D2mPayloadType::ClientHello,
            0x12 => D2mPayloadType::ServerInfo,
            0x20 => D2mPayloadType::ReflectionQueueDry,
            0x21 => D2mPayloadType::RolePromotedToLeader,
            0x30 => D2mPayloadType::GetDevicesInfo,
            0x31 => D2mPayloadType::DevicesInfo,
            0x32 => D2mPayloadType::DropDevice,
            0x33 => D2mPayloadType::DropDeviceAck,
            0x34 => D2mPayloadType::SetSharedDeviceData,
            0x40 => D2mPayloadType::BeginTransaction,
            0x41 => D2mPayloadType::BeginTransactionAck,
            0x42 => D2mPayloadType::CommitTransaction,
            0x43 => D2mPayloadType::CommitTransactionAck,
            0x44 => D2mPayloadType::TransactionRejected,
            0x45 => D2mPayloadType::TransactionEnded,
            0x80 => D2mPayloadType::Reflect,
            0x81 => D2mPayloadType::ReflectAck,
            0x82 => D2mPayloadType::Reflected,
            0x83 => D2mPayloadType::ReflectedAck,
            other => return Err(other),
        })
    }
}

/// A single decoded container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: D2mPayloadType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: D2mPayloadType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Length of the container this frame occupies on the wire
    #[inline]
    pub fn container_length(&self) -> usize {
        CONTAINER_HEADER_LENGTH + self.payload.len()
    }

    /// Write the container (without length prefix) into `dst`
    pub fn write_container(&self, dst: &mut BytesMut) {
        dst.reserve(self.container_length());
        dst.put_u8(self.kind as u8);
        dst.put_bytes(0, CONTAINER_HEADER_LENGTH - 1);
        dst.extend_from_slice(&self.payload);
    }

    /// Parse a container (without length prefix)
    ///
    /// Returns `Ok(None)` for a container whose payload type is unknown.
    pub fn from_container(mut container: Bytes) -> Result<Option<Self>> {
        if container.len() < CONTAINER_HEADER_LENGTH {
            return Err(ProtocolError::DecodeError(constants::ERR_INVALID_HEADER.into()));
        }
        let type_byte = container.get_u8();
        container.advance(CONTAINER_HEADER_LENGTH - 1);
        match D2mPayloadType::try_from(type_byte) {
            Ok(kind) => Ok(Some(Self {
                kind,
                payload: container,
            })),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_container_layout() {
        let frame = Frame::new(D2mPayloadType::Reflect, vec![0xaa, 0xbb]);
        let mut buf = BytesMut::new();
        frame.write_container(&mut buf);
        assert_eq!(&buf[..], &[0x80, 0, 0, 0, 0xaa, 0xbb]);

        let parsed = Frame::from_container(buf.freeze()).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_unknown_payload_type_is_skipped() {
        let container = Bytes::from_static(&[0x7f, 0, 0, 0, 1]);
        assert!(Frame::from_container(container).unwrap().is_none());
    }

    #[test]
    fn test_payload_type_direction() {
        assert!(D2mPayloadType::Reflected.is_server_to_client());
        assert!(!D2mPayloadType::Reflect.is_server_to_client());
        assert_eq!(D2mPayloadType::try_from(0x45), Ok(D2mPayloadType::TransactionEnded));
    }
}
