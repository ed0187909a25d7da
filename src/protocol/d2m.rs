//! D2M control messages exchanged with the mediator.
//!
//! Reflection messages use a fixed little-endian layout with a leading header length so
//! the header can grow without breaking older readers. Everything else is a bincode
//! encoded struct.

use crate::config::MEDIATOR_FRAME_MAX_LENGTH;
use crate::core::frame::{D2mPayloadType, Frame};
use crate::error::{ProtocolError, Result};
use crate::protocol::flags::D2mMessageFlags;
use crate::protocol::wire::{ensure, read_u16, read_u32, read_u64, read_u8};
use crate::types::DeviceId;
use bincode::Options;
use bytes::{Bytes, BytesMut, BufMut};
use serde::{Deserialize, Serialize};

const REFLECT_HEADER_LENGTH: u8 = 8;
const REFLECTED_HEADER_LENGTH: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub version: u32,
    /// Ephemeral server key the challenge response is encrypted towards
    pub esk: [u8; 32],
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSlotsExhaustedPolicy {
    Reject,
    DropLeastRecent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSlotExpirationPolicy {
    Volatile,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSlotState {
    New,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub version: u32,
    pub response: Vec<u8>,
    pub device_id: DeviceId,
    pub device_slots_exhausted_policy: DeviceSlotsExhaustedPolicy,
    pub device_slot_expiration_policy: DeviceSlotExpirationPolicy,
    pub expected_device_slot_state: DeviceSlotState,
    pub encrypted_device_info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Milliseconds since the Unix epoch
    pub current_time: u64,
    pub max_device_slots: u32,
    pub device_slot_state: DeviceSlotState,
    pub encrypted_shared_device_data: Vec<u8>,
    pub reflection_queue_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentedDeviceInfo {
    pub device_id: DeviceId,
    pub encrypted_device_info: Vec<u8>,
    pub last_login_at: u64,
    pub device_slot_expiration_policy: DeviceSlotExpirationPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicesInfo {
    pub augmented_device_info: Vec<AugmentedDeviceInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropDevice {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropDeviceAck {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSharedDeviceData {
    pub encrypted_shared_device_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginTransaction {
    pub encrypted_scope: Vec<u8>,
    /// Seconds until the mediator aborts the transaction, 0 for the default
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRejected {
    pub device_id: DeviceId,
    pub encrypted_scope: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEnded {
    pub device_id: DeviceId,
    pub encrypted_scope: Vec<u8>,
}

/// Envelope reflected to the other devices, encrypted with the reflect key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflect {
    pub flags: D2mMessageFlags,
    pub reflect_id: u32,
    pub envelope: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectAck {
    pub reflect_id: u32,
    /// Milliseconds since the Unix epoch at which the mediator stored the reflection
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reflected {
    pub flags: D2mMessageFlags,
    pub reflect_id: u32,
    pub timestamp: u64,
    pub envelope: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReflectedAck {
    pub reflect_id: u32,
}

/// All D2M messages except PROXY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum D2mMessage {
    ServerHello(ServerHello),
    ClientHello(ClientHello),
    ServerInfo(ServerInfo),
    ReflectionQueueDry,
    RolePromotedToLeader,
    GetDevicesInfo,
    DevicesInfo(DevicesInfo),
    DropDevice(DropDevice),
    DropDeviceAck(DropDeviceAck),
    SetSharedDeviceData(SetSharedDeviceData),
    BeginTransaction(BeginTransaction),
    BeginTransactionAck,
    CommitTransaction,
    CommitTransactionAck,
    TransactionRejected(TransactionRejected),
    TransactionEnded(TransactionEnded),
    Reflect(Reflect),
    ReflectAck(ReflectAck),
    Reflected(Reflected),
    ReflectedAck(ReflectedAck),
}

/// Bincode with its legacy layout, capped at the largest frame
fn decode_struct<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    Ok(bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MEDIATOR_FRAME_MAX_LENGTH as u64)
        .deserialize(payload)?)
}

impl D2mMessage {
    pub fn payload_type(&self) -> D2mPayloadType {
        match self {
            D2mMessage::ServerHello(_) => D2mPayloadType::ServerHello,
            D2mMessage::ClientHello(_) => D2mPayloadType::ClientHello,
            D2mMessage::ServerInfo(_) => D2mPayloadType::ServerInfo,
            D2mMessage::ReflectionQueueDry => D2mPayloadType::ReflectionQueueDry,
            D2mMessage::RolePromotedToLeader => D2mPayloadType::RolePromotedToLeader,
            D2mMessage::GetDevicesInfo => D2mPayloadType::GetDevicesInfo,
            D2mMessage::DevicesInfo(_) => D2mPayloadType::DevicesInfo,
            D2mMessage::DropDevice(_) => D2mPayloadType::DropDevice,
            D2mMessage::DropDeviceAck(_) => D2mPayloadType::DropDeviceAck,
            D2mMessage::SetSharedDeviceData(_) => D2mPayloadType::SetSharedDeviceData,
            D2mMessage::BeginTransaction(_) => D2mPayloadType::BeginTransaction,
            D2mMessage::BeginTransactionAck => D2mPayloadType::BeginTransactionAck,
            D2mMessage::CommitTransaction => D2mPayloadType::CommitTransaction,
            D2mMessage::CommitTransactionAck => D2mPayloadType::CommitTransactionAck,
            D2mMessage::TransactionRejected(_) => D2mPayloadType::TransactionRejected,
            D2mMessage::TransactionEnded(_) => D2mPayloadType::TransactionEnded,
            D2mMessage::Reflect(_) => D2mPayloadType::Reflect,
            D2mMessage::ReflectAck(_) => D2mPayloadType::ReflectAck,
            D2mMessage::Reflected(_) => D2mPayloadType::Reflected,
            D2mMessage::ReflectedAck(_) => D2mPayloadType::ReflectedAck,
        }
    }

    /// Encode the payload of the container
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            D2mMessage::ServerHello(m) => bincode::serialize(m)?,
            D2mMessage::ClientHello(m) => bincode::serialize(m)?,
            D2mMessage::ServerInfo(m) => bincode::serialize(m)?,
            D2mMessage::DevicesInfo(m) => bincode::serialize(m)?,
            D2mMessage::DropDevice(m) => bincode::serialize(m)?,
            D2mMessage::DropDeviceAck(m) => bincode::serialize(m)?,
            D2mMessage::SetSharedDeviceData(m) => bincode::serialize(m)?,
            D2mMessage::BeginTransaction(m) => bincode::serialize(m)?,
            D2mMessage::TransactionRejected(m) => bincode::serialize(m)?,
            D2mMessage::TransactionEnded(m) => bincode::serialize(m)?,
            D2mMessage::ReflectionQueueDry
            | D2mMessage::RolePromotedToLeader
            | D2mMessage::GetDevicesInfo
            | D2mMessage::BeginTransactionAck
            | D2mMessage::CommitTransaction
            | D2mMessage::CommitTransactionAck => Vec::new(),
            D2mMessage::Reflect(reflect) => {
                let mut buf = BytesMut::with_capacity(
                    usize::from(REFLECT_HEADER_LENGTH) + reflect.envelope.len(),
                );
                buf.put_u8(REFLECT_HEADER_LENGTH);
                buf.put_u8(0);
                buf.put_u16_le(reflect.flags.to_bitmask());
                buf.put_u32_le(reflect.reflect_id);
                buf.extend_from_slice(&reflect.envelope);
                return Ok(buf.freeze());
            }
            D2mMessage::ReflectAck(ack) => {
                let mut buf = BytesMut::with_capacity(16);
                buf.put_u32_le(0);
                buf.put_u32_le(ack.reflect_id);
                buf.put_u64_le(ack.timestamp);
                return Ok(buf.freeze());
            }
            D2mMessage::Reflected(reflected) => {
                let mut buf = BytesMut::with_capacity(
                    usize::from(REFLECTED_HEADER_LENGTH) + reflected.envelope.len(),
                );
                buf.put_u8(REFLECTED_HEADER_LENGTH);
                buf.put_u8(0);
                buf.put_u16_le(reflected.flags.to_bitmask());
                buf.put_u32_le(reflected.reflect_id);
                buf.put_u64_le(reflected.timestamp);
                buf.extend_from_slice(&reflected.envelope);
                return Ok(buf.freeze());
            }
            D2mMessage::ReflectedAck(ack) => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u32_le(0);
                buf.put_u32_le(ack.reflect_id);
                return Ok(buf.freeze());
            }
        };
        Ok(Bytes::from(payload))
    }

    /// Decode the payload of a container of type `kind`
    pub fn decode(kind: D2mPayloadType, payload: Bytes) -> Result<Self> {
        let mut buf: &[u8] = &payload;
        Ok(match kind {
            D2mPayloadType::Proxy => {
                return Err(ProtocolError::UnexpectedMessage(
                    "PROXY frame is not a D2M message".into(),
                ))
            }
            D2mPayloadType::ServerHello => D2mMessage::ServerHello(decode_struct(buf)?),
            D2mPayloadType::ClientHello => D2mMessage::ClientHello(decode_struct(buf)?),
            D2mPayloadType::ServerInfo => D2mMessage::ServerInfo(decode_struct(buf)?),
            D2mPayloadType::ReflectionQueueDry => D2mMessage::ReflectionQueueDry,
            D2mPayloadType::RolePromotedToLeader => D2mMessage::RolePromotedToLeader,
            D2mPayloadType::GetDevicesInfo => D2mMessage::GetDevicesInfo,
            D2mPayloadType::DevicesInfo => D2mMessage::DevicesInfo(decode_struct(buf)?),
            D2mPayloadType::DropDevice => D2mMessage::DropDevice(decode_struct(buf)?),
            D2mPayloadType::DropDeviceAck => D2mMessage::DropDeviceAck(decode_struct(buf)?),
            D2mPayloadType::SetSharedDeviceData => {
                D2mMessage::SetSharedDeviceData(decode_struct(buf)?)
            }
            D2mPayloadType::BeginTransaction => D2mMessage::BeginTransaction(decode_struct(buf)?),
            D2mPayloadType::BeginTransactionAck => D2mMessage::BeginTransactionAck,
            D2mPayloadType::CommitTransaction => D2mMessage::CommitTransaction,
            D2mPayloadType::CommitTransactionAck => D2mMessage::CommitTransactionAck,
            D2mPayloadType::TransactionRejected => {
                D2mMessage::TransactionRejected(decode_struct(buf)?)
            }
            D2mPayloadType::TransactionEnded => D2mMessage::TransactionEnded(decode_struct(buf)?),
            D2mPayloadType::Reflect => {
                let header_length = usize::from(read_u8(&mut buf)?);
                let _reserved = read_u8(&mut buf)?;
                let flags = D2mMessageFlags::from_bitmask(read_u16(&mut buf)?);
                let reflect_id = read_u32(&mut buf)?;
                let envelope = skip_header(&payload, header_length, usize::from(REFLECT_HEADER_LENGTH))?;
                D2mMessage::Reflect(Reflect {
                    flags,
                    reflect_id,
                    envelope,
                })
            }
            D2mPayloadType::ReflectAck => {
                let _reserved = read_u32(&mut buf)?;
                D2mMessage::ReflectAck(ReflectAck {
                    reflect_id: read_u32(&mut buf)?,
                    timestamp: read_u64(&mut buf)?,
                })
            }
            D2mPayloadType::Reflected => {
                let header_length = usize::from(read_u8(&mut buf)?);
                let _reserved = read_u8(&mut buf)?;
                let flags = D2mMessageFlags::from_bitmask(read_u16(&mut buf)?);
                let reflect_id = read_u32(&mut buf)?;
                let timestamp = read_u64(&mut buf)?;
                let envelope =
                    skip_header(&payload, header_length, usize::from(REFLECTED_HEADER_LENGTH))?;
                D2mMessage::Reflected(Reflected {
                    flags,
                    reflect_id,
                    timestamp,
                    envelope,
                })
            }
            D2mPayloadType::ReflectedAck => {
                let _reserved = read_u32(&mut buf)?;
                D2mMessage::ReflectedAck(ReflectedAck {
                    reflect_id: read_u32(&mut buf)?,
                })
            }
        })
    }

    pub fn into_frame(self) -> Result<Frame> {
        Ok(Frame::new(self.payload_type(), self.encode()?))
    }
}

/// Slice off a variable length header that must be at least `minimum` bytes
fn skip_header(payload: &Bytes, header_length: usize, minimum: usize) -> Result<Bytes> {
    if header_length < minimum {
        return Err(ProtocolError::DecodeError(format!(
            "Reflection header length {header_length} below {minimum}"
        )));
    }
    ensure(payload, header_length)?;
    Ok(payload.slice(header_length..))
}
