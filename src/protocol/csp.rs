//! CSP payloads carried inside PROXY frames once the login completed.
//!
//! ```text
//! [Type(1)] [Reserved(3)] [Data(N)]
//! ```
//!
//! The whole container is encrypted by the CSP transport before it is proxied.

use crate::crypto::nonce::{Nonce, NONCE_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::protocol::flags::CspMessageFlags;
use crate::protocol::wire::{
    ensure, read_array, read_bytes, read_identity, read_message_id, read_u16, read_u32, read_u8,
    read_utf8,
};
use crate::types::{Identity, MessageId};
use bytes::Bytes;

const CONTAINER_HEADER_LENGTH: usize = 4;
const LEGACY_NICKNAME_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CspPayloadType {
    EchoRequest = 0x00,
    OutgoingMessage = 0x01,
    IncomingMessage = 0x02,
    UnblockIncomingMessages = 0x03,
    SetConnectionIdleTimeout = 0x30,
    EchoResponse = 0x80,
    OutgoingMessageAck = 0x81,
    IncomingMessageAck = 0x82,
    QueueSendComplete = 0xd0,
    LastEphemeralKeyHash = 0xd1,
    CloseError = 0xe0,
    Alert = 0xe1,
}

impl TryFrom<u8> for CspPayloadType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0x00 => CspPayloadType::EchoRequest,
            0x01 => CspPayloadType::OutgoingMessage,
            0x02 => CspPayloadType::IncomingMessage,
            0x03 => CspPayloadType::UnblockIncomingMessages,
            0x30 => CspPayloadType::SetConnectionIdleTimeout,
            0x80 => CspPayloadType::EchoResponse,
            0x81 => CspPayloadType::OutgoingMessageAck,
            0x82 => CspPayloadType::IncomingMessageAck,
            0xd0 => CspPayloadType::QueueSendComplete,
            0xd1 => CspPayloadType::LastEphemeralKeyHash,
            0xe0 => CspPayloadType::CloseError,
            0xe1 => CspPayloadType::Alert,
            other => {
                return Err(ProtocolError::DecodeError(format!(
                    "Unknown CSP payload type 0x{other:02x}"
                )))
            }
        })
    }
}

/// An end-to-end encrypted message with its cleartext routing header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWithMetadataBox {
    pub sender: Identity,
    pub receiver: Identity,
    pub message_id: MessageId,
    /// Seconds since the Unix epoch
    pub created_at: u32,
    pub flags: CspMessageFlags,
    pub metadata: Vec<u8>,
    pub nonce: Nonce,
    pub message_box: Vec<u8>,
}

impl MessageWithMetadataBox {
    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let metadata_length = u16::try_from(self.metadata.len()).map_err(|_| {
            ProtocolError::DecodeError(format!("Metadata too long: {}", self.metadata.len()))
        })?;
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(self.receiver.as_bytes());
        out.extend_from_slice(&self.message_id.0.to_le_bytes());
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.push(self.flags.to_bitmask());
        out.push(0);
        out.extend_from_slice(&metadata_length.to_le_bytes());
        out.extend_from_slice(&[0u8; LEGACY_NICKNAME_LENGTH]);
        out.extend_from_slice(&self.metadata);
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.message_box);
        Ok(())
    }

    fn read(mut buf: &[u8]) -> Result<Self> {
        let sender = read_identity(&mut buf)?;
        let receiver = read_identity(&mut buf)?;
        let message_id = read_message_id(&mut buf)?;
        let created_at = read_u32(&mut buf)?;
        let flags = CspMessageFlags::from_bitmask(read_u8(&mut buf)?);
        let _reserved = read_u8(&mut buf)?;
        let metadata_length = usize::from(read_u16(&mut buf)?);
        let _nickname = read_bytes(&mut buf, LEGACY_NICKNAME_LENGTH)?;
        let metadata = read_bytes(&mut buf, metadata_length)?.to_vec();
        let nonce = Nonce::from_bytes(read_array::<NONCE_LENGTH>(&mut buf)?);
        Ok(Self {
            sender,
            receiver,
            message_id,
            created_at,
            flags,
            metadata,
            nonce,
            message_box: buf.to_vec(),
        })
    }
}

/// Acknowledgement of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageAck {
    /// Receiver for outgoing acks, sender for incoming acks
    pub identity: Identity,
    pub message_id: MessageId,
}

impl MessageAck {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.identity.as_bytes());
        out.extend_from_slice(&self.message_id.0.to_le_bytes());
    }

    fn read(mut buf: &[u8]) -> Result<Self> {
        Ok(Self {
            identity: read_identity(&mut buf)?,
            message_id: read_message_id(&mut buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    pub can_reconnect: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub message: String,
}

/// A decoded CSP payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CspPayload {
    EchoRequest(Bytes),
    EchoResponse(Bytes),
    OutgoingMessage(MessageWithMetadataBox),
    OutgoingMessageAck(MessageAck),
    IncomingMessage(MessageWithMetadataBox),
    IncomingMessageAck(MessageAck),
    UnblockIncomingMessages,
    /// Idle timeout of the server in seconds
    SetConnectionIdleTimeout(u16),
    QueueSendComplete,
    LastEphemeralKeyHash([u8; 32]),
    CloseError(CloseError),
    Alert(Alert),
}

impl CspPayload {
    pub fn payload_type(&self) -> CspPayloadType {
        match self {
            CspPayload::EchoRequest(_) => CspPayloadType::EchoRequest,
            CspPayload::EchoResponse(_) => CspPayloadType::EchoResponse,
            CspPayload::OutgoingMessage(_) => CspPayloadType::OutgoingMessage,
            CspPayload::OutgoingMessageAck(_) => CspPayloadType::OutgoingMessageAck,
            CspPayload::IncomingMessage(_) => CspPayloadType::IncomingMessage,
            CspPayload::IncomingMessageAck(_) => CspPayloadType::IncomingMessageAck,
            CspPayload::UnblockIncomingMessages => CspPayloadType::UnblockIncomingMessages,
            CspPayload::SetConnectionIdleTimeout(_) => CspPayloadType::SetConnectionIdleTimeout,
            CspPayload::QueueSendComplete => CspPayloadType::QueueSendComplete,
            CspPayload::LastEphemeralKeyHash(_) => CspPayloadType::LastEphemeralKeyHash,
            CspPayload::CloseError(_) => CspPayloadType::CloseError,
            CspPayload::Alert(_) => CspPayloadType::Alert,
        }
    }

    /// Encode the plaintext container
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(self.payload_type() as u8);
        out.extend_from_slice(&[0u8; CONTAINER_HEADER_LENGTH - 1]);
        match self {
            CspPayload::EchoRequest(data) | CspPayload::EchoResponse(data) => {
                out.extend_from_slice(data)
            }
            CspPayload::OutgoingMessage(message) | CspPayload::IncomingMessage(message) => {
                message.write(&mut out)?
            }
            CspPayload::OutgoingMessageAck(ack) | CspPayload::IncomingMessageAck(ack) => {
                ack.write(&mut out)
            }
            CspPayload::UnblockIncomingMessages | CspPayload::QueueSendComplete => {}
            CspPayload::SetConnectionIdleTimeout(seconds) => {
                out.extend_from_slice(&seconds.to_le_bytes())
            }
            CspPayload::LastEphemeralKeyHash(hash) => out.extend_from_slice(hash),
            CspPayload::CloseError(close) => {
                out.push(u8::from(close.can_reconnect));
                out.extend_from_slice(close.message.as_bytes());
            }
            CspPayload::Alert(alert) => out.extend_from_slice(alert.message.as_bytes()),
        }
        Ok(out)
    }

    /// Decode a plaintext container
    pub fn decode(container: &[u8]) -> Result<Self> {
        ensure(container, CONTAINER_HEADER_LENGTH)?;
        let payload_type = CspPayloadType::try_from(container[0])?;
        let mut data = &container[CONTAINER_HEADER_LENGTH..];
        Ok(match payload_type {
            CspPayloadType::EchoRequest => CspPayload::EchoRequest(Bytes::copy_from_slice(data)),
            CspPayloadType::EchoResponse => CspPayload::EchoResponse(Bytes::copy_from_slice(data)),
            CspPayloadType::OutgoingMessage => {
                CspPayload::OutgoingMessage(MessageWithMetadataBox::read(data)?)
            }
            CspPayloadType::IncomingMessage => {
                CspPayload::IncomingMessage(MessageWithMetadataBox::read(data)?)
            }
            CspPayloadType::OutgoingMessageAck => {
                CspPayload::OutgoingMessageAck(MessageAck::read(data)?)
            }
            CspPayloadType::IncomingMessageAck => {
                CspPayload::IncomingMessageAck(MessageAck::read(data)?)
            }
            CspPayloadType::UnblockIncomingMessages => CspPayload::UnblockIncomingMessages,
            CspPayloadType::SetConnectionIdleTimeout => {
                CspPayload::SetConnectionIdleTimeout(read_u16(&mut data)?)
            }
            CspPayloadType::QueueSendComplete => CspPayload::QueueSendComplete,
            CspPayloadType::LastEphemeralKeyHash => {
                CspPayload::LastEphemeralKeyHash(read_array(&mut data)?)
            }
            CspPayloadType::CloseError => {
                let can_reconnect = read_u8(&mut data)? != 0;
                CspPayload::CloseError(CloseError {
                    can_reconnect,
                    message: read_utf8(data)?,
                })
            }
            CspPayloadType::Alert => CspPayload::Alert(Alert {
                message: read_utf8(data)?,
            }),
        })
    }
}
