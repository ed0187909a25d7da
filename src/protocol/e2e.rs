//! End-to-end encrypted message contents.
//!
//! The plaintext inside a message box is
//!
//! ```text
//! [Type(1)] [Body(N)] [Padding(P)]
//! ```
//!
//! where the padding is `P` bytes of value `P` (1..=255) and pads the plaintext to at
//! least 32 bytes so short messages do not leak their length.

use crate::error::{ProtocolError, Result};
use crate::protocol::wire::{
    read_array, read_group, read_message_id, read_u8, read_utf8, write_group,
};
use crate::types::{GroupId, GroupIdentity, Identity, MessageId, IDENTITY_LENGTH};
use serde::{Deserialize, Serialize};

const MIN_PADDED_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CspE2eType {
    Text = 0x01,
    GroupText = 0x41,
    GroupSetup = 0x4a,
    GroupLeave = 0x4c,
    GroupSyncRequest = 0x51,
    DeliveryReceipt = 0x80,
    GroupDeliveryReceipt = 0x81,
    TypingIndicator = 0x90,
    EditMessage = 0x91,
    DeleteMessage = 0x92,
    GroupEditMessage = 0x93,
    GroupDeleteMessage = 0x94,
}

impl CspE2eType {
    pub const ALL: [CspE2eType; 12] = [
        CspE2eType::Text,
        CspE2eType::GroupText,
        CspE2eType::GroupSetup,
        CspE2eType::GroupLeave,
        CspE2eType::GroupSyncRequest,
        CspE2eType::DeliveryReceipt,
        CspE2eType::GroupDeliveryReceipt,
        CspE2eType::TypingIndicator,
        CspE2eType::EditMessage,
        CspE2eType::DeleteMessage,
        CspE2eType::GroupEditMessage,
        CspE2eType::GroupDeleteMessage,
    ];
}

impl TryFrom<u8> for CspE2eType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        CspE2eType::ALL
            .into_iter()
            .find(|t| *t as u8 == value)
            .ok_or_else(|| ProtocolError::DecodeError(format!("Unknown E2E type 0x{value:02x}")))
    }
}

/// Status carried by a delivery receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReceiptStatus {
    Received = 0x01,
    Read = 0x02,
    Acknowledged = 0x03,
    Declined = 0x04,
}

impl TryFrom<u8> for ReceiptStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(ReceiptStatus::Received),
            0x02 => Ok(ReceiptStatus::Read),
            0x03 => Ok(ReceiptStatus::Acknowledged),
            0x04 => Ok(ReceiptStatus::Declined),
            other => Err(ProtocolError::DecodeError(format!(
                "Unknown receipt status 0x{other:02x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub status: ReceiptStatus,
    pub message_ids: Vec<MessageId>,
}

impl DeliveryReceipt {
    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.status as u8);
        for id in &self.message_ids {
            out.extend_from_slice(&id.0.to_le_bytes());
        }
    }

    fn read(mut buf: &[u8]) -> Result<Self> {
        let status = ReceiptStatus::try_from(read_u8(&mut buf)?)?;
        if buf.len() % 8 != 0 {
            return Err(ProtocolError::DecodeError(
                "Delivery receipt ids not a multiple of 8 bytes".into(),
            ));
        }
        let mut message_ids = Vec::with_capacity(buf.len() / 8);
        while !buf.is_empty() {
            message_ids.push(read_message_id(&mut buf)?);
        }
        Ok(Self {
            status,
            message_ids,
        })
    }
}

/// Decoded end-to-end message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum E2eMessage {
    Text(String),
    GroupText {
        group: GroupIdentity,
        text: String,
    },
    /// Sent by the creator, the creator is implied by the sender
    GroupSetup {
        group_id: GroupId,
        members: Vec<Identity>,
    },
    GroupLeave {
        group: GroupIdentity,
    },
    /// Sent to the creator, the creator is implied by the receiver
    GroupSyncRequest {
        group_id: GroupId,
    },
    DeliveryReceipt(DeliveryReceipt),
    GroupDeliveryReceipt {
        group: GroupIdentity,
        receipt: DeliveryReceipt,
    },
    TypingIndicator(bool),
    EditMessage {
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    GroupEditMessage {
        group: GroupIdentity,
        message_id: MessageId,
        text: String,
    },
    GroupDeleteMessage {
        group: GroupIdentity,
        message_id: MessageId,
    },
}

impl E2eMessage {
    pub fn message_type(&self) -> CspE2eType {
        match self {
            E2eMessage::Text(_) => CspE2eType::Text,
            E2eMessage::GroupText { .. } => CspE2eType::GroupText,
            E2eMessage::GroupSetup { .. } => CspE2eType::GroupSetup,
            E2eMessage::GroupLeave { .. } => CspE2eType::GroupLeave,
            E2eMessage::GroupSyncRequest { .. } => CspE2eType::GroupSyncRequest,
            E2eMessage::DeliveryReceipt(_) => CspE2eType::DeliveryReceipt,
            E2eMessage::GroupDeliveryReceipt { .. } => CspE2eType::GroupDeliveryReceipt,
            E2eMessage::TypingIndicator(_) => CspE2eType::TypingIndicator,
            E2eMessage::EditMessage { .. } => CspE2eType::EditMessage,
            E2eMessage::DeleteMessage { .. } => CspE2eType::DeleteMessage,
            E2eMessage::GroupEditMessage { .. } => CspE2eType::GroupEditMessage,
            E2eMessage::GroupDeleteMessage { .. } => CspE2eType::GroupDeleteMessage,
        }
    }

    /// Group the message belongs to, given who sent it to whom
    pub fn group(&self, sender: Identity, receiver: Identity) -> Option<GroupIdentity> {
        match self {
            E2eMessage::GroupText { group, .. }
            | E2eMessage::GroupLeave { group }
            | E2eMessage::GroupDeliveryReceipt { group, .. }
            | E2eMessage::GroupEditMessage { group, .. }
            | E2eMessage::GroupDeleteMessage { group, .. } => Some(*group),
            E2eMessage::GroupSetup { group_id, .. } => Some(GroupIdentity {
                creator: sender,
                group_id: *group_id,
            }),
            E2eMessage::GroupSyncRequest { group_id } => Some(GroupIdentity {
                creator: receiver,
                group_id: *group_id,
            }),
            E2eMessage::Text(_)
            | E2eMessage::DeliveryReceipt(_)
            | E2eMessage::TypingIndicator(_)
            | E2eMessage::EditMessage { .. }
            | E2eMessage::DeleteMessage { .. } => None,
        }
    }

    /// Encode the body without type byte and padding
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            E2eMessage::Text(text) => out.extend_from_slice(text.as_bytes()),
            E2eMessage::GroupText { group, text } => {
                write_group(&mut out, group);
                out.extend_from_slice(text.as_bytes());
            }
            E2eMessage::GroupSetup { group_id, members } => {
                out.extend_from_slice(&group_id.0.to_le_bytes());
                for member in members {
                    out.extend_from_slice(member.as_bytes());
                }
            }
            E2eMessage::GroupLeave { group } => write_group(&mut out, group),
            E2eMessage::GroupSyncRequest { group_id } => {
                out.extend_from_slice(&group_id.0.to_le_bytes());
            }
            E2eMessage::DeliveryReceipt(receipt) => receipt.write(&mut out),
            E2eMessage::GroupDeliveryReceipt { group, receipt } => {
                write_group(&mut out, group);
                receipt.write(&mut out);
            }
            E2eMessage::TypingIndicator(typing) => out.push(u8::from(*typing)),
            E2eMessage::EditMessage { message_id, text } => {
                out.extend_from_slice(&message_id.0.to_le_bytes());
                out.extend_from_slice(text.as_bytes());
            }
            E2eMessage::DeleteMessage { message_id } => {
                out.extend_from_slice(&message_id.0.to_le_bytes());
            }
            E2eMessage::GroupEditMessage {
                group,
                message_id,
                text,
            } => {
                write_group(&mut out, group);
                out.extend_from_slice(&message_id.0.to_le_bytes());
                out.extend_from_slice(text.as_bytes());
            }
            E2eMessage::GroupDeleteMessage { group, message_id } => {
                write_group(&mut out, group);
                out.extend_from_slice(&message_id.0.to_le_bytes());
            }
        }
        out
    }

    /// Decode a body of the given type
    pub fn decode_body(message_type: CspE2eType, body: &[u8]) -> Result<Self> {
        let mut buf = body;
        Ok(match message_type {
            CspE2eType::Text => E2eMessage::Text(read_utf8(buf)?),
            CspE2eType::GroupText => {
                let group = read_group(&mut buf)?;
                E2eMessage::GroupText {
                    group,
                    text: read_utf8(buf)?,
                }
            }
            CspE2eType::GroupSetup => {
                let group_id = GroupId(crate::protocol::wire::read_u64(&mut buf)?);
                if buf.len() % IDENTITY_LENGTH != 0 {
                    return Err(ProtocolError::DecodeError(
                        "Group setup members not a multiple of 8 bytes".into(),
                    ));
                }
                let mut members = Vec::with_capacity(buf.len() / IDENTITY_LENGTH);
                while !buf.is_empty() {
                    members.push(Identity::from_bytes(read_array(&mut buf)?)?);
                }
                E2eMessage::GroupSetup { group_id, members }
            }
            CspE2eType::GroupLeave => E2eMessage::GroupLeave {
                group: read_group(&mut buf)?,
            },
            CspE2eType::GroupSyncRequest => E2eMessage::GroupSyncRequest {
                group_id: GroupId(crate::protocol::wire::read_u64(&mut buf)?),
            },
            CspE2eType::DeliveryReceipt => E2eMessage::DeliveryReceipt(DeliveryReceipt::read(buf)?),
            CspE2eType::GroupDeliveryReceipt => {
                let group = read_group(&mut buf)?;
                E2eMessage::GroupDeliveryReceipt {
                    group,
                    receipt: DeliveryReceipt::read(buf)?,
                }
            }
            CspE2eType::TypingIndicator => E2eMessage::TypingIndicator(read_u8(&mut buf)? != 0),
            CspE2eType::EditMessage => {
                let message_id = read_message_id(&mut buf)?;
                E2eMessage::EditMessage {
                    message_id,
                    text: read_utf8(buf)?,
                }
            }
            CspE2eType::DeleteMessage => E2eMessage::DeleteMessage {
                message_id: read_message_id(&mut buf)?,
            },
            CspE2eType::GroupEditMessage => {
                let group = read_group(&mut buf)?;
                let message_id = read_message_id(&mut buf)?;
                E2eMessage::GroupEditMessage {
                    group,
                    message_id,
                    text: read_utf8(buf)?,
                }
            }
            CspE2eType::GroupDeleteMessage => {
                let group = read_group(&mut buf)?;
                E2eMessage::GroupDeleteMessage {
                    group,
                    message_id: read_message_id(&mut buf)?,
                }
            }
        })
    }

    /// Type byte, body and random padding, ready for encryption
    pub fn encode_padded(&self) -> Vec<u8> {
        let mut out = vec![self.message_type() as u8];
        out.extend_from_slice(&self.encode_body());

        let mut padding = usize::from(rand::random::<u8>().max(1));
        if out.len() + padding < MIN_PADDED_LENGTH {
            padding = MIN_PADDED_LENGTH - out.len();
        }
        out.resize(out.len() + padding, padding as u8);
        out
    }

    /// Strip padding and decode
    pub fn decode_padded(data: &[u8]) -> Result<Self> {
        let padding = usize::from(*data.last().ok_or_else(|| {
            ProtocolError::DecodeError("Empty E2E plaintext".into())
        })?);
        if padding == 0 || padding + 1 > data.len() {
            return Err(ProtocolError::DecodeError(format!(
                "Invalid padding length {padding}"
            )));
        }
        let unpadded = &data[..data.len() - padding];
        let message_type = CspE2eType::try_from(unpadded[0])?;
        Self::decode_body(message_type, &unpadded[1..])
    }
}
