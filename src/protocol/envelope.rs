//! D2D envelopes reflected between the devices of one identity.
//!
//! An [`Envelope`] has exactly one content variant. On the wire it travels as an
//! [`EnvelopeWire`] whose content fields are all optional, so the decoder validates that
//! exactly one of them is populated before anything acts on it.

use crate::crypto::device_group::{PurposeBox, Reflect, Transaction};
use crate::crypto::nonce::{NonceScope, NonceService};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::e2e::CspE2eType;
use crate::types::{
    ConversationId, DeviceId, GroupIdentity, GroupUserState, Identity, MessageId,
};
use serde::{Deserialize, Serialize};

const MAX_PADDING: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub conversation: ConversationId,
    pub message_id: MessageId,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub message_type: CspE2eType,
    pub body: Vec<u8>,
}

/// The referenced outgoing message was sent to the chat server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessageUpdate {
    pub conversation: ConversationId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub sender: Identity,
    pub message_id: MessageId,
    pub created_at: u64,
    pub message_type: CspE2eType,
    pub body: Vec<u8>,
}

/// The referenced incoming message was read on another device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessageUpdate {
    pub conversation: ConversationId,
    pub message_id: MessageId,
    pub read_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactSync {
    Upsert {
        identity: Identity,
        public_key: [u8; 32],
        nickname: Option<String>,
    },
    Delete {
        identity: Identity,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupSync {
    Upsert {
        group: GroupIdentity,
        members: Vec<Identity>,
        user_state: GroupUserState,
    },
    Delete {
        group: GroupIdentity,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsSync {
    pub send_read_receipts: Option<bool>,
    pub send_typing_indicators: Option<bool>,
}

/// Content of a reflected envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    OutgoingMessage(OutgoingMessage),
    OutgoingMessageUpdate(OutgoingMessageUpdate),
    IncomingMessage(IncomingMessage),
    IncomingMessageUpdate(IncomingMessageUpdate),
    ContactSync(ContactSync),
    GroupSync(GroupSync),
    SettingsSync(SettingsSync),
}

/// Serialized form of an envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeWire {
    pub padding: Vec<u8>,
    pub device_id: DeviceId,
    pub outgoing_message: Option<OutgoingMessage>,
    pub outgoing_message_update: Option<OutgoingMessageUpdate>,
    pub incoming_message: Option<IncomingMessage>,
    pub incoming_message_update: Option<IncomingMessageUpdate>,
    pub contact_sync: Option<ContactSync>,
    pub group_sync: Option<GroupSync>,
    pub settings_sync: Option<SettingsSync>,
}

impl EnvelopeWire {
    fn populated(&self) -> usize {
        [
            self.outgoing_message.is_some(),
            self.outgoing_message_update.is_some(),
            self.incoming_message.is_some(),
            self.incoming_message_update.is_some(),
            self.contact_sync.is_some(),
            self.group_sync.is_some(),
            self.settings_sync.is_some(),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }
}

impl TryFrom<EnvelopeWire> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: EnvelopeWire) -> Result<Self> {
        match wire.populated() {
            0 => return Err(ProtocolError::InvalidEnvelope(constants::ERR_ENVELOPE_EMPTY)),
            1 => {}
            _ => return Err(ProtocolError::InvalidEnvelope(constants::ERR_ENVELOPE_AMBIGUOUS)),
        }
        let EnvelopeWire {
            outgoing_message,
            outgoing_message_update,
            incoming_message,
            incoming_message_update,
            contact_sync,
            group_sync,
            settings_sync,
            ..
        } = wire;
        outgoing_message
            .map(Envelope::OutgoingMessage)
            .or_else(|| outgoing_message_update.map(Envelope::OutgoingMessageUpdate))
            .or_else(|| incoming_message.map(Envelope::IncomingMessage))
            .or_else(|| incoming_message_update.map(Envelope::IncomingMessageUpdate))
            .or_else(|| contact_sync.map(Envelope::ContactSync))
            .or_else(|| group_sync.map(Envelope::GroupSync))
            .or_else(|| settings_sync.map(Envelope::SettingsSync))
            .ok_or(ProtocolError::InvalidEnvelope(constants::ERR_ENVELOPE_EMPTY))
    }
}

impl Envelope {
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::OutgoingMessage(_) => "outgoing-message",
            Envelope::OutgoingMessageUpdate(_) => "outgoing-message-update",
            Envelope::IncomingMessage(_) => "incoming-message",
            Envelope::IncomingMessageUpdate(_) => "incoming-message-update",
            Envelope::ContactSync(_) => "contact-sync",
            Envelope::GroupSync(_) => "group-sync",
            Envelope::SettingsSync(_) => "settings-sync",
        }
    }

    /// Wire form with random padding
    pub fn into_wire(self, device_id: DeviceId) -> EnvelopeWire {
        let padding_length = rand::random_range(0..=MAX_PADDING);
        let mut wire = EnvelopeWire {
            padding: vec![0u8; usize::from(padding_length)],
            device_id,
            ..EnvelopeWire::default()
        };
        match self {
            Envelope::OutgoingMessage(m) => wire.outgoing_message = Some(m),
            Envelope::OutgoingMessageUpdate(m) => wire.outgoing_message_update = Some(m),
            Envelope::IncomingMessage(m) => wire.incoming_message = Some(m),
            Envelope::IncomingMessageUpdate(m) => wire.incoming_message_update = Some(m),
            Envelope::ContactSync(m) => wire.contact_sync = Some(m),
            Envelope::GroupSync(m) => wire.group_sync = Some(m),
            Envelope::SettingsSync(m) => wire.settings_sync = Some(m),
        }
        wire
    }
}

/// Serialize and encrypt an envelope with the reflect key
pub fn seal_envelope(
    envelope: Envelope,
    device_id: DeviceId,
    dgrk: &PurposeBox<Reflect>,
    nonces: &NonceService,
) -> Result<Vec<u8>> {
    let plain = bincode::serialize(&envelope.into_wire(device_id))?;
    Ok(dgrk.encrypt_with_nonce_ahead(nonces.next(NonceScope::D2d)?, &plain)?)
}

/// Decrypt and validate a reflected envelope, returning the sending device
///
/// The nonce is recorded as used only once the envelope was decoded.
pub fn open_envelope(
    data: &[u8],
    dgrk: &PurposeBox<Reflect>,
    nonces: &NonceService,
) -> Result<(DeviceId, Envelope)> {
    let (nonce, plain) = dgrk.decrypt_with_nonce_ahead(data)?;
    let guard = nonces.import(NonceScope::D2d, nonce)?;
    let decoded = bincode::deserialize::<EnvelopeWire>(&plain)
        .map_err(ProtocolError::from)
        .and_then(|wire| {
            let device_id = wire.device_id;
            Envelope::try_from(wire).map(|envelope| (device_id, envelope))
        });
    match decoded {
        Ok(result) => {
            guard.commit();
            Ok(result)
        }
        Err(e) => {
            guard.discard();
            Err(e)
        }
    }
}

/// Scope of a D2M transaction, encrypted with the transaction scope key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum D2mTransactionScope {
    UserProfileSync,
    ContactSync,
    GroupSync,
    DistributionListSync,
    SettingsSync,
    MdmParameterSync,
    NewDeviceSync,
}

impl D2mTransactionScope {
    pub fn encrypt(self, dgtsk: &PurposeBox<Transaction>, nonces: &NonceService) -> Result<Vec<u8>> {
        let plain = bincode::serialize(&self)?;
        Ok(dgtsk.encrypt_with_nonce_ahead(nonces.next(NonceScope::D2d)?, &plain)?)
    }

    /// Decrypt a scope announced by another device
    ///
    /// Scopes are not replay sensitive, the nonce is not recorded.
    pub fn decrypt(data: &[u8], dgtsk: &PurposeBox<Transaction>) -> Result<Self> {
        let (_, plain) = dgtsk.decrypt_with_nonce_ahead(data)?;
        Ok(bincode::deserialize(&plain)?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::crypto::device_group::{derive_device_group_keys, DeviceGroupKey};

    fn update() -> OutgoingMessageUpdate {
        OutgoingMessageUpdate {
            conversation: ConversationId::Contact("ECHOECHO".parse().unwrap()),
            message_id: MessageId(5),
        }
    }

    #[test]
    fn test_empty_wire_rejected() {
        assert_eq!(
            Envelope::try_from(EnvelopeWire::default()).unwrap_err().to_string(),
            ProtocolError::InvalidEnvelope(constants::ERR_ENVELOPE_EMPTY).to_string()
        );
    }

    #[test]
    fn test_ambiguous_wire_rejected() {
        let wire = EnvelopeWire {
            outgoing_message_update: Some(update()),
            settings_sync: Some(SettingsSync::default()),
            ..EnvelopeWire::default()
        };
        assert!(matches!(
            Envelope::try_from(wire),
            Err(ProtocolError::InvalidEnvelope(constants::ERR_ENVELOPE_AMBIGUOUS))
        ));
    }

    #[test]
    fn test_sealed_envelope_opens_once() {
        let boxes = derive_device_group_keys(DeviceGroupKey::new([2u8; 32])).unwrap();
        let sender = NonceService::new();
        let receiver = NonceService::new();

        let sealed = seal_envelope(
            Envelope::OutgoingMessageUpdate(update()),
            11,
            &boxes.dgrk,
            &sender,
        )
        .unwrap();
        let (device_id, envelope) = open_envelope(&sealed, &boxes.dgrk, &receiver).unwrap();
        assert_eq!(device_id, 11);
        assert_eq!(envelope, Envelope::OutgoingMessageUpdate(update()));

        assert!(matches!(
            open_envelope(&sealed, &boxes.dgrk, &receiver),
            Err(ProtocolError::Crypto(_))
        ));
    }

    #[test]
    fn test_transaction_scope_encryption() {
        let boxes = derive_device_group_keys(DeviceGroupKey::new([3u8; 32])).unwrap();
        let nonces = NonceService::new();
        let encrypted = D2mTransactionScope::GroupSync
            .encrypt(&boxes.dgtsk, &nonces)
            .unwrap();
        assert_eq!(
            D2mTransactionScope::decrypt(&encrypted, &boxes.dgtsk).unwrap(),
            D2mTransactionScope::GroupSync
        );
    }
}
