//! # Identifiers
//!
//! Value types shared by the wire codecs, the model contract and the task manager.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of an identity string on the wire
pub const IDENTITY_LENGTH: usize = 8;

/// An eight character user identity (e.g. `ECHOECHO`)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity([u8; IDENTITY_LENGTH]);

impl Identity {
    /// Build an identity from raw wire bytes
    ///
    /// # Errors
    /// Returns `ProtocolError::DecodeError` unless all bytes are printable ASCII
    pub fn from_bytes(bytes: [u8; IDENTITY_LENGTH]) -> Result<Self> {
        if bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'*') {
            Ok(Self(bytes))
        } else {
            Err(ProtocolError::DecodeError(format!(
                "Invalid identity bytes: {}",
                hex::encode(bytes)
            )))
        }
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Constructors only admit ASCII
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }
}

impl FromStr for Identity {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; IDENTITY_LENGTH] = s.as_bytes().try_into().map_err(|_| {
            ProtocolError::DecodeError(format!("Identity must be {IDENTITY_LENGTH} characters"))
        })?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.as_str())
    }
}

/// Message id, unique per sender
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_le_bytes()))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// Group id, unique per creator
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(self.0.to_le_bytes()))
    }
}

/// A group is identified by its creator and the creator-chosen id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupIdentity {
    pub creator: Identity,
    pub group_id: GroupId,
}

impl fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.creator, hex::encode(self.group_id.0.to_le_bytes()))
    }
}

/// A one-to-one or group conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConversationId {
    Contact(Identity),
    Group(GroupIdentity),
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationId::Contact(identity) => write!(f, "contact:{identity}"),
            ConversationId::Group(group) => write!(f, "group:{group}"),
        }
    }
}

/// Membership of the local user in a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupUserState {
    Member,
    Kicked,
    Left,
}

/// Mediator device id
pub type DeviceId = u64;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse() {
        let id: Identity = "ECHOECHO".parse().unwrap();
        assert_eq!(id.to_string(), "ECHOECHO");
        assert!("SHORT".parse::<Identity>().is_err());
        assert!(Identity::from_bytes([0u8; 8]).is_err());
        assert!("*SUPPORT".parse::<Identity>().is_ok());
    }

    #[test]
    fn test_message_id_display_is_little_endian_hex() {
        assert_eq!(MessageId(1).to_string(), "0100000000000000");
    }
}
