//! Message flags.
//!
//! `CspMessageFlags` is the one byte bitmask carried by every end-to-end encrypted
//! message. `D2mMessageFlags` annotates reflected envelopes.

use crate::protocol::e2e::CspE2eType;
use serde::{Deserialize, Serialize};

const SEND_PUSH_NOTIFICATION: u8 = 0x01;
const DONT_QUEUE: u8 = 0x02;
const DONT_ACK: u8 = 0x04;
const GROUP_MESSAGE: u8 = 0x10;
const IMMEDIATE_DELIVERY_REQUIRED: u8 = 0x20;
const DONT_SEND_DELIVERY_RECEIPTS: u8 = 0x80;

/// Structured form of the CSP message flag byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CspMessageFlags {
    pub send_push_notification: bool,
    pub dont_queue: bool,
    pub dont_ack: bool,
    pub group_message: bool,
    pub immediate_delivery_required: bool,
    pub dont_send_delivery_receipts: bool,
}

impl CspMessageFlags {
    pub const fn none() -> Self {
        Self {
            send_push_notification: false,
            dont_queue: false,
            dont_ack: false,
            group_message: false,
            immediate_delivery_required: false,
            dont_send_delivery_receipts: false,
        }
    }

    /// Decode the flag byte, ignoring bits without meaning
    pub fn from_bitmask(bitmask: u8) -> Self {
        Self {
            send_push_notification: bitmask & SEND_PUSH_NOTIFICATION != 0,
            dont_queue: bitmask & DONT_QUEUE != 0,
            dont_ack: bitmask & DONT_ACK != 0,
            group_message: bitmask & GROUP_MESSAGE != 0,
            immediate_delivery_required: bitmask & IMMEDIATE_DELIVERY_REQUIRED != 0,
            dont_send_delivery_receipts: bitmask & DONT_SEND_DELIVERY_RECEIPTS != 0,
        }
    }

    pub fn to_bitmask(self) -> u8 {
        let mut bitmask = 0;
        if self.send_push_notification {
            bitmask |= SEND_PUSH_NOTIFICATION;
        }
        if self.dont_queue {
            bitmask |= DONT_QUEUE;
        }
        if self.dont_ack {
            bitmask |= DONT_ACK;
        }
        if self.group_message {
            bitmask |= GROUP_MESSAGE;
        }
        if self.immediate_delivery_required {
            bitmask |= IMMEDIATE_DELIVERY_REQUIRED;
        }
        if self.dont_send_delivery_receipts {
            bitmask |= DONT_SEND_DELIVERY_RECEIPTS;
        }
        bitmask
    }

    /// Canonical flags for an outbound message of the given type
    pub fn for_message_type(message_type: CspE2eType) -> Self {
        let push = Self {
            send_push_notification: true,
            ..Self::none()
        };
        match message_type {
            CspE2eType::Text | CspE2eType::EditMessage | CspE2eType::DeleteMessage => push,
            CspE2eType::GroupText
            | CspE2eType::GroupEditMessage
            | CspE2eType::GroupDeleteMessage => Self {
                group_message: true,
                ..push
            },
            CspE2eType::GroupSetup | CspE2eType::GroupLeave | CspE2eType::GroupSyncRequest => Self {
                group_message: true,
                ..Self::none()
            },
            CspE2eType::DeliveryReceipt => Self::none(),
            CspE2eType::GroupDeliveryReceipt => Self {
                group_message: true,
                ..Self::none()
            },
            CspE2eType::TypingIndicator => Self {
                dont_queue: true,
                dont_ack: true,
                dont_send_delivery_receipts: true,
                ..Self::none()
            },
        }
    }
}

const EPHEMERAL: u16 = 0x0001;

/// Flags of a reflected envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct D2mMessageFlags {
    /// Not stored by the mediator, only delivered to devices that are online
    pub ephemeral: bool,
}

impl D2mMessageFlags {
    pub fn from_bitmask(bitmask: u16) -> Self {
        Self {
            ephemeral: bitmask & EPHEMERAL != 0,
        }
    }

    pub fn to_bitmask(self) -> u16 {
        if self.ephemeral {
            EPHEMERAL
        } else {
            0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask_values() {
        let flags = CspMessageFlags {
            send_push_notification: true,
            group_message: true,
            ..CspMessageFlags::none()
        };
        assert_eq!(flags.to_bitmask(), 0x11);
        assert_eq!(CspMessageFlags::from_bitmask(0x11), flags);
    }

    #[test]
    fn test_unknown_bits_are_dropped() {
        assert_eq!(CspMessageFlags::from_bitmask(0x48), CspMessageFlags::none());
    }

    #[test]
    fn test_typing_indicator_is_not_queued() {
        let flags = CspMessageFlags::for_message_type(CspE2eType::TypingIndicator);
        assert!(flags.dont_queue && flags.dont_ack);
        assert!(!flags.send_push_notification);
    }

    #[test]
    fn test_d2m_flags() {
        assert!(D2mMessageFlags::from_bitmask(1).ephemeral);
        assert_eq!(D2mMessageFlags::default().to_bitmask(), 0);
    }
}
