//! # Task Manager
//!
//! Tasks are the unit of protocol work above the pipeline.
//!
//! - **Active** tasks are scheduled by the application ([`ActiveTask`]). They are either
//!   persistent (recorded in the [`store::TaskStore`] before they are accepted, retried
//!   on transient failures and re-run after a restart) or volatile (dropped when the
//!   connection goes away).
//! - **Passive** tasks are created from inbound messages by the dispatch layer
//!   ([`PassiveTask`]) and are bound to the connection they arrived on.
//!
//! Every task runs in one lane of the [`scope::ScopeLanes`] table, keyed by its
//! [`TransactionScope`]. Tasks in one lane run strictly one after another in enqueue
//! order; tasks in different lanes run concurrently. An inbound message about a group
//! runs in that group's lane, so it never interleaves with a local membership change.

pub mod backoff;
pub mod codec;
pub mod device;
pub mod group;
pub mod incoming;
pub mod manager;
pub mod message;
pub mod model;
pub mod receipt;
pub mod scope;
pub mod store;

use crate::error::TaskResult;
use crate::protocol::csp::{Alert, CloseError, CspPayload, MessageWithMetadataBox};
use crate::protocol::d2m::{D2mMessage, Reflected};
use crate::protocol::e2e::ReceiptStatus;
use crate::protocol::session::InboundMessage;
use crate::services::Services;
use crate::types::{ConversationId, DeviceId, GroupIdentity, Identity, MessageId};
use codec::TaskCodec;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, warn};

pub use manager::{TaskHandle, TaskManager};

/// Whether a task survives a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Persistent,
    Volatile,
}

/// Mutual exclusion domain of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionScope {
    Contact(Identity),
    Group(GroupIdentity),
    DeviceList,
}

impl From<ConversationId> for TransactionScope {
    fn from(conversation: ConversationId) -> Self {
        match conversation {
            ConversationId::Contact(identity) => TransactionScope::Contact(identity),
            ConversationId::Group(group) => TransactionScope::Group(group),
        }
    }
}

/// Id assigned by the task store to a persistent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A device linked to the identity, as announced by the mediator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedDevice {
    pub device_id: DeviceId,
    /// `None` if the device info could not be decrypted
    pub label: Option<String>,
    pub last_login_at: u64,
}

/// Result of a successful task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Done,
    /// Reflection timestamp of a sent message, milliseconds since the Unix epoch
    SentAt(u64),
    Devices(Vec<LinkedDevice>),
    /// Whether a member was actually removed
    MemberRemoved(bool),
}

/// Locally initiated task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveTask {
    SendMessage {
        conversation: ConversationId,
        message_id: MessageId,
        text: String,
        created_at: u64,
    },
    EditMessage {
        conversation: ConversationId,
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        conversation: ConversationId,
        message_id: MessageId,
    },
    SendDeliveryReceipt {
        conversation: ConversationId,
        status: ReceiptStatus,
        message_ids: Vec<MessageId>,
    },
    TypingIndicator {
        contact: Identity,
        is_typing: bool,
    },
    LeaveGroup {
        group: GroupIdentity,
    },
    AddGroupMember {
        group: GroupIdentity,
        member: Identity,
    },
    RemoveGroupMember {
        group: GroupIdentity,
        member: Identity,
    },
    /// Ask the creator for the current state of a group we are in
    GroupSyncRequest {
        group: GroupIdentity,
    },
    GetDevicesInfo,
    DropDevice {
        device_id: DeviceId,
    },
}

impl ActiveTask {
    pub fn name(&self) -> &'static str {
        match self {
            ActiveTask::SendMessage { .. } => "send-message",
            ActiveTask::EditMessage { .. } => "edit-message",
            ActiveTask::DeleteMessage { .. } => "delete-message",
            ActiveTask::SendDeliveryReceipt { .. } => "send-delivery-receipt",
            ActiveTask::TypingIndicator { .. } => "typing-indicator",
            ActiveTask::LeaveGroup { .. } => "leave-group",
            ActiveTask::AddGroupMember { .. } => "add-group-member",
            ActiveTask::RemoveGroupMember { .. } => "remove-group-member",
            ActiveTask::GroupSyncRequest { .. } => "group-sync-request",
            ActiveTask::GetDevicesInfo => "get-devices-info",
            ActiveTask::DropDevice { .. } => "drop-device",
        }
    }

    pub fn persistence(&self) -> Persistence {
        match self {
            ActiveTask::SendMessage { .. }
            | ActiveTask::SendDeliveryReceipt { .. }
            | ActiveTask::LeaveGroup { .. }
            | ActiveTask::AddGroupMember { .. }
            | ActiveTask::RemoveGroupMember { .. }
            | ActiveTask::GroupSyncRequest { .. } => Persistence::Persistent,
            ActiveTask::EditMessage { .. }
            | ActiveTask::DeleteMessage { .. }
            | ActiveTask::TypingIndicator { .. }
            | ActiveTask::GetDevicesInfo
            | ActiveTask::DropDevice { .. } => Persistence::Volatile,
        }
    }

    pub fn scope(&self) -> Option<TransactionScope> {
        match self {
            ActiveTask::SendMessage { conversation, .. }
            | ActiveTask::EditMessage { conversation, .. }
            | ActiveTask::DeleteMessage { conversation, .. }
            | ActiveTask::SendDeliveryReceipt { conversation, .. } => {
                Some(TransactionScope::from(*conversation))
            }
            ActiveTask::TypingIndicator { .. } => None,
            ActiveTask::LeaveGroup { group }
            | ActiveTask::AddGroupMember { group, .. }
            | ActiveTask::RemoveGroupMember { group, .. }
            | ActiveTask::GroupSyncRequest { group } => Some(TransactionScope::Group(*group)),
            ActiveTask::GetDevicesInfo | ActiveTask::DropDevice { .. } => {
                Some(TransactionScope::DeviceList)
            }
        }
    }

    pub(crate) async fn run(&self, codec: &TaskCodec) -> TaskResult<TaskOutput> {
        match self {
            ActiveTask::SendMessage {
                conversation,
                message_id,
                text,
                created_at,
            } => message::send_message(codec, *conversation, *message_id, text, *created_at).await,
            ActiveTask::EditMessage {
                conversation,
                message_id,
                text,
            } => message::edit_message(codec, *conversation, *message_id, text).await,
            ActiveTask::DeleteMessage {
                conversation,
                message_id,
            } => message::delete_message(codec, *conversation, *message_id).await,
            ActiveTask::SendDeliveryReceipt {
                conversation,
                status,
                message_ids,
            } => message::send_delivery_receipt(codec, *conversation, *status, message_ids).await,
            ActiveTask::TypingIndicator { contact, is_typing } => {
                message::send_typing_indicator(codec, *contact, *is_typing).await
            }
            ActiveTask::LeaveGroup { group } => group::leave_group(codec, *group).await,
            ActiveTask::AddGroupMember { group, member } => {
                group::add_member(codec, *group, *member).await
            }
            ActiveTask::RemoveGroupMember { group, member } => {
                group::remove_member(codec, *group, *member).await
            }
            ActiveTask::GroupSyncRequest { group } => group::request_sync(codec, *group).await,
            ActiveTask::GetDevicesInfo => device::get_devices_info(codec).await,
            ActiveTask::DropDevice { device_id } => device::drop_device(codec, *device_id).await,
        }
    }
}

/// Task reacting to an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassiveTask {
    IncomingMessage(MessageWithMetadataBox),
    Reflected(Reflected),
    CloseError(CloseError),
    Alert(Alert),
}

impl PassiveTask {
    /// Build the task handling an inbound message
    ///
    /// Returns `None` for messages no task handles; they are logged and dropped.
    pub fn from_inbound(message: InboundMessage) -> Option<Self> {
        match message {
            InboundMessage::Csp(CspPayload::IncomingMessage(message)) => {
                Some(PassiveTask::IncomingMessage(message))
            }
            InboundMessage::Csp(CspPayload::CloseError(close)) => Some(PassiveTask::CloseError(close)),
            InboundMessage::Csp(CspPayload::Alert(alert)) => Some(PassiveTask::Alert(alert)),
            InboundMessage::D2m(D2mMessage::Reflected(reflected)) => {
                Some(PassiveTask::Reflected(reflected))
            }
            other => {
                warn!(message = ?other, "No task handles inbound message, discarding");
                None
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PassiveTask::IncomingMessage(_) => "incoming-message",
            PassiveTask::Reflected(_) => "reflected",
            PassiveTask::CloseError(_) => "close-error",
            PassiveTask::Alert(_) => "alert",
        }
    }

    /// Lane of an inbound message; only messages about a group have one
    pub fn scope(&self, services: &Services) -> Option<TransactionScope> {
        match self {
            PassiveTask::IncomingMessage(message) => {
                incoming::incoming_group(services, message).map(TransactionScope::Group)
            }
            PassiveTask::Reflected(_) | PassiveTask::CloseError(_) | PassiveTask::Alert(_) => None,
        }
    }

    pub(crate) async fn run(&self, codec: &TaskCodec) -> TaskResult<()> {
        match self {
            PassiveTask::IncomingMessage(message) => incoming::process_incoming(codec, message).await,
            PassiveTask::Reflected(reflected) => incoming::process_reflected(codec, reflected).await,
            PassiveTask::CloseError(close) => {
                error!(
                    can_reconnect = close.can_reconnect,
                    message = %close.message,
                    "Chat server closed the connection"
                );
                Ok(())
            }
            PassiveTask::Alert(alert) => {
                warn!(message = %alert.message, "Chat server alert");
                debug!("Alert requires no protocol action");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::GroupId;

    #[test]
    fn test_scopes() {
        let contact: Identity = "ECHOECHO".parse().unwrap();
        let group = GroupIdentity {
            creator: contact,
            group_id: GroupId(1),
        };
        let send = ActiveTask::SendMessage {
            conversation: ConversationId::Group(group),
            message_id: MessageId(1),
            text: "hi".into(),
            created_at: 0,
        };
        let add = ActiveTask::AddGroupMember {
            group,
            member: contact,
        };
        assert_eq!(send.scope(), add.scope());
        assert_eq!(send.persistence(), Persistence::Persistent);
        assert_eq!(
            ActiveTask::TypingIndicator {
                contact,
                is_typing: true
            }
            .persistence(),
            Persistence::Volatile
        );
    }

    #[test]
    fn test_active_task_survives_serialization() {
        let task = ActiveTask::SendDeliveryReceipt {
            conversation: ConversationId::Contact("ECHOECHO".parse().unwrap()),
            status: ReceiptStatus::Read,
            message_ids: vec![MessageId(1), MessageId(2)],
        };
        let bytes = bincode::serialize(&task).unwrap();
        assert_eq!(bincode::deserialize::<ActiveTask>(&bytes).unwrap(), task);
    }

    #[test]
    fn test_passive_task_from_inbound() {
        assert!(PassiveTask::from_inbound(InboundMessage::Csp(CspPayload::QueueSendComplete)).is_none());
        let alert = InboundMessage::Csp(CspPayload::Alert(Alert {
            message: "maintenance".into(),
        }));
        assert_eq!(
            PassiveTask::from_inbound(alert).map(|t| t.name()),
            Some("alert")
        );
    }
}
