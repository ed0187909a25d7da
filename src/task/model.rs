//! Contract between the tasks and the application's data model.
//!
//! Tasks read and mutate conversations, contacts and groups exclusively through
//! [`ModelStore`]. Every mutation is a single call so a store backed by a database can
//! make it atomic. [`MemoryModelStore`] is the in-process implementation used by tests
//! and small embedders.

use crate::protocol::envelope::{ContactSync, GroupSync, SettingsSync};
use crate::types::{ConversationId, GroupIdentity, GroupUserState, Identity, MessageId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionKind {
    Acknowledge,
    Decline,
}

/// A reaction; each participant holds at most one per message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaction {
    pub sender: Identity,
    pub kind: ReactionKind,
    pub at: u64,
}

/// A message as the model stores it. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub conversation: ConversationId,
    pub id: MessageId,
    pub direction: MessageDirection,
    pub sender: Identity,
    pub text: String,
    pub created_at: u64,
    /// Reflection timestamp of an outbound message, set before it goes to the receivers
    pub reflected_at: Option<u64>,
    /// Receivers whose chat server ack arrived
    pub acked_by: BTreeSet<Identity>,
    pub sent_at: Option<u64>,
    pub delivered_at: Option<u64>,
    pub read_at: Option<u64>,
    pub edited_at: Option<u64>,
    pub deleted_at: Option<u64>,
    pub reactions: Vec<Reaction>,
}

impl MessageRecord {
    pub fn new(
        conversation: ConversationId,
        id: MessageId,
        direction: MessageDirection,
        sender: Identity,
        text: impl Into<String>,
        created_at: u64,
    ) -> Self {
        Self {
            conversation,
            id,
            direction,
            sender,
            text: text.into(),
            created_at,
            reflected_at: None,
            acked_by: BTreeSet::new(),
            sent_at: None,
            delivered_at: None,
            read_at: None,
            edited_at: None,
            deleted_at: None,
            reactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub identity: Identity,
    pub public_key: [u8; 32],
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub group: GroupIdentity,
    /// Members excluding the creator
    pub members: BTreeSet<Identity>,
    pub user_state: GroupUserState,
}

impl GroupRecord {
    /// Whether `identity` takes part in the group, counting the creator
    pub fn is_participant(&self, identity: &Identity) -> bool {
        self.group.creator == *identity || self.members.contains(identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub send_read_receipts: bool,
    pub send_typing_indicators: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            send_read_receipts: true,
            send_typing_indicators: true,
        }
    }
}

/// Data synchronised from another device of the same identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    Contact(ContactSync),
    Group(GroupSync),
    Settings(SettingsSync),
}

/// Application data model as seen by the tasks
pub trait ModelStore: Send + Sync {
    fn contact(&self, identity: &Identity) -> Option<ContactRecord>;

    fn message(&self, conversation: &ConversationId, id: MessageId) -> Option<MessageRecord>;

    /// Insert a message, returning `false` if one with the same id already exists
    fn insert_message(&self, record: MessageRecord) -> bool;

    /// Apply `update` to a message, returning `false` if the message does not exist
    fn update_message(
        &self,
        conversation: &ConversationId,
        id: MessageId,
        update: &mut dyn FnMut(&mut MessageRecord),
    ) -> bool;

    fn group(&self, group: &GroupIdentity) -> Option<GroupRecord>;

    /// Insert or replace a group
    fn upsert_group(&self, record: GroupRecord);

    /// Apply `update` to the member set of a group
    ///
    /// Returns `None` if the group does not exist, otherwise what `update` returned.
    fn update_group_members(
        &self,
        group: &GroupIdentity,
        update: &mut dyn FnMut(&mut BTreeSet<Identity>) -> bool,
    ) -> Option<bool>;

    /// Returns `false` if the group does not exist
    fn set_group_user_state(&self, group: &GroupIdentity, state: GroupUserState) -> bool;

    fn settings(&self) -> Settings;

    fn apply_sync(&self, update: SyncUpdate);
}

#[derive(Debug, Default)]
struct ModelState {
    contacts: HashMap<Identity, ContactRecord>,
    messages: HashMap<(ConversationId, MessageId), MessageRecord>,
    groups: HashMap<GroupIdentity, GroupRecord>,
    settings: Settings,
}

/// In-memory [`ModelStore`]
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    state: Mutex<ModelState>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_contact(&self, contact: ContactRecord) {
        self.lock().contacts.insert(contact.identity, contact);
    }

    /// All messages of a conversation ordered by creation time
    pub fn messages(&self, conversation: &ConversationId) -> Vec<MessageRecord> {
        let mut messages: Vec<_> = self
            .lock()
            .messages
            .values()
            .filter(|m| m.conversation == *conversation)
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages
    }
}

impl ModelStore for MemoryModelStore {
    fn contact(&self, identity: &Identity) -> Option<ContactRecord> {
        self.lock().contacts.get(identity).cloned()
    }

    fn message(&self, conversation: &ConversationId, id: MessageId) -> Option<MessageRecord> {
        self.lock().messages.get(&(*conversation, id)).cloned()
    }

    fn insert_message(&self, record: MessageRecord) -> bool {
        let mut state = self.lock();
        let key = (record.conversation, record.id);
        if state.messages.contains_key(&key) {
            return false;
        }
        state.messages.insert(key, record);
        true
    }

    fn update_message(
        &self,
        conversation: &ConversationId,
        id: MessageId,
        update: &mut dyn FnMut(&mut MessageRecord),
    ) -> bool {
        match self.lock().messages.get_mut(&(*conversation, id)) {
            Some(record) => {
                update(record);
                true
            }
            None => false,
        }
    }

    fn group(&self, group: &GroupIdentity) -> Option<GroupRecord> {
        self.lock().groups.get(group).cloned()
    }

    fn upsert_group(&self, record: GroupRecord) {
        self.lock().groups.insert(record.group, record);
    }

    fn update_group_members(
        &self,
        group: &GroupIdentity,
        update: &mut dyn FnMut(&mut BTreeSet<Identity>) -> bool,
    ) -> Option<bool> {
        self.lock()
            .groups
            .get_mut(group)
            .map(|record| update(&mut record.members))
    }

    fn set_group_user_state(&self, group: &GroupIdentity, state: GroupUserState) -> bool {
        match self.lock().groups.get_mut(group) {
            Some(record) => {
                record.user_state = state;
                true
            }
            None => false,
        }
    }

    fn settings(&self) -> Settings {
        self.lock().settings
    }

    fn apply_sync(&self, update: SyncUpdate) {
        let mut state = self.lock();
        match update {
            SyncUpdate::Contact(ContactSync::Upsert {
                identity,
                public_key,
                nickname,
            }) => {
                state.contacts.insert(
                    identity,
                    ContactRecord {
                        identity,
                        public_key,
                        nickname,
                    },
                );
            }
            SyncUpdate::Contact(ContactSync::Delete { identity }) => {
                state.contacts.remove(&identity);
            }
            SyncUpdate::Group(GroupSync::Upsert {
                group,
                members,
                user_state,
            }) => {
                state.groups.insert(
                    group,
                    GroupRecord {
                        group,
                        members: members.into_iter().collect(),
                        user_state,
                    },
                );
            }
            SyncUpdate::Group(GroupSync::Delete { group }) => {
                state.groups.remove(&group);
            }
            SyncUpdate::Settings(settings) => {
                if let Some(value) = settings.send_read_receipts {
                    state.settings.send_read_receipts = value;
                }
                if let Some(value) = settings.send_typing_indicators {
                    state.settings.send_typing_indicators = value;
                }
            }
        }
        debug!("Applied sync update");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::GroupId;

    fn id(s: &str) -> Identity {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = MemoryModelStore::new();
        let conversation = ConversationId::Contact(id("ECHOECHO"));
        let record = MessageRecord::new(
            conversation,
            MessageId(1),
            MessageDirection::Inbound,
            id("ECHOECHO"),
            "hello",
            10,
        );
        assert!(store.insert_message(record.clone()));
        assert!(!store.insert_message(record));
        assert_eq!(store.messages(&conversation).len(), 1);
    }

    #[test]
    fn test_group_sync_and_member_update() {
        let store = MemoryModelStore::new();
        let group = GroupIdentity {
            creator: id("CREATOR1"),
            group_id: GroupId(9),
        };
        store.apply_sync(SyncUpdate::Group(GroupSync::Upsert {
            group,
            members: vec![id("MEMBER01"), id("MEMBER02")],
            user_state: GroupUserState::Member,
        }));
        let removed = store.update_group_members(&group, &mut |members| members.remove(&id("MEMBER01")));
        assert_eq!(removed, Some(true));
        assert!(store.group(&group).unwrap().is_participant(&id("CREATOR1")));
        assert!(!store.group(&group).unwrap().is_participant(&id("MEMBER01")));
    }

    #[test]
    fn test_settings_sync_is_partial() {
        let store = MemoryModelStore::new();
        store.apply_sync(SyncUpdate::Settings(SettingsSync {
            send_read_receipts: Some(false),
            send_typing_indicators: None,
        }));
        assert_eq!(
            store.settings(),
            Settings {
                send_read_receipts: false,
                send_typing_indicators: true
            }
        );
    }
}
