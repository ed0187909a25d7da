//! Group membership: inbound setup and leave handling, and the active tasks changing
//! membership.
//!
//! Membership changes made locally run inside a `GroupSync` D2M transaction so two
//! devices of the same identity cannot change the same group concurrently. Every
//! receiver is encrypted for before the change is reflected.

use crate::error::{TaskError, TaskResult};
use crate::protocol::csp::MessageWithMetadataBox;
use crate::protocol::e2e::E2eMessage;
use crate::protocol::envelope::{D2mTransactionScope, Envelope, GroupSync};
use crate::services::Services;
use crate::task::codec::{TaskCodec, TransactionOutcome};
use crate::task::message::{encrypt_message, recipients, reflect_and_send};
use crate::task::model::{GroupRecord, ModelStore};
use crate::task::TaskOutput;
use crate::types::{ConversationId, GroupId, GroupIdentity, GroupUserState, Identity, MessageId};
use crate::utils::time::unix_millis;
use std::collections::BTreeSet;
use tracing::{debug, info, instrument, warn};

/// Result of handling an inbound group leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The creator cannot leave its own group
    CreatorIgnored,
    /// Group unknown or left by us, handed to the unknown-group handler
    Delegated,
    /// Whether the sender was a member before
    Removed(bool),
}

/// Remove `sender` from `group` after it announced leaving
///
/// Replays are harmless: a second leave from the same sender returns `Removed(false)`.
pub fn handle_group_leave<F>(
    model: &dyn ModelStore,
    group: &GroupIdentity,
    sender: &Identity,
    on_unknown_group: F,
) -> LeaveOutcome
where
    F: FnOnce(&GroupIdentity, &Identity),
{
    if *sender == group.creator {
        warn!(%group, "Group creator sent a leave, ignoring");
        return LeaveOutcome::CreatorIgnored;
    }
    match model.group(group) {
        Some(record) if record.user_state == GroupUserState::Member => {}
        _ => {
            on_unknown_group(group, sender);
            return LeaveOutcome::Delegated;
        }
    }
    match model.update_group_members(group, &mut |members| members.remove(sender)) {
        Some(removed) => {
            debug!(%group, %sender, removed, "Member left group");
            LeaveOutcome::Removed(removed)
        }
        None => {
            on_unknown_group(group, sender);
            LeaveOutcome::Delegated
        }
    }
}

/// Apply a group setup sent by the group creator
pub fn apply_group_setup(
    model: &dyn ModelStore,
    own_identity: &Identity,
    creator: Identity,
    group_id: GroupId,
    members: Vec<Identity>,
) {
    let group = GroupIdentity { creator, group_id };
    let members: BTreeSet<Identity> = members.into_iter().filter(|m| *m != creator).collect();
    let user_state = if members.contains(own_identity) {
        GroupUserState::Member
    } else {
        GroupUserState::Kicked
    };
    if user_state == GroupUserState::Kicked && model.group(&group).is_none() {
        debug!(%group, "Setup of an unknown group without us, ignoring");
        return;
    }
    info!(%group, members = members.len(), ?user_state, "Group setup applied");
    model.upsert_group(GroupRecord {
        group,
        members,
        user_state,
    });
}

/// Encrypt `message` for every receiver except ourselves
///
/// Fails before anything is sent if a receiver is not a known contact.
fn seal_for_all(
    services: &Services,
    receivers: impl IntoIterator<Item = Identity>,
    message: &E2eMessage,
) -> TaskResult<Vec<MessageWithMetadataBox>> {
    let message_id = MessageId::random();
    let created_at = unix_millis();
    receivers
        .into_iter()
        .filter(|receiver| *receiver != services.identity)
        .map(|receiver| encrypt_message(services, receiver, message, message_id, created_at))
        .collect()
}

async fn send_sealed(codec: &TaskCodec, boxes: Vec<MessageWithMetadataBox>) -> TaskResult<()> {
    for boxed in boxes {
        codec.send_csp_message(boxed).await?;
    }
    Ok(())
}

/// Ask the creator of `group` for its current state
pub(crate) async fn send_sync_request(codec: &TaskCodec, group: GroupIdentity) -> TaskResult<()> {
    if group.creator == codec.services().identity {
        return Err(TaskError::Permanent(format!(
            "Cannot request a sync of own group {group}"
        )));
    }
    let message = E2eMessage::GroupSyncRequest {
        group_id: group.group_id,
    };
    reflect_and_send(
        codec,
        ConversationId::Contact(group.creator),
        &[group.creator],
        &message,
        MessageId::random(),
        unix_millis(),
    )
    .await?;
    info!(%group, "Group sync requested");
    Ok(())
}

/// Answer a sync request for one of our groups with its member list
///
/// A requester that is not a member, or a group we left, gets an empty member list.
pub(crate) async fn answer_sync_request(
    codec: &TaskCodec,
    group: GroupIdentity,
    requester: Identity,
) -> TaskResult<()> {
    let Some(record) = codec.services().model.group(&group) else {
        debug!(%group, %requester, "Sync request for an unknown group, discarding");
        return Ok(());
    };
    let members: Vec<Identity> =
        if record.user_state == GroupUserState::Member && record.members.contains(&requester) {
            record.members.iter().copied().collect()
        } else {
            debug!(%group, %requester, "Sync request from a non-member");
            Vec::new()
        };
    let setup = E2eMessage::GroupSetup {
        group_id: group.group_id,
        members,
    };
    reflect_and_send(
        codec,
        ConversationId::Contact(requester),
        &[requester],
        &setup,
        MessageId::random(),
        unix_millis(),
    )
    .await?;
    Ok(())
}

#[instrument(skip(codec), fields(%group))]
pub(crate) async fn request_sync(codec: &TaskCodec, group: GroupIdentity) -> TaskResult<TaskOutput> {
    send_sync_request(codec, group).await?;
    Ok(TaskOutput::Done)
}

fn require_creator(codec: &TaskCodec, group: &GroupIdentity) -> TaskResult<()> {
    if group.creator != codec.services().identity {
        return Err(TaskError::Permanent(format!(
            "Only the creator may change the members of {group}"
        )));
    }
    Ok(())
}

fn require_group(model: &dyn ModelStore, group: &GroupIdentity) -> TaskResult<GroupRecord> {
    model
        .group(group)
        .ok_or_else(|| TaskError::Permanent(format!("Unknown group {group}")))
}

#[instrument(skip(codec), fields(%group))]
pub(crate) async fn leave_group(codec: &TaskCodec, group: GroupIdentity) -> TaskResult<TaskOutput> {
    let services = codec.services();
    let model = services.model.as_ref();
    if group.creator == services.identity {
        return Err(TaskError::Permanent(
            "The creator cannot leave its own group".into(),
        ));
    }
    require_group(model, &group)?;

    let still_member = || {
        model
            .group(&group)
            .is_some_and(|record| record.user_state == GroupUserState::Member)
    };
    let outcome = codec
        .transaction(D2mTransactionScope::GroupSync, still_member, async {
            let record = require_group(model, &group)?;
            let receivers = recipients(services, ConversationId::Group(group))?;
            let boxes = seal_for_all(services, receivers, &E2eMessage::GroupLeave { group })?;
            codec
                .reflect_one(Envelope::GroupSync(GroupSync::Upsert {
                    group,
                    members: record.members.iter().copied().collect(),
                    user_state: GroupUserState::Left,
                }))
                .await?;
            send_sealed(codec, boxes).await?;
            model.set_group_user_state(&group, GroupUserState::Left);
            Ok(())
        })
        .await?;

    match outcome {
        TransactionOutcome::Committed(()) => info!("Left group"),
        TransactionOutcome::Aborted => info!("Group already left"),
    }
    Ok(TaskOutput::Done)
}

#[instrument(skip(codec), fields(%group, %member))]
pub(crate) async fn add_member(
    codec: &TaskCodec,
    group: GroupIdentity,
    member: Identity,
) -> TaskResult<TaskOutput> {
    require_creator(codec, &group)?;
    let services = codec.services();
    let model = services.model.as_ref();
    require_group(model, &group)?;

    let can_add = || {
        model.group(&group).is_some_and(|record| {
            record.user_state == GroupUserState::Member && !record.members.contains(&member)
        })
    };
    let outcome = codec
        .transaction(D2mTransactionScope::GroupSync, can_add, async {
            let mut members = require_group(model, &group)?.members;
            members.insert(member);
            let setup = E2eMessage::GroupSetup {
                group_id: group.group_id,
                members: members.iter().copied().collect(),
            };
            let boxes = seal_for_all(services, members.iter().copied(), &setup)?;
            codec
                .reflect_one(Envelope::GroupSync(GroupSync::Upsert {
                    group,
                    members: members.iter().copied().collect(),
                    user_state: GroupUserState::Member,
                }))
                .await?;
            send_sealed(codec, boxes).await?;
            model.update_group_members(&group, &mut |members| members.insert(member));
            Ok(())
        })
        .await?;

    if outcome == TransactionOutcome::Aborted {
        debug!("Already a member, nothing to do");
    }
    Ok(TaskOutput::Done)
}

#[instrument(skip(codec), fields(%group, %member))]
pub(crate) async fn remove_member(
    codec: &TaskCodec,
    group: GroupIdentity,
    member: Identity,
) -> TaskResult<TaskOutput> {
    require_creator(codec, &group)?;
    let services = codec.services();
    let model = services.model.as_ref();
    require_group(model, &group)?;

    let can_remove = || {
        model.group(&group).is_some_and(|record| {
            record.user_state == GroupUserState::Member && record.members.contains(&member)
        })
    };
    let outcome = codec
        .transaction(D2mTransactionScope::GroupSync, can_remove, async {
            let mut members = require_group(model, &group)?.members;
            members.remove(&member);
            // The removed member learns about the removal from the new member list
            let setup = E2eMessage::GroupSetup {
                group_id: group.group_id,
                members: members.iter().copied().collect(),
            };
            let boxes = seal_for_all(
                services,
                members.iter().copied().chain(std::iter::once(member)),
                &setup,
            )?;
            codec
                .reflect_one(Envelope::GroupSync(GroupSync::Upsert {
                    group,
                    members: members.iter().copied().collect(),
                    user_state: GroupUserState::Member,
                }))
                .await?;
            send_sealed(codec, boxes).await?;
            model.update_group_members(&group, &mut |members| members.remove(&member));
            Ok(())
        })
        .await?;

    Ok(TaskOutput::MemberRemoved(
        outcome == TransactionOutcome::Committed(()),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::task::model::MemoryModelStore;
    use proptest::prelude::*;

    fn id(s: &str) -> Identity {
        s.parse().unwrap()
    }

    fn group_with(store: &MemoryModelStore, members: &[&str]) -> GroupIdentity {
        let group = GroupIdentity {
            creator: id("CREATOR1"),
            group_id: GroupId(3),
        };
        store.upsert_group(GroupRecord {
            group,
            members: members.iter().map(|m| id(m)).collect(),
            user_state: GroupUserState::Member,
        });
        group
    }

    #[test]
    fn test_creator_leave_ignored() {
        let store = MemoryModelStore::new();
        let group = group_with(&store, &["MEMBER01"]);
        let outcome = handle_group_leave(&store, &group, &id("CREATOR1"), |_, _| {
            panic!("creator leave must not be delegated")
        });
        assert_eq!(outcome, LeaveOutcome::CreatorIgnored);
    }

    #[test]
    fn test_unknown_group_delegated() {
        let store = MemoryModelStore::new();
        let group = GroupIdentity {
            creator: id("CREATOR1"),
            group_id: GroupId(99),
        };
        let mut delegated = false;
        let outcome = handle_group_leave(&store, &group, &id("MEMBER01"), |_, _| delegated = true);
        assert_eq!(outcome, LeaveOutcome::Delegated);
        assert!(delegated);
    }

    #[test]
    fn test_setup_without_us_kicks() {
        let store = MemoryModelStore::new();
        let me = id("MYSELF01");
        let group = group_with(&store, &["MYSELF01", "MEMBER01"]);
        apply_group_setup(&store, &me, group.creator, group.group_id, vec![id("MEMBER01")]);
        assert_eq!(
            store.group(&group).unwrap().user_state,
            GroupUserState::Kicked
        );
    }

    proptest! {
        #[test]
        fn prop_leave_is_idempotent(index in 0usize..3, replays in 1usize..4) {
            let names = ["MEMBER01", "MEMBER02", "MEMBER03"];
            let store = MemoryModelStore::new();
            let group = group_with(&store, &names);
            let sender = id(names[index]);

            let first = handle_group_leave(&store, &group, &sender, |_, _| {});
            prop_assert_eq!(first, LeaveOutcome::Removed(true));
            for _ in 0..replays {
                let again = handle_group_leave(&store, &group, &sender, |_, _| {});
                prop_assert_eq!(again, LeaveOutcome::Removed(false));
            }
            prop_assert_eq!(store.group(&group).unwrap().members.len(), 2);
        }
    }
}
