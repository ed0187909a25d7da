//! Delivery receipt application.
//!
//! A receipt sent by the peer applies to our outbound messages. A receipt reflected by
//! another of our devices is one we sent, so it applies to inbound messages. Status
//! timestamps are only ever set once; reactions are replaced per participant. A
//! delivered or read status for an outbound message we never sent is skipped.

use crate::protocol::e2e::{DeliveryReceipt, ReceiptStatus};
use crate::task::model::{MessageDirection, MessageRecord, ModelStore, Reaction, ReactionKind};
use crate::types::{ConversationId, Identity, MessageId};
use tracing::{debug, warn};

/// Where a receipt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptSource {
    /// Sent by `sender` to us
    Remote,
    /// Sent by us from another device
    Reflected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Applied,
    UnknownMessage,
    WrongDirection,
    Deleted,
    /// Delivery status for an outbound message that was never sent
    NotSent,
}

/// Apply `receipt` to every referenced message of `conversation`
///
/// `sender` is the participant the receipt is attributed to. Unknown or mismatching
/// messages are logged and skipped; the remaining ids are still applied.
pub fn apply_delivery_receipt(
    model: &dyn ModelStore,
    conversation: ConversationId,
    sender: Identity,
    receipt: &DeliveryReceipt,
    at: u64,
    source: ReceiptSource,
) -> Vec<(MessageId, ReceiptOutcome)> {
    let expected = match source {
        ReceiptSource::Remote => MessageDirection::Outbound,
        ReceiptSource::Reflected => MessageDirection::Inbound,
    };

    receipt
        .message_ids
        .iter()
        .map(|id| {
            let outcome = match model.message(&conversation, *id) {
                None => ReceiptOutcome::UnknownMessage,
                Some(record) if record.direction != expected => ReceiptOutcome::WrongDirection,
                Some(record) if record.deleted_at.is_some() => ReceiptOutcome::Deleted,
                Some(record)
                    if record.direction == MessageDirection::Outbound
                        && record.sent_at.is_none()
                        && matches!(receipt.status, ReceiptStatus::Received | ReceiptStatus::Read) =>
                {
                    ReceiptOutcome::NotSent
                }
                Some(_) => {
                    model.update_message(&conversation, *id, &mut |record| {
                        apply_status(record, sender, receipt.status, at)
                    });
                    ReceiptOutcome::Applied
                }
            };
            match outcome {
                ReceiptOutcome::Applied => {
                    debug!(%conversation, message_id = %id, status = ?receipt.status, "Receipt applied")
                }
                other => {
                    warn!(%conversation, message_id = %id, ?other, "Receipt not applicable, skipping")
                }
            }
            (*id, outcome)
        })
        .collect()
}

fn apply_status(
    record: &mut MessageRecord,
    sender: Identity,
    status: ReceiptStatus,
    at: u64,
) {
    match status {
        ReceiptStatus::Received => {
            record.delivered_at.get_or_insert(at);
        }
        ReceiptStatus::Read => {
            record.delivered_at.get_or_insert(at);
            record.read_at.get_or_insert(at);
        }
        ReceiptStatus::Acknowledged | ReceiptStatus::Declined => {
            let kind = if status == ReceiptStatus::Acknowledged {
                ReactionKind::Acknowledge
            } else {
                ReactionKind::Decline
            };
            record.reactions.retain(|reaction| reaction.sender != sender);
            record.reactions.push(Reaction { sender, kind, at });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::task::model::MemoryModelStore;

    fn setup() -> (MemoryModelStore, ConversationId, Identity, Identity) {
        let me: Identity = "MYSELF01".parse().unwrap();
        let peer: Identity = "ECHOECHO".parse().unwrap();
        let conversation = ConversationId::Contact(peer);
        let store = MemoryModelStore::new();
        let mut sent = MessageRecord::new(
            conversation,
            MessageId(1),
            MessageDirection::Outbound,
            me,
            "out",
            1,
        );
        sent.sent_at = Some(1);
        store.insert_message(sent);
        store.insert_message(MessageRecord::new(
            conversation,
            MessageId(2),
            MessageDirection::Inbound,
            peer,
            "in",
            2,
        ));
        (store, conversation, me, peer)
    }

    fn receipt(status: ReceiptStatus, ids: &[u64]) -> DeliveryReceipt {
        DeliveryReceipt {
            status,
            message_ids: ids.iter().copied().map(MessageId).collect(),
        }
    }

    #[test]
    fn test_remote_read_applies_to_outbound_only() {
        let (store, conversation, _, peer) = setup();
        let outcomes = apply_delivery_receipt(
            &store,
            conversation,
            peer,
            &receipt(ReceiptStatus::Read, &[1, 2, 3]),
            50,
            ReceiptSource::Remote,
        );
        assert_eq!(
            outcomes,
            vec![
                (MessageId(1), ReceiptOutcome::Applied),
                (MessageId(2), ReceiptOutcome::WrongDirection),
                (MessageId(3), ReceiptOutcome::UnknownMessage),
            ]
        );
        let out = store.message(&conversation, MessageId(1)).unwrap();
        assert_eq!(out.read_at, Some(50));
        assert_eq!(out.delivered_at, Some(50));
    }

    #[test]
    fn test_delivery_status_skips_unsent_message() {
        let (store, conversation, me, peer) = setup();
        store.insert_message(MessageRecord::new(
            conversation,
            MessageId(4),
            MessageDirection::Outbound,
            me,
            "queued",
            4,
        ));
        for status in [ReceiptStatus::Received, ReceiptStatus::Read] {
            let outcomes = apply_delivery_receipt(
                &store,
                conversation,
                peer,
                &receipt(status, &[4, 1]),
                60,
                ReceiptSource::Remote,
            );
            assert_eq!(
                outcomes,
                vec![
                    (MessageId(4), ReceiptOutcome::NotSent),
                    (MessageId(1), ReceiptOutcome::Applied),
                ]
            );
        }
        let queued = store.message(&conversation, MessageId(4)).unwrap();
        assert_eq!(queued.delivered_at, None);
        assert_eq!(queued.read_at, None);
    }

    #[test]
    fn test_status_timestamps_set_once() {
        let (store, conversation, _, peer) = setup();
        for at in [10, 20] {
            apply_delivery_receipt(
                &store,
                conversation,
                peer,
                &receipt(ReceiptStatus::Received, &[1]),
                at,
                ReceiptSource::Remote,
            );
        }
        let out = store.message(&conversation, MessageId(1)).unwrap();
        assert_eq!(out.delivered_at, Some(10));
    }

    #[test]
    fn test_reaction_replaced_per_sender() {
        let (store, conversation, me, _) = setup();
        for (status, at) in [(ReceiptStatus::Acknowledged, 5), (ReceiptStatus::Declined, 6)] {
            apply_delivery_receipt(
                &store,
                conversation,
                me,
                &receipt(status, &[2]),
                at,
                ReceiptSource::Reflected,
            );
        }
        let inbound = store.message(&conversation, MessageId(2)).unwrap();
        assert_eq!(
            inbound.reactions,
            vec![Reaction {
                sender: me,
                kind: ReactionKind::Decline,
                at: 6
            }]
        );
    }
}
