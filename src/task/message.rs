//! Outgoing conversation messages: text, edits, deletions, receipts and typing
//! indicators.
//!
//! Everything that is reflected is reflected before it is sent to the chat server, so a
//! crash between the two never leaves other devices unaware of a sent message. A send
//! cut short by a lost connection resumes with the receivers that have not acked yet.

use crate::crypto::nonce::NonceScope;
use crate::error::{TaskError, TaskResult};
use crate::protocol::csp::MessageWithMetadataBox;
use crate::protocol::e2e::{DeliveryReceipt, E2eMessage, ReceiptStatus};
use crate::protocol::envelope::{Envelope, IncomingMessageUpdate, OutgoingMessage, OutgoingMessageUpdate};
use crate::protocol::flags::CspMessageFlags;
use crate::services::Services;
use crate::task::codec::TaskCodec;
use crate::task::model::{MessageDirection, MessageRecord};
use crate::task::receipt::{apply_delivery_receipt, ReceiptSource};
use crate::task::TaskOutput;
use crate::types::{ConversationId, GroupUserState, Identity, MessageId};
use crate::utils::time::{unix_millis, unix_seconds_u32};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Encrypt `message` for `receiver` with a fresh CSP nonce
pub(crate) fn encrypt_message(
    services: &Services,
    receiver: Identity,
    message: &E2eMessage,
    message_id: MessageId,
    created_at: u64,
) -> TaskResult<MessageWithMetadataBox> {
    let contact = services
        .model
        .contact(&receiver)
        .ok_or_else(|| TaskError::Permanent(format!("Unknown contact {receiver}")))?;
    let guard = services.nonces.next(NonceScope::Csp)?;
    let nonce = *guard.nonce();
    let message_box = services
        .client_key
        .shared_box(&contact.public_key)
        .encrypt(guard, &message.encode_padded())?;
    Ok(MessageWithMetadataBox {
        sender: services.identity,
        receiver,
        message_id,
        created_at: unix_seconds_u32(created_at),
        flags: CspMessageFlags::for_message_type(message.message_type()),
        metadata: Vec::new(),
        nonce,
        message_box,
    })
}

/// Participants of a conversation other than ourselves
pub(crate) fn recipients(
    services: &Services,
    conversation: ConversationId,
) -> TaskResult<Vec<Identity>> {
    match conversation {
        ConversationId::Contact(identity) => Ok(vec![identity]),
        ConversationId::Group(group) => {
            let record = services
                .model
                .group(&group)
                .ok_or_else(|| TaskError::Permanent(format!("Unknown group {group}")))?;
            if record.user_state != GroupUserState::Member {
                return Err(TaskError::Permanent(format!(
                    "Not a member of group {group}"
                )));
            }
            let participants: BTreeSet<Identity> = std::iter::once(record.group.creator)
                .chain(record.members.iter().copied())
                .filter(|member| *member != services.identity)
                .collect();
            Ok(participants.into_iter().collect())
        }
    }
}

/// Reflect `message` as outgoing and send it to every recipient
///
/// Every receiver is encrypted for before anything is reflected, so an unknown contact
/// fails the task without side effects. If the model holds a record for `message_id`,
/// the reflection and each acked receiver are recorded on it and skipped on a retry.
///
/// Returns the reflection timestamp.
pub(crate) async fn reflect_and_send(
    codec: &TaskCodec,
    conversation: ConversationId,
    receivers: &[Identity],
    message: &E2eMessage,
    message_id: MessageId,
    created_at: u64,
) -> TaskResult<u64> {
    let services = codec.services();
    let model = services.model.as_ref();
    let progress = model.message(&conversation, message_id);
    let boxes = receivers
        .iter()
        .filter(|receiver| {
            !progress
                .as_ref()
                .is_some_and(|record| record.acked_by.contains(*receiver))
        })
        .map(|receiver| encrypt_message(services, *receiver, message, message_id, created_at))
        .collect::<TaskResult<Vec<_>>>()?;

    let reflected_at = match progress.and_then(|record| record.reflected_at) {
        Some(reflected_at) => {
            debug!(pending = boxes.len(), "Already reflected, resuming send");
            reflected_at
        }
        None => {
            let reflected_at = codec
                .reflect_one(Envelope::OutgoingMessage(OutgoingMessage {
                    conversation,
                    message_id,
                    created_at,
                    message_type: message.message_type(),
                    body: message.encode_body(),
                }))
                .await?;
            model.update_message(&conversation, message_id, &mut |record| {
                record.reflected_at = Some(reflected_at);
            });
            reflected_at
        }
    };

    for boxed in boxes {
        let receiver = boxed.receiver;
        codec.send_csp_message(boxed).await?;
        model.update_message(&conversation, message_id, &mut |record| {
            record.acked_by.insert(receiver);
        });
    }
    Ok(reflected_at)
}

fn check_grace_period(
    message_id: MessageId,
    sent_at: u64,
    now: u64,
    grace: Duration,
) -> TaskResult<()> {
    let grace_millis = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
    if now.saturating_sub(sent_at) > grace_millis {
        return Err(TaskError::GracePeriodExpired(message_id.to_string()));
    }
    Ok(())
}

/// Look up an own, sent, not deleted message that may still be modified
fn editable_message(
    services: &Services,
    conversation: ConversationId,
    message_id: MessageId,
) -> TaskResult<MessageRecord> {
    let record = services
        .model
        .message(&conversation, message_id)
        .ok_or_else(|| TaskError::Permanent(format!("Unknown message {message_id}")))?;
    if record.direction != MessageDirection::Outbound {
        return Err(TaskError::Permanent(format!(
            "Message {message_id} was not sent by us"
        )));
    }
    if record.deleted_at.is_some() {
        return Err(TaskError::Permanent(format!("Message {message_id} is deleted")));
    }
    let sent_at = record
        .sent_at
        .ok_or_else(|| TaskError::Permanent(format!("Message {message_id} was not sent yet")))?;
    check_grace_period(
        message_id,
        sent_at,
        unix_millis(),
        services.config.tasks.edit_grace_period,
    )?;
    Ok(record)
}

#[instrument(skip(codec, text), fields(%conversation, %message_id))]
pub(crate) async fn send_message(
    codec: &TaskCodec,
    conversation: ConversationId,
    message_id: MessageId,
    text: &str,
    created_at: u64,
) -> TaskResult<TaskOutput> {
    let services = codec.services();
    let model = services.model.as_ref();
    match model.message(&conversation, message_id) {
        Some(MessageRecord {
            sent_at: Some(sent_at),
            ..
        }) => {
            debug!("Message already sent");
            return Ok(TaskOutput::SentAt(sent_at));
        }
        Some(_) => {}
        None => {
            model.insert_message(MessageRecord::new(
                conversation,
                message_id,
                MessageDirection::Outbound,
                services.identity,
                text,
                created_at,
            ));
        }
    }

    let message = match conversation {
        ConversationId::Contact(_) => E2eMessage::Text(text.to_owned()),
        ConversationId::Group(group) => E2eMessage::GroupText {
            group,
            text: text.to_owned(),
        },
    };
    let receivers = recipients(services, conversation)?;
    let sent_at =
        reflect_and_send(codec, conversation, &receivers, &message, message_id, created_at).await?;

    // Recorded before the update is reflected so a retry does not send again
    model.update_message(&conversation, message_id, &mut |record| {
        record.sent_at = Some(sent_at);
    });
    codec
        .reflect_one(Envelope::OutgoingMessageUpdate(OutgoingMessageUpdate {
            conversation,
            message_id,
        }))
        .await?;
    info!(receivers = receivers.len(), sent_at, "Message sent");
    Ok(TaskOutput::SentAt(sent_at))
}

#[instrument(skip(codec, text), fields(%conversation, %message_id))]
pub(crate) async fn edit_message(
    codec: &TaskCodec,
    conversation: ConversationId,
    message_id: MessageId,
    text: &str,
) -> TaskResult<TaskOutput> {
    let services = codec.services();
    editable_message(services, conversation, message_id)?;

    let message = match conversation {
        ConversationId::Contact(_) => E2eMessage::EditMessage {
            message_id,
            text: text.to_owned(),
        },
        ConversationId::Group(group) => E2eMessage::GroupEditMessage {
            group,
            message_id,
            text: text.to_owned(),
        },
    };
    let receivers = recipients(services, conversation)?;
    let edited_at = reflect_and_send(
        codec,
        conversation,
        &receivers,
        &message,
        MessageId::random(),
        unix_millis(),
    )
    .await?;
    services
        .model
        .update_message(&conversation, message_id, &mut |record| {
            record.text = text.to_owned();
            record.edited_at = Some(edited_at);
        });
    Ok(TaskOutput::Done)
}

#[instrument(skip(codec), fields(%conversation, %message_id))]
pub(crate) async fn delete_message(
    codec: &TaskCodec,
    conversation: ConversationId,
    message_id: MessageId,
) -> TaskResult<TaskOutput> {
    let services = codec.services();
    editable_message(services, conversation, message_id)?;

    let message = match conversation {
        ConversationId::Contact(_) => E2eMessage::DeleteMessage { message_id },
        ConversationId::Group(group) => E2eMessage::GroupDeleteMessage { group, message_id },
    };
    let receivers = recipients(services, conversation)?;
    let deleted_at = reflect_and_send(
        codec,
        conversation,
        &receivers,
        &message,
        MessageId::random(),
        unix_millis(),
    )
    .await?;
    services
        .model
        .update_message(&conversation, message_id, &mut |record| {
            record.text.clear();
            record.deleted_at = Some(deleted_at);
        });
    Ok(TaskOutput::Done)
}

#[instrument(skip(codec, message_ids), fields(%conversation, count = message_ids.len()))]
pub(crate) async fn send_delivery_receipt(
    codec: &TaskCodec,
    conversation: ConversationId,
    status: ReceiptStatus,
    message_ids: &[MessageId],
) -> TaskResult<TaskOutput> {
    let services = codec.services();
    let receipt = DeliveryReceipt {
        status,
        message_ids: message_ids.to_vec(),
    };
    let now = unix_millis();

    if status == ReceiptStatus::Read && !services.model.settings().send_read_receipts {
        debug!("Read receipts disabled, only syncing read state");
        let updates = message_ids
            .iter()
            .map(|message_id| {
                Envelope::IncomingMessageUpdate(IncomingMessageUpdate {
                    conversation,
                    message_id: *message_id,
                    read_at: now,
                })
            })
            .collect();
        codec.reflect(updates).await?;
    } else {
        let message = match conversation {
            ConversationId::Contact(_) => E2eMessage::DeliveryReceipt(receipt.clone()),
            ConversationId::Group(group) => E2eMessage::GroupDeliveryReceipt {
                group,
                receipt: receipt.clone(),
            },
        };
        let receivers = recipients(services, conversation)?;
        reflect_and_send(
            codec,
            conversation,
            &receivers,
            &message,
            MessageId::random(),
            now,
        )
        .await?;
    }

    apply_delivery_receipt(
        services.model.as_ref(),
        conversation,
        services.identity,
        &receipt,
        now,
        ReceiptSource::Reflected,
    );
    Ok(TaskOutput::Done)
}

pub(crate) async fn send_typing_indicator(
    codec: &TaskCodec,
    contact: Identity,
    is_typing: bool,
) -> TaskResult<TaskOutput> {
    let services = codec.services();
    if !services.model.settings().send_typing_indicators {
        return Ok(TaskOutput::Done);
    }
    let boxed = encrypt_message(
        services,
        contact,
        &E2eMessage::TypingIndicator(is_typing),
        MessageId::random(),
        unix_millis(),
    )?;
    codec.send_csp_message(boxed).await?;
    Ok(TaskOutput::Done)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(6 * 60 * 60);

    #[test]
    fn test_grace_period_boundary() {
        let sent_at = 1_000_000;
        let grace_millis = 6 * 60 * 60 * 1000;
        assert!(check_grace_period(MessageId(1), sent_at, sent_at + grace_millis, GRACE).is_ok());
        assert!(matches!(
            check_grace_period(MessageId(1), sent_at, sent_at + grace_millis + 1, GRACE),
            Err(TaskError::GracePeriodExpired(_))
        ));
    }

    #[test]
    fn test_clock_skew_is_not_expiry() {
        assert!(check_grace_period(MessageId(1), 5_000, 1_000, GRACE).is_ok());
    }
}
