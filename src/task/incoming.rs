//! Passive tasks: end-to-end messages from the chat server and envelopes reflected by
//! other devices.
//!
//! An incoming message is decrypted, reflected to the other devices, applied to the
//! model and only then acknowledged, so the chat server redelivers it after a crash.
//! Its nonce is committed once the message was applied. Messages that need an answer
//! (a group sync request, or a leave for a group we do not know) are answered before
//! the ack; envelopes reflected by other devices never are.

use crate::crypto::nonce::NonceScope;
use crate::error::{ProtocolError, TaskError, TaskResult};
use crate::protocol::csp::MessageWithMetadataBox;
use crate::protocol::d2m::{D2mMessage, Reflected, ReflectedAck};
use crate::protocol::e2e::{CspE2eType, E2eMessage};
use crate::protocol::envelope::{open_envelope, Envelope, IncomingMessage};
use crate::protocol::session::OutboundMessage;
use crate::services::Services;
use crate::task::codec::TaskCodec;
use crate::task::group::{
    answer_sync_request, apply_group_setup, handle_group_leave, send_sync_request,
};
use crate::task::model::{MessageDirection, MessageRecord, ModelStore, SyncUpdate};
use crate::task::receipt::{apply_delivery_receipt, ReceiptSource};
use crate::types::{ConversationId, GroupIdentity, Identity, MessageId};
use crate::utils::time::unix_millis;
use tracing::{debug, error, info, instrument, warn};

/// Who wrote a message that is being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Author {
    /// A contact; the message arrived from the chat server or was reflected as incoming
    Contact(Identity),
    /// We did, on another device
    OwnDevice,
}

/// Message sent in reaction to an applied one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    RequestGroupSync(GroupIdentity),
    AnswerGroupSync {
        group: GroupIdentity,
        requester: Identity,
    },
}

impl FollowUp {
    async fn run(self, codec: &TaskCodec) -> TaskResult<()> {
        match self {
            FollowUp::RequestGroupSync(group) => send_sync_request(codec, group).await,
            FollowUp::AnswerGroupSync { group, requester } => {
                answer_sync_request(codec, group, requester).await
            }
        }
    }
}

fn log_unknown_group(group: &GroupIdentity, sender: &Identity) {
    info!(%group, %sender, "Leave for an unknown or left group");
}

/// Group an incoming message belongs to
///
/// Decrypts without importing the nonce; the task handling the message does that.
pub(crate) fn incoming_group(
    services: &Services,
    message: &MessageWithMetadataBox,
) -> Option<GroupIdentity> {
    let contact = services.model.contact(&message.sender)?;
    let plain = services
        .client_key
        .shared_box(&contact.public_key)
        .decrypt(&message.nonce, &message.message_box)
        .ok()?;
    E2eMessage::decode_padded(&plain)
        .ok()?
        .group(message.sender, message.receiver)
}

/// Update text of an existing message if `author` wrote it
fn modify_message(
    model: &dyn ModelStore,
    conversation: ConversationId,
    message_id: MessageId,
    author: Identity,
    modify: &mut dyn FnMut(&mut MessageRecord),
) {
    match model.message(&conversation, message_id) {
        Some(record) if record.sender == author && record.deleted_at.is_none() => {
            model.update_message(&conversation, message_id, modify);
        }
        Some(_) => warn!(%conversation, %message_id, "Modification by someone other than the author, ignoring"),
        None => debug!(%conversation, %message_id, "Modification of an unknown message, ignoring"),
    }
}

/// Apply decoded message content to the model
///
/// Returns the message to send in reaction, if any.
fn apply_message(
    services: &Services,
    author: Author,
    conversation_hint: Option<ConversationId>,
    message_id: MessageId,
    created_at: u64,
    at: u64,
    message: E2eMessage,
) -> Option<FollowUp> {
    let model = services.model.as_ref();
    let mut follow_up = None;
    let (direction, sender) = match author {
        Author::Contact(identity) => (MessageDirection::Inbound, identity),
        Author::OwnDevice => (MessageDirection::Outbound, services.identity),
    };
    let source = match author {
        Author::Contact(_) => ReceiptSource::Remote,
        Author::OwnDevice => ReceiptSource::Reflected,
    };
    let direct = conversation_hint.unwrap_or(ConversationId::Contact(sender));

    match message {
        E2eMessage::Text(text) => {
            let record = MessageRecord::new(direct, message_id, direction, sender, text, created_at);
            if !model.insert_message(record) {
                debug!(%message_id, "Duplicate message, ignoring");
            }
        }
        E2eMessage::GroupText { group, text } => {
            let known = model
                .group(&group)
                .is_some_and(|record| record.is_participant(&sender));
            if known || author == Author::OwnDevice {
                let record = MessageRecord::new(
                    ConversationId::Group(group),
                    message_id,
                    direction,
                    sender,
                    text,
                    created_at,
                );
                model.insert_message(record);
            } else {
                warn!(%group, %sender, "Group message from a non-member, discarding");
            }
        }
        E2eMessage::GroupSetup { group_id, members } => match author {
            Author::Contact(creator) => {
                apply_group_setup(model, &services.identity, creator, group_id, members)
            }
            Author::OwnDevice => debug!("Own group setup, synced separately"),
        },
        E2eMessage::GroupLeave { group } => match author {
            Author::Contact(sender) => {
                handle_group_leave(model, &group, &sender, |group, sender| {
                    log_unknown_group(group, sender);
                    if model.group(group).is_none() && group.creator != services.identity {
                        follow_up = Some(FollowUp::RequestGroupSync(*group));
                    }
                });
            }
            Author::OwnDevice => debug!(%group, "Own group leave, synced separately"),
        },
        E2eMessage::GroupSyncRequest { group_id } => match author {
            Author::Contact(requester) => {
                let group = GroupIdentity {
                    creator: services.identity,
                    group_id,
                };
                follow_up = Some(FollowUp::AnswerGroupSync { group, requester });
            }
            Author::OwnDevice => debug!(?group_id, "Own group sync request"),
        },
        E2eMessage::DeliveryReceipt(receipt) => {
            apply_delivery_receipt(model, direct, sender, &receipt, at, source);
        }
        E2eMessage::GroupDeliveryReceipt { group, receipt } => {
            apply_delivery_receipt(model, ConversationId::Group(group), sender, &receipt, at, source);
        }
        E2eMessage::TypingIndicator(is_typing) => {
            debug!(%sender, is_typing, "Typing indicator");
        }
        E2eMessage::EditMessage { message_id, text } => {
            modify_message(model, direct, message_id, sender, &mut |record| {
                record.text = text.clone();
                record.edited_at = Some(at);
            });
        }
        E2eMessage::GroupEditMessage {
            group,
            message_id,
            text,
        } => {
            modify_message(model, ConversationId::Group(group), message_id, sender, &mut |record| {
                record.text = text.clone();
                record.edited_at = Some(at);
            });
        }
        E2eMessage::DeleteMessage { message_id } => {
            modify_message(model, direct, message_id, sender, &mut |record| {
                record.text.clear();
                record.deleted_at = Some(at);
            });
        }
        E2eMessage::GroupDeleteMessage { group, message_id } => {
            modify_message(model, ConversationId::Group(group), message_id, sender, &mut |record| {
                record.text.clear();
                record.deleted_at = Some(at);
            });
        }
    }
    follow_up
}

#[instrument(skip_all, fields(sender = %message.sender, message_id = %message.message_id))]
pub(crate) async fn process_incoming(
    codec: &TaskCodec,
    message: &MessageWithMetadataBox,
) -> TaskResult<()> {
    let services = codec.services();
    let sender = message.sender;
    let message_id = message.message_id;
    let ack = !message.flags.dont_ack;

    if message.receiver != services.identity {
        warn!(receiver = %message.receiver, "Message for another identity, discarding");
        if ack {
            codec.ack_incoming(sender, message_id).await?;
        }
        return Ok(());
    }

    let guard = match services.nonces.import(NonceScope::Csp, message.nonce) {
        Ok(guard) => guard,
        Err(e) => {
            warn!(error = %e, "Replayed message, discarding");
            if ack {
                codec.ack_incoming(sender, message_id).await?;
            }
            return Ok(());
        }
    };

    let Some(contact) = services.model.contact(&sender) else {
        warn!("Message from an unknown contact, discarding");
        guard.discard();
        if ack {
            codec.ack_incoming(sender, message_id).await?;
        }
        return Ok(());
    };

    let decoded = services
        .client_key
        .shared_box(&contact.public_key)
        .decrypt(&message.nonce, &message.message_box)
        .map_err(ProtocolError::from)
        .and_then(|plain| E2eMessage::decode_padded(&plain));
    let content = match decoded {
        Ok(content) => content,
        Err(e) => {
            error!(error = %e, "Undecryptable message, discarding");
            guard.discard();
            if ack {
                codec.ack_incoming(sender, message_id).await?;
            }
            return Err(TaskError::Protocol(e));
        }
    };

    let created_at = u64::from(message.created_at) * 1000;
    let message_type = content.message_type();
    let at = if message_type == CspE2eType::TypingIndicator {
        unix_millis()
    } else {
        let reflected = codec
            .reflect_one(Envelope::IncomingMessage(IncomingMessage {
                sender,
                message_id,
                created_at,
                message_type,
                body: content.encode_body(),
            }))
            .await;
        match reflected {
            Ok(at) => at,
            Err(e) => {
                guard.discard();
                return Err(e.into());
            }
        }
    };

    let follow_up = apply_message(
        services,
        Author::Contact(sender),
        None,
        message_id,
        created_at,
        at,
        content,
    );
    guard.commit();
    debug!(?message_type, "Incoming message processed");

    if let Some(follow_up) = follow_up {
        if let Err(e) = follow_up.run(codec).await {
            warn!(error = %e, ?follow_up, "Answer to incoming message failed");
        }
    }

    if ack {
        codec.ack_incoming(sender, message_id).await?;
    }
    Ok(())
}

#[instrument(skip_all, fields(reflect_id = reflected.reflect_id))]
pub(crate) async fn process_reflected(codec: &TaskCodec, reflected: &Reflected) -> TaskResult<()> {
    let services = codec.services();
    services.metrics.reflection_received();

    let opened = open_envelope(
        &reflected.envelope,
        &services.device_group.dgrk,
        &services.nonces,
    );
    let result = match opened {
        Ok((device_id, envelope)) => {
            debug!(device_id, envelope = envelope.name(), "Reflected envelope");
            apply_envelope(services, envelope, reflected.timestamp);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Unreadable reflected envelope, discarding");
            Err(TaskError::Protocol(e))
        }
    };

    if !reflected.flags.ephemeral {
        codec
            .write(OutboundMessage::D2m(D2mMessage::ReflectedAck(ReflectedAck {
                reflect_id: reflected.reflect_id,
            })))
            .await?;
    }
    result
}

/// Apply an envelope reflected by another device
///
/// Answers are left to the device that received the message from the chat server.
fn apply_envelope(services: &Services, envelope: Envelope, timestamp: u64) {
    let model = services.model.as_ref();
    match envelope {
        Envelope::OutgoingMessage(outgoing) => {
            match E2eMessage::decode_body(outgoing.message_type, &outgoing.body) {
                Ok(content) => {
                    apply_message(
                        services,
                        Author::OwnDevice,
                        Some(outgoing.conversation),
                        outgoing.message_id,
                        outgoing.created_at,
                        timestamp,
                        content,
                    );
                }
                Err(e) => warn!(error = %e, "Undecodable outgoing message body"),
            }
        }
        Envelope::OutgoingMessageUpdate(update) => {
            let found = model.update_message(&update.conversation, update.message_id, &mut |record| {
                record.sent_at.get_or_insert(timestamp);
            });
            if !found {
                debug!(message_id = %update.message_id, "Sent update for an unknown message");
            }
        }
        Envelope::IncomingMessage(incoming) => {
            match E2eMessage::decode_body(incoming.message_type, &incoming.body) {
                Ok(content) => {
                    if let Some(follow_up) = apply_message(
                        services,
                        Author::Contact(incoming.sender),
                        None,
                        incoming.message_id,
                        incoming.created_at,
                        timestamp,
                        content,
                    ) {
                        debug!(?follow_up, "Answered by the receiving device");
                    }
                }
                Err(e) => warn!(error = %e, "Undecodable incoming message body"),
            }
        }
        Envelope::IncomingMessageUpdate(update) => {
            model.update_message(&update.conversation, update.message_id, &mut |record| {
                record.read_at.get_or_insert(update.read_at);
            });
        }
        Envelope::ContactSync(sync) => model.apply_sync(SyncUpdate::Contact(sync)),
        Envelope::GroupSync(sync) => model.apply_sync(SyncUpdate::Group(sync)),
        Envelope::SettingsSync(sync) => model.apply_sync(SyncUpdate::Settings(sync)),
    }
}
