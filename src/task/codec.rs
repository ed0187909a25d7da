//! Connection handle and the codec tasks talk through.
//!
//! [`ConnectionHandle`] is created per pipeline. It owns the sending half of the
//! pipeline's task channel and a router matching inbound acknowledgements and responses
//! to the tasks waiting for them. Closing the handle drops every waiter, which fails the
//! waiting tasks with `ConnectionClosed`.
//!
//! [`TaskCodec`] is what a task run receives: writes, reflections, CSP message sends with
//! their acks and D2M transactions.

use crate::error::{ProtocolError, Result, TaskError, TaskResult};
use crate::protocol::csp::{CspPayload, MessageAck, MessageWithMetadataBox};
use crate::protocol::d2m::{BeginTransaction, D2mMessage, DevicesInfo, DropDevice, Reflect};
use crate::protocol::envelope::{seal_envelope, D2mTransactionScope, Envelope};
use crate::protocol::flags::D2mMessageFlags;
use crate::protocol::session::{InboundMessage, OutboundMessage};
use crate::services::Services;
use crate::types::{DeviceId, Identity, MessageId};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionResponse {
    BeginAck,
    CommitAck,
    Rejected,
}

#[derive(Debug, Default)]
struct Router {
    closed: bool,
    reflect_acks: HashMap<u32, oneshot::Sender<u64>>,
    message_acks: HashMap<(Identity, MessageId), oneshot::Sender<()>>,
    transaction_response: Option<oneshot::Sender<TransactionResponse>>,
    transaction_ended: Vec<oneshot::Sender<()>>,
    devices_info: VecDeque<oneshot::Sender<DevicesInfo>>,
    drop_device_acks: HashMap<DeviceId, oneshot::Sender<()>>,
}

pub struct ConnectionHandle {
    generation: u64,
    outbound: mpsc::Sender<OutboundMessage>,
    router: Mutex<Router>,
    transaction_lock: tokio::sync::Mutex<()>,
    next_reflect_id: AtomicU32,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(generation: u64, outbound: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            generation,
            outbound,
            router: Mutex::new(Router::default()),
            transaction_lock: tokio::sync::Mutex::new(()),
            next_reflect_id: AtomicU32::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn router(&self) -> MutexGuard<'_, Router> {
        self.router.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection closed
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Fail all waiting tasks and refuse new waiters
    pub fn close(&self) {
        let mut router = self.router();
        if router.closed {
            return;
        }
        *router = Router {
            closed: true,
            ..Router::default()
        };
        drop(router);
        self.closed.cancel();
        debug!(generation = self.generation, "Connection handle closed");
    }

    /// Hand a message to the pipeline writer
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Deliver acknowledgements and responses to their waiters
    ///
    /// Returns the message if no waiter consumed it.
    pub fn route(&self, message: InboundMessage) -> Option<InboundMessage> {
        let mut router = self.router();
        match message {
            InboundMessage::Csp(CspPayload::OutgoingMessageAck(ack)) => {
                match router.message_acks.remove(&(ack.identity, ack.message_id)) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => debug!(identity = %ack.identity, message_id = %ack.message_id, "Unmatched message ack"),
                }
                None
            }
            InboundMessage::Csp(CspPayload::IncomingMessageAck(ack)) => {
                warn!(identity = %ack.identity, "Chat server sent an incoming message ack, ignoring");
                None
            }
            InboundMessage::D2m(D2mMessage::ReflectAck(ack)) => {
                match router.reflect_acks.remove(&ack.reflect_id) {
                    Some(waiter) => {
                        let _ = waiter.send(ack.timestamp);
                    }
                    None => debug!(reflect_id = ack.reflect_id, "Unmatched reflect ack"),
                }
                None
            }
            InboundMessage::D2m(D2mMessage::BeginTransactionAck) => {
                Self::resolve_transaction(&mut router, TransactionResponse::BeginAck);
                None
            }
            InboundMessage::D2m(D2mMessage::CommitTransactionAck) => {
                Self::resolve_transaction(&mut router, TransactionResponse::CommitAck);
                None
            }
            InboundMessage::D2m(D2mMessage::TransactionRejected(rejected)) => {
                debug!(device_id = rejected.device_id, "Transaction rejected");
                Self::resolve_transaction(&mut router, TransactionResponse::Rejected);
                None
            }
            InboundMessage::D2m(D2mMessage::TransactionEnded(ended)) => {
                trace!(device_id = ended.device_id, "Transaction of another device ended");
                for waiter in router.transaction_ended.drain(..) {
                    let _ = waiter.send(());
                }
                None
            }
            InboundMessage::D2m(D2mMessage::DevicesInfo(info)) => {
                match router.devices_info.pop_front() {
                    Some(waiter) => {
                        let _ = waiter.send(info);
                    }
                    None => debug!("Unrequested devices info"),
                }
                None
            }
            InboundMessage::D2m(D2mMessage::DropDeviceAck(ack)) => {
                match router.drop_device_acks.remove(&ack.device_id) {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    None => debug!(device_id = ack.device_id, "Unmatched drop device ack"),
                }
                None
            }
            other => Some(other),
        }
    }

    fn resolve_transaction(router: &mut Router, response: TransactionResponse) {
        match router.transaction_response.take() {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => warn!(?response, "Transaction response without pending transaction"),
        }
    }

    fn register<T>(
        &self,
        insert: impl FnOnce(&mut Router, oneshot::Sender<T>),
    ) -> Result<oneshot::Receiver<T>> {
        let mut router = self.router();
        if router.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        let (sender, receiver) = oneshot::channel();
        insert(&mut router, sender);
        Ok(receiver)
    }

    fn next_reflect_id(&self) -> u32 {
        self.next_reflect_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn wait<T>(receiver: oneshot::Receiver<T>) -> Result<T> {
    receiver.await.map_err(|_| ProtocolError::ConnectionClosed)
}

/// Outcome of [`TaskCodec::transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome<T> {
    Committed(T),
    /// The precondition no longer held, nothing was executed
    Aborted,
}

/// Protocol access of a running task
pub struct TaskCodec {
    connection: Arc<ConnectionHandle>,
    services: Arc<Services>,
}

impl TaskCodec {
    pub fn new(connection: Arc<ConnectionHandle>, services: Arc<Services>) -> Self {
        Self {
            connection,
            services,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub async fn write(&self, message: OutboundMessage) -> Result<()> {
        self.connection.send(message).await
    }

    /// Reflect envelopes to the other devices and wait for all acks
    ///
    /// All envelopes are written before the first ack is awaited. Returns the mediator
    /// timestamps in envelope order.
    pub async fn reflect(&self, envelopes: Vec<Envelope>) -> Result<Vec<u64>> {
        let services = &self.services;
        let mut pending = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let name = envelope.name();
            let sealed = seal_envelope(
                envelope,
                services.device_id(),
                &services.device_group.dgrk,
                &services.nonces,
            )?;
            let reflect_id = self.connection.next_reflect_id();
            let ack = self
                .connection
                .register(|router, waiter| {
                    router.reflect_acks.insert(reflect_id, waiter);
                })?;
            self.write(OutboundMessage::D2m(D2mMessage::Reflect(Reflect {
                flags: D2mMessageFlags::default(),
                reflect_id,
                envelope: Bytes::from(sealed),
            })))
            .await?;
            services.metrics.reflection_sent();
            trace!(reflect_id, envelope = name, "Reflected");
            pending.push(ack);
        }

        let mut timestamps = Vec::with_capacity(pending.len());
        for ack in pending {
            timestamps.push(wait(ack).await?);
        }
        Ok(timestamps)
    }

    pub async fn reflect_one(&self, envelope: Envelope) -> Result<u64> {
        self.reflect(vec![envelope])
            .await?
            .pop()
            .ok_or(ProtocolError::ConnectionClosed)
    }

    /// Send an end-to-end message, waiting for the server ack unless it is not acked
    pub async fn send_csp_message(&self, message: MessageWithMetadataBox) -> Result<()> {
        let ack = if message.flags.dont_ack {
            None
        } else {
            let key = (message.receiver, message.message_id);
            Some(self.connection.register(|router, waiter| {
                router.message_acks.insert(key, waiter);
            })?)
        };
        let receiver = message.receiver;
        let message_id = message.message_id;
        self.write(OutboundMessage::Csp(CspPayload::OutgoingMessage(message)))
            .await?;
        if let Some(ack) = ack {
            wait(ack).await?;
            trace!(%receiver, %message_id, "Message acked");
        }
        Ok(())
    }

    /// Acknowledge an incoming message to the chat server
    pub async fn ack_incoming(&self, sender: Identity, message_id: MessageId) -> Result<()> {
        self.write(OutboundMessage::Csp(CspPayload::IncomingMessageAck(
            MessageAck {
                identity: sender,
                message_id,
            },
        )))
        .await
    }

    pub async fn devices_info(&self) -> Result<DevicesInfo> {
        let response = self.connection.register(|router, waiter| {
            router.devices_info.push_back(waiter);
        })?;
        self.write(OutboundMessage::D2m(D2mMessage::GetDevicesInfo))
            .await?;
        wait(response).await
    }

    pub async fn drop_device(&self, device_id: DeviceId) -> Result<()> {
        let ack = self.connection.register(|router, waiter| {
            router.drop_device_acks.insert(device_id, waiter);
        })?;
        self.write(OutboundMessage::D2m(D2mMessage::DropDevice(DropDevice {
            device_id,
        })))
        .await?;
        wait(ack).await
    }

    /// Run `execute` inside a D2M transaction of `scope`
    ///
    /// `precondition` is checked before every begin attempt and once more after the
    /// transaction started. A rejected begin waits for the competing transaction to end
    /// and tries again. Only one transaction per connection is in flight. An error of
    /// `execute` is returned once the transaction was committed.
    #[instrument(skip_all, fields(?scope))]
    pub async fn transaction<T, P, F>(
        &self,
        scope: D2mTransactionScope,
        precondition: P,
        execute: F,
    ) -> TaskResult<TransactionOutcome<T>>
    where
        P: Fn() -> bool,
        F: Future<Output = TaskResult<T>>,
    {
        let _guard = self.connection.transaction_lock.lock().await;
        let services = &self.services;
        let encrypted_scope = scope.encrypt(&services.device_group.dgtsk, &services.nonces)?;

        loop {
            if !precondition() {
                debug!("Precondition failed before transaction");
                return Ok(TransactionOutcome::Aborted);
            }
            let response = self.connection.register(|router, waiter| {
                router.transaction_response = Some(waiter);
            })?;
            let ended = self.connection.register(|router, waiter| {
                router.transaction_ended.retain(|w| !w.is_closed());
                router.transaction_ended.push(waiter);
            })?;
            self.write(OutboundMessage::D2m(D2mMessage::BeginTransaction(
                BeginTransaction {
                    encrypted_scope: encrypted_scope.clone(),
                    ttl: 0,
                },
            )))
            .await?;

            match wait(response).await? {
                TransactionResponse::BeginAck => break,
                TransactionResponse::Rejected => {
                    debug!("Transaction rejected, waiting for the other device");
                    wait(ended).await?;
                }
                TransactionResponse::CommitAck => {
                    return Err(ProtocolError::UnexpectedMessage(
                        "commit-transaction-ack before begin-transaction-ack".into(),
                    )
                    .into());
                }
            }
        }

        let executed = if precondition() {
            Some(execute.await)
        } else {
            debug!("Precondition failed inside transaction");
            None
        };

        // A begun transaction is always committed, a failed execution included
        let committed = self.commit().await;
        let outcome = match executed {
            Some(Err(error)) => {
                if let Err(commit) = committed {
                    debug!(error = %commit, "Commit after a failed execution failed");
                }
                return Err(error);
            }
            Some(Ok(value)) => TransactionOutcome::Committed(value),
            None => TransactionOutcome::Aborted,
        };
        committed.map(|()| outcome)
    }

    async fn commit(&self) -> TaskResult<()> {
        let commit = self.connection.register(|router, waiter| {
            router.transaction_response = Some(waiter);
        })?;
        self.write(OutboundMessage::D2m(D2mMessage::CommitTransaction))
            .await?;
        match wait(commit).await? {
            TransactionResponse::CommitAck => Ok(()),
            other => Err(TaskError::Protocol(ProtocolError::UnexpectedMessage(format!(
                "{other:?} while committing a transaction"
            )))),
        }
    }
}
