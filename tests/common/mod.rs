//! Shared fixtures for the integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use mdev_protocol::config::ProtocolConfig;
use mdev_protocol::crypto::{
    derive_device_group_keys, DeviceGroupKey, NonceScope, NonceService, SharedBoxFactory,
};
use mdev_protocol::protocol::csp::{CspPayload, MessageAck, MessageWithMetadataBox};
use mdev_protocol::protocol::d2m::{
    D2mMessage, DevicesInfo, DropDeviceAck, ReflectAck, TransactionEnded, TransactionRejected,
};
use mdev_protocol::protocol::e2e::E2eMessage;
use mdev_protocol::protocol::flags::CspMessageFlags;
use mdev_protocol::protocol::session::{InboundMessage, OutboundMessage};
use mdev_protocol::services::Services;
use mdev_protocol::task::codec::ConnectionHandle;
use mdev_protocol::task::model::{ContactRecord, MemoryModelStore};
use mdev_protocol::task::store::MemoryTaskStore;
use mdev_protocol::task::TaskManager;
use mdev_protocol::types::{Identity, MessageId};
use mdev_protocol::utils::metrics::Metrics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const OWN_IDENTITY: &[u8; 8] = b"OWNIDENT";
pub const CONTACT_IDENTITY: &[u8; 8] = b"CONTACT1";

pub fn identity(bytes: &[u8; 8]) -> Identity {
    Identity::from_bytes(*bytes).expect("valid identity")
}

/// A contact with its own key pair, so tests can encrypt as and decrypt for it
pub struct Peer {
    pub identity: Identity,
    pub key: SharedBoxFactory,
    pub nonces: NonceService,
}

impl Peer {
    pub fn new(bytes: &[u8; 8]) -> Self {
        Self {
            identity: identity(bytes),
            key: SharedBoxFactory::generate().expect("key"),
            nonces: NonceService::new(),
        }
    }

    pub fn record(&self) -> ContactRecord {
        ContactRecord {
            identity: self.identity,
            public_key: self.key.public_key(),
            nickname: None,
        }
    }

    /// Encrypt `message` as sent by this peer to us
    pub fn seal(&self, services: &Services, id: u64, message: &E2eMessage) -> MessageWithMetadataBox {
        let guard = self.nonces.next(NonceScope::Csp).expect("nonce");
        let nonce = *guard.nonce();
        let message_box = self
            .key
            .shared_box(&services.client_key.public_key())
            .encrypt(guard, &message.encode_padded())
            .expect("encrypt");
        MessageWithMetadataBox {
            sender: self.identity,
            receiver: services.identity,
            message_id: MessageId(id),
            created_at: 1_700_000_000,
            flags: CspMessageFlags::for_message_type(message.message_type()),
            metadata: Vec::new(),
            nonce,
            message_box,
        }
    }

    /// Open a message we sent to this peer
    pub fn open(&self, services: &Services, message: &MessageWithMetadataBox) -> E2eMessage {
        let plain = self
            .key
            .shared_box(&services.client_key.public_key())
            .decrypt(&message.nonce, &message.message_box)
            .expect("decrypt");
        E2eMessage::decode_padded(&plain).expect("decode")
    }
}

pub struct Fixture {
    pub services: Arc<Services>,
    pub model: Arc<MemoryModelStore>,
    pub store: Arc<MemoryTaskStore>,
    pub contact: Peer,
}

/// Retries fast enough for tests
pub fn test_config() -> ProtocolConfig {
    ProtocolConfig::default_with_overrides(|config| {
        config.tasks.retry_initial_delay = Duration::from_millis(5);
        config.tasks.retry_max_delay = Duration::from_millis(20);
    })
}

pub fn fixture_with_config(config: ProtocolConfig) -> Fixture {
    let model = Arc::new(MemoryModelStore::new());
    let contact = Peer::new(CONTACT_IDENTITY);
    model.add_contact(contact.record());

    let dgk = DeviceGroupKey::generate().expect("dgk");
    let services = Arc::new(Services {
        identity: identity(OWN_IDENTITY),
        client_key: SharedBoxFactory::generate().expect("client key"),
        device_group: derive_device_group_keys(dgk).expect("derive"),
        nonces: NonceService::new(),
        model: model.clone(),
        metrics: Arc::new(Metrics::new()),
        config,
    });
    Fixture {
        services,
        model,
        store: Arc::new(MemoryTaskStore::new()),
        contact,
    }
}

pub fn fixture() -> Fixture {
    fixture_with_config(test_config())
}

impl Fixture {
    pub fn manager(&self) -> TaskManager {
        TaskManager::new(self.services.clone(), self.store.clone())
    }
}

/// How the mock mediator misbehaves
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    /// Close the connection instead of acknowledging the reflect with this index
    pub close_on_reflect: Option<usize>,
    /// Reject the first begin-transaction, then report the competing one ended
    pub reject_first_transaction: bool,
    /// Close the connection instead of acking the outgoing message with this index
    pub close_on_message_ack: Option<usize>,
}

/// Answers the task side of a connection like the mediator and chat server would
pub struct MockMediator {
    pub connection: Arc<ConnectionHandle>,
    log: Arc<Mutex<Vec<OutboundMessage>>>,
    task: JoinHandle<()>,
}

impl MockMediator {
    /// Create a connection on `manager`, attach it and start answering
    pub fn attach(manager: &TaskManager, script: Script) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let connection = manager.create_connection(tx);
        manager.attach(connection.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(answer(connection.clone(), rx, log.clone(), script));
        Self {
            connection,
            log,
            task,
        }
    }

    pub fn log(&self) -> Vec<OutboundMessage> {
        self.log.lock().unwrap().clone()
    }

    /// Messages sent to the chat server
    pub fn sent_messages(&self) -> Vec<MessageWithMetadataBox> {
        self.log()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Csp(CspPayload::OutgoingMessage(message)) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn reflect_count(&self) -> usize {
        self.log()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::D2m(D2mMessage::Reflect(_))))
            .count()
    }

    pub fn count(&self, predicate: impl Fn(&OutboundMessage) -> bool) -> usize {
        self.log().iter().filter(|m| predicate(m)).count()
    }

    /// Wait until `predicate` matched at least `n` logged messages
    pub async fn wait_for(&self, n: usize, predicate: impl Fn(&OutboundMessage) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(&predicate) < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("mediator never saw the expected messages");
    }
}

impl Drop for MockMediator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn answer(
    connection: Arc<ConnectionHandle>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    log: Arc<Mutex<Vec<OutboundMessage>>>,
    script: Script,
) {
    let mut reflects = 0usize;
    let mut acks = 0usize;
    let mut timestamp = 1_000u64;
    let mut rejected = false;

    while let Some(message) = rx.recv().await {
        log.lock().unwrap().push(message.clone());
        let reply = match message {
            OutboundMessage::D2m(D2mMessage::Reflect(reflect)) => {
                let index = reflects;
                reflects += 1;
                if script.close_on_reflect == Some(index) {
                    connection.close();
                    return;
                }
                timestamp += 1;
                vec![d2m(D2mMessage::ReflectAck(ReflectAck {
                    reflect_id: reflect.reflect_id,
                    timestamp,
                }))]
            }
            OutboundMessage::D2m(D2mMessage::BeginTransaction(begin)) => {
                if script.reject_first_transaction && !rejected {
                    rejected = true;
                    vec![
                        d2m(D2mMessage::TransactionRejected(TransactionRejected {
                            device_id: 99,
                            encrypted_scope: begin.encrypted_scope.clone(),
                        })),
                        d2m(D2mMessage::TransactionEnded(TransactionEnded {
                            device_id: 99,
                            encrypted_scope: begin.encrypted_scope,
                        })),
                    ]
                } else {
                    vec![d2m(D2mMessage::BeginTransactionAck)]
                }
            }
            OutboundMessage::D2m(D2mMessage::CommitTransaction) => {
                vec![d2m(D2mMessage::CommitTransactionAck)]
            }
            OutboundMessage::D2m(D2mMessage::GetDevicesInfo) => {
                vec![d2m(D2mMessage::DevicesInfo(DevicesInfo {
                    augmented_device_info: Vec::new(),
                }))]
            }
            OutboundMessage::D2m(D2mMessage::DropDevice(drop)) => {
                vec![d2m(D2mMessage::DropDeviceAck(DropDeviceAck {
                    device_id: drop.device_id,
                }))]
            }
            OutboundMessage::Csp(CspPayload::OutgoingMessage(message)) if !message.flags.dont_ack => {
                let index = acks;
                acks += 1;
                if script.close_on_message_ack == Some(index) {
                    connection.close();
                    return;
                }
                vec![InboundMessage::Csp(CspPayload::OutgoingMessageAck(MessageAck {
                    identity: message.receiver,
                    message_id: message.message_id,
                }))]
            }
            _ => Vec::new(),
        };
        for inbound in reply {
            if let Some(unrouted) = connection.route(inbound) {
                panic!("mock reply not consumed: {unrouted:?}");
            }
        }
    }
}

fn d2m(message: D2mMessage) -> InboundMessage {
    InboundMessage::D2m(message)
}
