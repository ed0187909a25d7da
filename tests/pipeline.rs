//! Full pipeline runs against a byte-level mock mediator

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::fixture;
use futures::{SinkExt, StreamExt};
use mdev_protocol::core::codec::FrameCodec;
use mdev_protocol::core::frame::{D2mPayloadType, Frame};
use mdev_protocol::crypto::SharedBoxFactory;
use mdev_protocol::error::ProtocolError;
use mdev_protocol::protocol::csp::{CspPayload, MessageAck};
use mdev_protocol::protocol::d2m::{D2mMessage, DeviceSlotState, ReflectAck, ServerHello, ServerInfo};
use mdev_protocol::protocol::handshake::{
    server_hello, server_login_ack, server_verify_login, CspTransport,
};
use mdev_protocol::protocol::state::{CspAuthState, D2mAuthState};
use mdev_protocol::task::{ActiveTask, TaskOutput};
use mdev_protocol::types::{ConversationId, MessageId};
use mdev_protocol::{ConnectionContext, Pipeline};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

const TIMEOUT: Duration = Duration::from_secs(5);

type ServerFramed = Framed<DuplexStream, FrameCodec>;

/// What the mock server received after the handshake
#[derive(Debug)]
enum Received {
    Csp(CspPayload),
    D2m(D2mMessage),
}

async fn next_frame(framed: &mut ServerFramed) -> Frame {
    framed.next().await.expect("stream open").expect("valid frame")
}

async fn next_proxy(framed: &mut ServerFramed) -> Vec<u8> {
    loop {
        let frame = next_frame(framed).await;
        if frame.kind == D2mPayloadType::Proxy {
            return frame.payload.to_vec();
        }
    }
}

async fn send_d2m(framed: &mut ServerFramed, message: D2mMessage) {
    framed.send(message.into_frame().unwrap()).await.unwrap();
}

async fn send_proxy(framed: &mut ServerFramed, data: Vec<u8>) {
    framed
        .send(Frame::new(D2mPayloadType::Proxy, data))
        .await
        .unwrap();
}

/// Server side of both logins
async fn accept(
    framed: &mut ServerFramed,
    server_key: &SharedBoxFactory,
    client_public_key: [u8; 32],
) -> CspTransport {
    let hello = next_proxy(framed).await;
    let (state, reply) = server_hello(server_key, &hello).unwrap();
    send_d2m(
        framed,
        D2mMessage::ServerHello(ServerHello {
            version: 0,
            esk: SharedBoxFactory::generate().unwrap().public_key(),
            challenge: vec![9u8; 32],
        }),
    )
    .await;
    send_proxy(framed, reply).await;

    let login = next_proxy(framed).await;
    let (state, _identity, extensions) =
        server_verify_login(state, server_key, |_| Some(client_public_key), &login).unwrap();
    assert!(extensions.client_info.starts_with("mdev-protocol/"));
    let (transport, ack) = server_login_ack(state).unwrap();
    send_proxy(framed, ack).await;

    send_d2m(
        framed,
        D2mMessage::ServerInfo(ServerInfo {
            current_time: 0,
            max_device_slots: 4,
            device_slot_state: DeviceSlotState::Existing,
            encrypted_shared_device_data: Vec::new(),
            reflection_queue_length: 0,
        }),
    )
    .await;
    send_d2m(framed, D2mMessage::ReflectionQueueDry).await;
    send_d2m(framed, D2mMessage::RolePromotedToLeader).await;
    transport
}

/// Answer reflects and outgoing messages, reporting everything received
async fn serve(mut framed: ServerFramed, transport: CspTransport, events: mpsc::UnboundedSender<Received>) {
    let mut timestamp = 5_000;
    while let Some(Ok(frame)) = framed.next().await {
        if frame.kind == D2mPayloadType::Proxy {
            let payload = CspPayload::decode(&transport.decrypt(&frame.payload).unwrap()).unwrap();
            if let CspPayload::OutgoingMessage(message) = &payload {
                let ack = CspPayload::OutgoingMessageAck(MessageAck {
                    identity: message.receiver,
                    message_id: message.message_id,
                });
                let sealed = transport.encrypt(&ack.encode().unwrap()).unwrap();
                send_proxy(&mut framed, sealed).await;
            }
            let _ = events.send(Received::Csp(payload));
        } else {
            let message = D2mMessage::decode(frame.kind, frame.payload).unwrap();
            if let D2mMessage::Reflect(reflect) = &message {
                timestamp += 1;
                send_d2m(
                    &mut framed,
                    D2mMessage::ReflectAck(ReflectAck {
                        reflect_id: reflect.reflect_id,
                        timestamp,
                    }),
                )
                .await;
            }
            let _ = events.send(Received::D2m(message));
        }
    }
}

#[tokio::test]
async fn test_handshake_then_task_then_server_close() {
    let fixture = fixture();
    let manager = fixture.manager();
    let server_key = SharedBoxFactory::generate().unwrap();
    let client_public_key = fixture.services.client_key.public_key();
    let conversation = ConversationId::Contact(fixture.contact.identity);

    // Persistent, so it waits for the connection to authenticate
    let handle = manager
        .schedule(ActiveTask::SendMessage {
            conversation,
            message_id: MessageId(77),
            text: "over the wire".into(),
            created_at: 1_700_000_000_000,
        })
        .await
        .unwrap();

    let (client, server) = tokio::io::duplex(64 * 1024);
    let pipeline = Pipeline::spawn(
        client,
        ConnectionContext {
            server_public_key: server_key.public_key(),
        },
        &manager,
    )
    .unwrap();

    let mut framed = Framed::new(server, FrameCodec::default());
    let transport = tokio::time::timeout(TIMEOUT, accept(&mut framed, &server_key, client_public_key))
        .await
        .unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let server = tokio::spawn(serve(framed, transport, events_tx));

    let output = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(output, TaskOutput::SentAt(_)));
    assert!(pipeline.authenticated());

    let is_unblock = |r: &Received| matches!(r, Received::Csp(CspPayload::UnblockIncomingMessages));
    let is_idle = |r: &Received| matches!(r, Received::Csp(CspPayload::SetConnectionIdleTimeout(30)));
    let is_outgoing = |r: &Received| matches!(r, Received::Csp(CspPayload::OutgoingMessage(_)));
    let expected: [fn(&Received) -> bool; 3] = [is_unblock, is_idle, is_outgoing];
    let mut received = Vec::new();
    while !expected
        .iter()
        .all(|predicate| received.iter().any(predicate))
    {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .unwrap()
            .expect("server running");
        received.push(event);
    }
    let reflect = received
        .iter()
        .position(|r| matches!(r, Received::D2m(D2mMessage::Reflect(_))))
        .unwrap();
    let outgoing = received.iter().position(is_outgoing).unwrap();
    assert!(reflect < outgoing);

    // Mediator goes away
    server.abort();
    let states = pipeline.states().clone();
    let result = tokio::time::timeout(TIMEOUT, pipeline.closed()).await.unwrap();
    assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    assert_eq!(states.csp(), CspAuthState::ClientHello);
    assert_eq!(states.d2m(), D2mAuthState::AwaitServerHello);

    let snapshot = fixture.services.metrics.snapshot();
    assert_eq!(snapshot.handshakes_success, 1);
    assert_eq!(snapshot.connections_active, 0);
    assert_eq!(snapshot.protocol_errors, 1);
}

#[tokio::test]
async fn test_invalid_frame_length_is_fatal() {
    let fixture = fixture();
    let manager = fixture.manager();
    let (client, mut server) = tokio::io::duplex(1024);
    let pipeline = Pipeline::spawn(
        client,
        ConnectionContext {
            server_public_key: [1u8; 32],
        },
        &manager,
    )
    .unwrap();

    server.write_all(&0x7fff_ffffu32.to_le_bytes()).await.unwrap();
    let result = tokio::time::timeout(TIMEOUT, pipeline.closed()).await.unwrap();
    let error = result.unwrap_err();
    assert!(matches!(error, ProtocolError::InvalidFrameLength(_)));
    assert!(error.is_fatal());
    assert_eq!(fixture.services.metrics.snapshot().handshakes_failed, 1);
}

#[tokio::test]
async fn test_local_close_before_authentication() {
    let fixture = fixture();
    let manager = fixture.manager();
    let (client, server) = tokio::io::duplex(1024);
    let pipeline = Pipeline::spawn(
        client,
        ConnectionContext {
            server_public_key: [1u8; 32],
        },
        &manager,
    )
    .unwrap();

    // The client-hello is written before anything else
    let mut framed = Framed::new(server, FrameCodec::default());
    let hello = tokio::time::timeout(TIMEOUT, next_proxy(&mut framed)).await.unwrap();
    assert_eq!(hello.len(), 32 + 16);
    assert!(!pipeline.authenticated());

    pipeline.close();
    tokio::time::timeout(TIMEOUT, pipeline.closed())
        .await
        .unwrap()
        .unwrap();
}
