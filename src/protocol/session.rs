//! Layer 3: CSP and D2M session.
//!
//! The decoder runs both logins. It answers the CSP server-hello with a login and the
//! D2M server-hello with a client-hello, and opens the CSP transport on login-ack. Once
//! both logins completed it decrypts CSP payloads and forwards them with all other D2M
//! messages.
//!
//! The encoder is the only place CSP payloads are encrypted, so sequence numbers follow
//! the order frames are written. It rejects payloads for a channel that has not
//! authenticated yet.

use crate::config::{D2M_PROTOCOL_VERSION_MAX, D2M_PROTOCOL_VERSION_MIN};
use crate::crypto::nonce::NonceScope;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::csp::CspPayload;
use crate::protocol::d2m::{
    ClientHello, D2mMessage, DeviceSlotExpirationPolicy, DeviceSlotState,
    DeviceSlotsExhaustedPolicy, ServerHello,
};
use crate::protocol::handshake::{
    client_login, client_verify_login_ack, client_verify_server_hello, ClientHelloState,
    ClientLoginState, CspTransport, LoginExtensions,
};
use crate::protocol::mediator::{InboundL2Message, OutboundL2Message};
use crate::protocol::state::{AuthStates, CspAuthState, D2mAuthState};
use crate::services::Services;
use bytes::Bytes;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument, warn};

/// Authenticated message handed to the upper layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Csp(CspPayload),
    D2m(D2mMessage),
}

/// Message from the upper layers, encrypted and gated by layer 3
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Csp(CspPayload),
    D2m(D2mMessage),
}

/// Input of the layer 3 encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundL3Message {
    /// Login traffic produced by the decoder, bypasses authentication gating
    Handshake(OutboundL2Message),
    Message(OutboundMessage),
}

/// The CSP transport, opened by the decoder and used by the encoder
pub type SharedTransport = Arc<OnceLock<CspTransport>>;

enum CspLogin {
    AwaitServerHello(ClientHelloState),
    AwaitLoginAck(ClientLoginState),
    Done,
}

pub struct SessionDecoder {
    services: Arc<Services>,
    server_public_key: [u8; 32],
    states: AuthStates,
    transport: SharedTransport,
    login: CspLogin,
    reflection_queue_dry: bool,
    promoted_to_leader: bool,
    unblocked: bool,
}

impl SessionDecoder {
    /// `hello` is the state of the client-hello the pipeline sends first
    pub fn new(
        services: Arc<Services>,
        server_public_key: [u8; 32],
        states: AuthStates,
        transport: SharedTransport,
        hello: ClientHelloState,
    ) -> Self {
        Self {
            services,
            server_public_key,
            states,
            transport,
            login: CspLogin::AwaitServerHello(hello),
            reflection_queue_dry: false,
            promoted_to_leader: false,
            unblocked: false,
        }
    }

    /// Decode one message, pushing any replies to `replies`
    pub fn decode(
        &mut self,
        message: InboundL2Message,
        replies: &mut Vec<OutboundL3Message>,
    ) -> Result<Option<InboundMessage>> {
        match message {
            InboundL2Message::CspServerHello(data) => {
                self.handle_server_hello(&data, replies)?;
                Ok(None)
            }
            InboundL2Message::CspLoginAck(data) => {
                self.handle_login_ack(&data, replies)?;
                Ok(None)
            }
            InboundL2Message::CspPayload(data) => self.handle_payload(&data),
            InboundL2Message::D2m(message) => self.handle_d2m(message, replies),
        }
    }

    #[instrument(skip_all)]
    fn handle_server_hello(&mut self, data: &[u8], replies: &mut Vec<OutboundL3Message>) -> Result<()> {
        let hello = match std::mem::replace(&mut self.login, CspLogin::Done) {
            CspLogin::AwaitServerHello(hello) => hello,
            _ => {
                return Err(ProtocolError::UnexpectedMessage(
                    constants::ERR_CSP_STATE.into(),
                ))
            }
        };
        let session = &self.services.config.session;
        let verified = client_verify_server_hello(hello, &self.server_public_key, data)?;
        let (login, message) = client_login(
            verified,
            &self.services.identity,
            &self.services.client_key,
            &self.server_public_key,
            &LoginExtensions {
                client_info: session.client_info.clone(),
                csp_device_id: session.csp_device_id,
            },
        )?;
        self.login = CspLogin::AwaitLoginAck(login);
        replies.push(OutboundL3Message::Handshake(OutboundL2Message::Proxy(
            Bytes::from(message),
        )));
        self.states.set_csp(CspAuthState::LoginAck);
        Ok(())
    }

    #[instrument(skip_all)]
    fn handle_login_ack(&mut self, data: &[u8], replies: &mut Vec<OutboundL3Message>) -> Result<()> {
        let login = match std::mem::replace(&mut self.login, CspLogin::Done) {
            CspLogin::AwaitLoginAck(login) => login,
            _ => {
                return Err(ProtocolError::UnexpectedMessage(
                    constants::ERR_CSP_STATE.into(),
                ))
            }
        };
        let transport = client_verify_login_ack(login, data)?;
        if self.transport.set(transport).is_err() {
            return Err(ProtocolError::UnexpectedMessage(
                constants::ERR_CSP_STATE.into(),
            ));
        }
        self.states.set_csp(CspAuthState::Complete);
        info!("CSP login complete");
        self.maybe_unblock(replies);
        Ok(())
    }

    fn handle_payload(&mut self, data: &[u8]) -> Result<Option<InboundMessage>> {
        let transport = self
            .transport
            .get()
            .ok_or(ProtocolError::NotAuthenticated(constants::ERR_CSP_NOT_AUTHENTICATED))?;
        let plain = transport.decrypt(data)?;
        let payload = match CspPayload::decode(&plain) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Discarding inbound CSP payload");
                return Ok(None);
            }
        };
        match payload {
            CspPayload::QueueSendComplete => {
                info!("CSP message queue is dry");
                Ok(None)
            }
            CspPayload::LastEphemeralKeyHash(hash) => {
                debug!(hash = %hex::encode(hash), "Server reported last ephemeral key hash");
                Ok(None)
            }
            payload => Ok(Some(InboundMessage::Csp(payload))),
        }
    }

    fn handle_d2m(
        &mut self,
        message: D2mMessage,
        replies: &mut Vec<OutboundL3Message>,
    ) -> Result<Option<InboundMessage>> {
        match message {
            D2mMessage::ServerHello(hello) => {
                let client_hello = self.client_hello(&hello)?;
                replies.push(OutboundL3Message::Handshake(OutboundL2Message::D2m(
                    D2mMessage::ClientHello(client_hello),
                )));
                Ok(None)
            }
            D2mMessage::ServerInfo(info) => {
                info!(
                    max_device_slots = info.max_device_slots,
                    reflection_queue_length = info.reflection_queue_length,
                    "D2M login complete"
                );
                Ok(None)
            }
            D2mMessage::ReflectionQueueDry => {
                debug!("Reflection queue is dry");
                self.reflection_queue_dry = true;
                Ok(None)
            }
            D2mMessage::RolePromotedToLeader => {
                if !self.reflection_queue_dry {
                    warn!("Promoted to leader before the reflection queue was dry");
                }
                info!("Promoted to leader");
                self.promoted_to_leader = true;
                self.maybe_unblock(replies);
                Ok(None)
            }
            other => Ok(Some(InboundMessage::D2m(other))),
        }
    }

    #[instrument(skip_all, fields(version = hello.version))]
    fn client_hello(&self, hello: &ServerHello) -> Result<ClientHello> {
        if !(D2M_PROTOCOL_VERSION_MIN..=D2M_PROTOCOL_VERSION_MAX).contains(&hello.version) {
            return Err(ProtocolError::UnsupportedVersion(hello.version));
        }
        let services = &self.services;
        let groups = &services.device_group;
        let response = groups
            .dgpk
            .factory()
            .shared_box(&hello.esk)
            .encrypt_with_nonce_ahead(services.nonces.next(NonceScope::D2d)?, &hello.challenge)?;
        let encrypted_device_info = groups.dgdik.encrypt_with_nonce_ahead(
            services.nonces.next(NonceScope::D2d)?,
            services.config.session.client_info.as_bytes(),
        )?;
        debug!("Answering D2M server-hello");
        Ok(ClientHello {
            version: hello.version,
            response,
            device_id: services.device_id(),
            device_slots_exhausted_policy: DeviceSlotsExhaustedPolicy::Reject,
            device_slot_expiration_policy: DeviceSlotExpirationPolicy::Persistent,
            // Devices are linked before they connect for the first time
            expected_device_slot_state: DeviceSlotState::Existing,
            encrypted_device_info,
        })
    }

    /// Unblock the CSP queue once logged in and leader, exactly once
    fn maybe_unblock(&mut self, replies: &mut Vec<OutboundL3Message>) {
        if self.unblocked
            || !self.promoted_to_leader
            || self.states.csp() != CspAuthState::Complete
        {
            return;
        }
        self.unblocked = true;
        debug!("Unblocking CSP message queue");
        replies.push(OutboundL3Message::Message(OutboundMessage::Csp(
            CspPayload::UnblockIncomingMessages,
        )));
    }
}

pub struct SessionEncoder {
    states: AuthStates,
    transport: SharedTransport,
}

impl SessionEncoder {
    pub fn new(states: AuthStates, transport: SharedTransport) -> Self {
        Self { states, transport }
    }

    pub fn encode(&mut self, message: OutboundL3Message) -> Result<OutboundL2Message> {
        match message {
            OutboundL3Message::Handshake(message) => Ok(message),
            OutboundL3Message::Message(OutboundMessage::Csp(payload)) => {
                if self.states.csp() != CspAuthState::Complete {
                    return Err(ProtocolError::NotAuthenticated(
                        constants::ERR_CSP_NOT_AUTHENTICATED,
                    ));
                }
                if self.states.d2m() != D2mAuthState::Authenticated {
                    return Err(ProtocolError::NotAuthenticated(
                        constants::ERR_D2M_NOT_AUTHENTICATED,
                    ));
                }
                let transport = self.transport.get().ok_or(ProtocolError::NotAuthenticated(
                    constants::ERR_CSP_NOT_AUTHENTICATED,
                ))?;
                let sealed = transport.encrypt(&payload.encode()?)?;
                Ok(OutboundL2Message::Proxy(Bytes::from(sealed)))
            }
            OutboundL3Message::Message(OutboundMessage::D2m(message)) => {
                let required = match message {
                    D2mMessage::ClientHello(_) => D2mAuthState::Login,
                    _ => D2mAuthState::Authenticated,
                };
                if self.states.d2m() != required {
                    return Err(ProtocolError::NotAuthenticated(
                        constants::ERR_D2M_NOT_AUTHENTICATED,
                    ));
                }
                Ok(OutboundL2Message::D2m(message))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn encoder() -> (AuthStates, SessionEncoder) {
        let states = AuthStates::new();
        let encoder = SessionEncoder::new(states.clone(), Arc::new(OnceLock::new()));
        (states, encoder)
    }

    #[test]
    fn test_csp_payload_rejected_before_login() {
        let (states, mut encoder) = encoder();
        states.set_d2m(D2mAuthState::Authenticated);
        let err = encoder
            .encode(OutboundL3Message::Message(OutboundMessage::Csp(
                CspPayload::UnblockIncomingMessages,
            )))
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::NotAuthenticated(constants::ERR_CSP_NOT_AUTHENTICATED)
        ));
    }

    #[test]
    fn test_d2m_message_rejected_before_login() {
        let (states, mut encoder) = encoder();
        states.set_d2m(D2mAuthState::Login);
        let result = encoder.encode(OutboundL3Message::Message(OutboundMessage::D2m(
            D2mMessage::GetDevicesInfo,
        )));
        assert!(result.is_err());

        states.set_d2m(D2mAuthState::Authenticated);
        assert_eq!(
            encoder
                .encode(OutboundL3Message::Message(OutboundMessage::D2m(
                    D2mMessage::GetDevicesInfo
                )))
                .unwrap(),
            OutboundL2Message::D2m(D2mMessage::GetDevicesInfo)
        );
    }

    #[test]
    fn test_handshake_bypasses_gating() {
        let (_, mut encoder) = encoder();
        let message = OutboundL2Message::Proxy(Bytes::from_static(b"hello"));
        assert_eq!(
            encoder
                .encode(OutboundL3Message::Handshake(message.clone()))
                .unwrap(),
            message
        );
    }
}
