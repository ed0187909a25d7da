//! Layer 2: mediator session.
//!
//! Splits inbound frames into proxied CSP data and D2M control messages and enforces
//! the D2M login sequence `AwaitServerHello -> Login -> Authenticated`. Proxied data is
//! classified by the CSP login progress, since the same PROXY type carries handshake
//! messages before the login completed and encrypted payloads afterwards.

use crate::core::frame::{D2mPayloadType, Frame};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::d2m::D2mMessage;
use crate::protocol::state::{AuthStates, CspAuthState, D2mAuthState};
use bytes::Bytes;
use tracing::{debug, trace};

/// Output of the layer 2 decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundL2Message {
    CspServerHello(Bytes),
    CspLoginAck(Bytes),
    /// Encrypted CSP payload container
    CspPayload(Bytes),
    D2m(D2mMessage),
}

/// Input of the layer 2 encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundL2Message {
    /// Handshake message or encrypted payload for the chat server
    Proxy(Bytes),
    D2m(D2mMessage),
}

impl OutboundL2Message {
    pub fn into_frame(self) -> Result<Frame> {
        match self {
            OutboundL2Message::Proxy(data) => Ok(Frame::new(D2mPayloadType::Proxy, data)),
            OutboundL2Message::D2m(message) => message.into_frame(),
        }
    }
}

#[derive(Debug)]
pub struct MediatorDecoder {
    states: AuthStates,
}

impl MediatorDecoder {
    pub fn new(states: AuthStates) -> Self {
        Self { states }
    }

    pub fn decode(&mut self, frame: Frame) -> Result<InboundL2Message> {
        if frame.kind == D2mPayloadType::Proxy {
            return self.decode_proxy(frame.payload);
        }
        if !frame.kind.is_server_to_client() {
            return Err(ProtocolError::UnexpectedMessage(format!(
                "{:?} is not sent by the mediator",
                frame.kind
            )));
        }
        let message = D2mMessage::decode(frame.kind, frame.payload)?;
        self.sequence(&message)?;
        trace!(kind = ?frame.kind, "Decoded D2M message");
        Ok(InboundL2Message::D2m(message))
    }

    fn decode_proxy(&self, data: Bytes) -> Result<InboundL2Message> {
        match self.states.csp() {
            CspAuthState::ServerHello => Ok(InboundL2Message::CspServerHello(data)),
            CspAuthState::LoginAck => Ok(InboundL2Message::CspLoginAck(data)),
            CspAuthState::Complete => Ok(InboundL2Message::CspPayload(data)),
            CspAuthState::ClientHello => Err(ProtocolError::UnexpectedMessage(format!(
                "{} (ClientHello)",
                constants::ERR_CSP_STATE
            ))),
        }
    }

    fn sequence(&self, message: &D2mMessage) -> Result<()> {
        match (self.states.d2m(), message) {
            (D2mAuthState::AwaitServerHello, D2mMessage::ServerHello(_)) => {
                self.states.set_d2m(D2mAuthState::Login);
                Ok(())
            }
            (D2mAuthState::AwaitServerHello, _) => Err(ProtocolError::UnexpectedMessage(
                constants::ERR_D2M_EXPECTED_SERVER_HELLO.into(),
            )),
            (D2mAuthState::Login, D2mMessage::ServerInfo(_)) => {
                debug!("D2M login complete");
                self.states.set_d2m(D2mAuthState::Authenticated);
                Ok(())
            }
            (D2mAuthState::Login, _) => Err(ProtocolError::UnexpectedMessage(
                constants::ERR_D2M_EXPECTED_SERVER_INFO.into(),
            )),
            (D2mAuthState::Authenticated, D2mMessage::ServerHello(_)) => Err(
                ProtocolError::UnexpectedMessage(constants::ERR_D2M_SERVER_HELLO_REPEATED.into()),
            ),
            (D2mAuthState::Authenticated, D2mMessage::ServerInfo(_)) => Err(
                ProtocolError::UnexpectedMessage(constants::ERR_D2M_SERVER_INFO_REPEATED.into()),
            ),
            (D2mAuthState::Authenticated, _) => Ok(()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::d2m::{DeviceSlotState, ServerHello, ServerInfo};

    fn server_hello() -> Frame {
        D2mMessage::ServerHello(ServerHello {
            version: 0,
            esk: [1u8; 32],
            challenge: vec![2u8; 32],
        })
        .into_frame()
        .unwrap()
    }

    fn server_info() -> Frame {
        D2mMessage::ServerInfo(ServerInfo {
            current_time: 0,
            max_device_slots: 4,
            device_slot_state: DeviceSlotState::New,
            encrypted_shared_device_data: Vec::new(),
            reflection_queue_length: 0,
        })
        .into_frame()
        .unwrap()
    }

    #[test]
    fn test_login_sequence() {
        let states = AuthStates::new();
        let mut decoder = MediatorDecoder::new(states.clone());

        decoder.decode(server_hello()).unwrap();
        assert_eq!(states.d2m(), D2mAuthState::Login);
        decoder.decode(server_info()).unwrap();
        assert_eq!(states.d2m(), D2mAuthState::Authenticated);

        assert!(decoder.decode(server_hello()).is_err());
        assert!(decoder.decode(server_info()).is_err());
    }

    #[test]
    fn test_server_info_before_hello_is_fatal() {
        let mut decoder = MediatorDecoder::new(AuthStates::new());
        let err = decoder.decode(server_info()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_client_to_server_type_is_fatal() {
        let mut decoder = MediatorDecoder::new(AuthStates::new());
        let frame = D2mMessage::GetDevicesInfo.into_frame().unwrap();
        assert!(decoder.decode(frame).is_err());
    }

    #[test]
    fn test_proxy_classified_by_csp_state() {
        let states = AuthStates::new();
        let mut decoder = MediatorDecoder::new(states.clone());
        let frame = Frame::new(D2mPayloadType::Proxy, Bytes::from_static(b"data"));

        assert!(decoder.decode(frame.clone()).is_err());
        states.set_csp(CspAuthState::ServerHello);
        assert!(matches!(
            decoder.decode(frame.clone()).unwrap(),
            InboundL2Message::CspServerHello(_)
        ));
        states.set_csp(CspAuthState::Complete);
        assert!(matches!(
            decoder.decode(frame).unwrap(),
            InboundL2Message::CspPayload(_)
        ));
    }
}
