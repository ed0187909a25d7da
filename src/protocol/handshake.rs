//! CSP login handshake.
//!
//! The handshake is a sequence of stage functions. Each stage consumes the state of the
//! previous one, so a stage cannot run twice or out of order. Client and server stages
//! both live here; the server side drives the mock servers in tests.
//!
//! ```text
//! client-hello  C -> S  tck.public(32) | cck(16)
//! server-hello  S -> C  sck(16) | box[tck, sk](tsk.public(32) | cck(16))   nonce sck|1
//! login         C -> S  box[tck, tsk](identity | ext_len | sck | vouch)     nonce cck|1
//!                       box[tck, tsk](extensions)                           nonce cck|2
//! login-ack     S -> C  box[tck, tsk](reserved(16))                         nonce sck|2
//! ```
//!
//! Afterwards both directions continue on the same box with sequence number 3.
//! Temporary keys live in X25519 secrets that zeroize themselves on drop.

use crate::crypto::boxes::{SharedBox, SharedBoxFactory, COOKIE_LENGTH, KEY_LENGTH, TAG_LENGTH};
use crate::crypto::random_bytes;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::wire::{read_array, read_bytes, read_identity, read_u16, read_u8};
use crate::types::Identity;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::Zeroizing;

use tracing::{debug, instrument};

const VOUCH_CONTEXT: &str = "3ma-csp v2 vouch";
const LOGIN_DATA_LENGTH: usize = 8 + 2 + COOKIE_LENGTH + KEY_LENGTH;
const LOGIN_ACK_RESERVED_LENGTH: usize = 16;

/// Sequence number of server-hello and login
const HELLO_SEQUENCE: u64 = 1;
/// Sequence number of the login extensions and login-ack
const LOGIN_SEQUENCE: u64 = 2;
/// First sequence number of transport payloads
const PAYLOAD_SEQUENCE: u64 = 3;

const EXTENSION_CLIENT_INFO: u8 = 0x00;
const EXTENSION_CSP_DEVICE_ID: u8 = 0x01;

pub type Cookie = [u8; COOKIE_LENGTH];

/// Data announced to the chat server with the login
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginExtensions {
    pub client_info: String,
    pub csp_device_id: u64,
}

impl LoginExtensions {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        write_extension(&mut out, EXTENSION_CLIENT_INFO, self.client_info.as_bytes())?;
        write_extension(&mut out, EXTENSION_CSP_DEVICE_ID, &self.csp_device_id.to_le_bytes())?;
        Ok(out)
    }

    fn decode(mut buf: &[u8]) -> Result<Self> {
        let mut extensions = LoginExtensions::default();
        while !buf.is_empty() {
            let kind = read_u8(&mut buf)?;
            let length = usize::from(read_u16(&mut buf)?);
            let mut data = read_bytes(&mut buf, length)?;
            match kind {
                EXTENSION_CLIENT_INFO => {
                    extensions.client_info = String::from_utf8_lossy(data).into_owned()
                }
                EXTENSION_CSP_DEVICE_ID => {
                    extensions.csp_device_id = u64::from_le_bytes(read_array(&mut data)?)
                }
                other => debug!(kind = other, "Ignoring unknown login extension"),
            }
        }
        Ok(extensions)
    }
}

fn write_extension(out: &mut Vec<u8>, kind: u8, data: &[u8]) -> Result<()> {
    let length = u16::try_from(data.len())
        .map_err(|_| ProtocolError::Custom(format!("Login extension too long: {}", data.len())))?;
    out.push(kind);
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// `keyed_hash(derive_key(DH(a) | DH(b)), sck | tck.public)`
fn vouch(
    first: Zeroizing<[u8; KEY_LENGTH]>,
    second: Zeroizing<[u8; KEY_LENGTH]>,
    sck: &Cookie,
    tck_public: &[u8; KEY_LENGTH],
) -> [u8; 32] {
    let mut shared = Zeroizing::new([0u8; 2 * KEY_LENGTH]);
    shared[..KEY_LENGTH].copy_from_slice(first.as_ref());
    shared[KEY_LENGTH..].copy_from_slice(second.as_ref());
    let key = Zeroizing::new(blake3::derive_key(VOUCH_CONTEXT, shared.as_ref()));
    let mut hasher = blake3::Hasher::new_keyed(&key);
    hasher.update(sck);
    hasher.update(tck_public);
    *hasher.finalize().as_bytes()
}

fn auth_failed(context: &str, e: impl fmt::Display) -> ProtocolError {
    ProtocolError::AuthenticationFailed(format!("{context}: {e}"))
}

/// Client state after sending client-hello
pub struct ClientHelloState {
    tck: SharedBoxFactory,
    cck: Cookie,
}

impl ClientHelloState {
    pub fn client_cookie(&self) -> &Cookie {
        &self.cck
    }
}

/// Client state after a verified server-hello
pub struct ClientServerHelloState {
    tck: SharedBoxFactory,
    cck: Cookie,
    sck: Cookie,
    tsk_public: [u8; KEY_LENGTH],
}

/// Client state after sending login
pub struct ClientLoginState {
    transport: SharedBox,
    cck: Cookie,
    sck: Cookie,
}

/// Server state after sending server-hello
pub struct ServerHelloState {
    tsk: SharedBoxFactory,
    transport: SharedBox,
    tck_public: [u8; KEY_LENGTH],
    cck: Cookie,
    sck: Cookie,
}

/// Server state after a verified login
pub struct ServerLoginState {
    transport: SharedBox,
    cck: Cookie,
    sck: Cookie,
}

/// Start the handshake
#[instrument]
pub fn client_hello() -> Result<(ClientHelloState, Vec<u8>)> {
    let tck = SharedBoxFactory::generate()?;
    let cck: Cookie = random_bytes()?;

    let mut message = Vec::with_capacity(KEY_LENGTH + COOKIE_LENGTH);
    message.extend_from_slice(&tck.public_key());
    message.extend_from_slice(&cck);

    debug!("Client initiating CSP handshake");
    Ok((ClientHelloState { tck, cck }, message))
}

/// Answer a client-hello using the permanent server key
#[instrument(skip_all)]
pub fn server_hello(
    server_key: &SharedBoxFactory,
    hello: &[u8],
) -> Result<(ServerHelloState, Vec<u8>)> {
    let mut buf = hello;
    let tck_public: [u8; KEY_LENGTH] = read_array(&mut buf)?;
    let cck: Cookie = read_array(&mut buf)?;

    let tsk = SharedBoxFactory::generate()?;
    let sck: Cookie = loop {
        let candidate: Cookie = random_bytes()?;
        if candidate != cck {
            break candidate;
        }
    };

    let mut challenge_response = Vec::with_capacity(KEY_LENGTH + COOKIE_LENGTH);
    challenge_response.extend_from_slice(&tsk.public_key());
    challenge_response.extend_from_slice(&cck);
    let sealed = server_key
        .shared_box(&tck_public)
        .encrypt_with_cookie(&sck, HELLO_SEQUENCE, &challenge_response)?;

    let mut message = Vec::with_capacity(COOKIE_LENGTH + sealed.len());
    message.extend_from_slice(&sck);
    message.extend_from_slice(&sealed);

    debug!("Server responding to CSP client-hello");
    Ok((
        ServerHelloState {
            transport: tsk.shared_box(&tck_public),
            tsk,
            tck_public,
            cck,
            sck,
        },
        message,
    ))
}

/// Verify the server-hello against the permanent server public key
#[instrument(skip_all)]
pub fn client_verify_server_hello(
    state: ClientHelloState,
    server_public_key: &[u8; KEY_LENGTH],
    message: &[u8],
) -> Result<ClientServerHelloState> {
    if message.len() < COOKIE_LENGTH {
        return Err(ProtocolError::AuthenticationFailed(
            constants::ERR_INVALID_SERVER_COOKIE.into(),
        ));
    }
    let mut buf = message;
    let sck: Cookie = read_array(&mut buf)?;
    if sck == state.cck {
        return Err(ProtocolError::AuthenticationFailed(
            constants::ERR_REPEATED_COOKIE.into(),
        ));
    }

    let plain = state
        .tck
        .shared_box(server_public_key)
        .decrypt_with_cookie(&sck, HELLO_SEQUENCE, buf)
        .map_err(|e| auth_failed("server-hello", e))?;
    let mut plain = plain.as_slice();
    let tsk_public: [u8; KEY_LENGTH] = read_array(&mut plain)?;
    let echoed: Cookie = read_array(&mut plain)?;
    if echoed != state.cck {
        return Err(ProtocolError::AuthenticationFailed(
            constants::ERR_CLIENT_COOKIE_MISMATCH.into(),
        ));
    }

    debug!("Client verified CSP server-hello");
    Ok(ClientServerHelloState {
        tck: state.tck,
        cck: state.cck,
        sck,
        tsk_public,
    })
}

/// Build the login, vouching with the permanent client key
#[instrument(skip(state, client_key, server_public_key, extensions), fields(identity = %identity))]
pub fn client_login(
    state: ClientServerHelloState,
    identity: &Identity,
    client_key: &SharedBoxFactory,
    server_public_key: &[u8; KEY_LENGTH],
    extensions: &LoginExtensions,
) -> Result<(ClientLoginState, Vec<u8>)> {
    let transport = state.tck.shared_box(&state.tsk_public);
    let vouch = vouch(
        client_key.diffie_hellman(server_public_key),
        client_key.diffie_hellman(&state.tsk_public),
        &state.sck,
        &state.tck.public_key(),
    );

    let extensions_box =
        transport.encrypt_with_cookie(&state.cck, LOGIN_SEQUENCE, &extensions.encode()?)?;
    let extensions_length = u16::try_from(extensions_box.len()).map_err(|_| {
        ProtocolError::Custom(format!("Login extensions too long: {}", extensions_box.len()))
    })?;

    let mut login = Zeroizing::new(Vec::with_capacity(LOGIN_DATA_LENGTH));
    login.extend_from_slice(identity.as_bytes());
    login.extend_from_slice(&extensions_length.to_le_bytes());
    login.extend_from_slice(&state.sck);
    login.extend_from_slice(&vouch);

    let mut message = transport.encrypt_with_cookie(&state.cck, HELLO_SEQUENCE, &login)?;
    message.extend_from_slice(&extensions_box);

    debug!("Client sending CSP login");
    Ok((
        ClientLoginState {
            transport,
            cck: state.cck,
            sck: state.sck,
        },
        message,
    ))
}

/// Verify a login, looking up the permanent public key of the claimed identity
#[instrument(skip_all)]
pub fn server_verify_login<F>(
    state: ServerHelloState,
    server_key: &SharedBoxFactory,
    client_public_key: F,
    message: &[u8],
) -> Result<(ServerLoginState, Identity, LoginExtensions)>
where
    F: FnOnce(&Identity) -> Option<[u8; KEY_LENGTH]>,
{
    let login_box_length = LOGIN_DATA_LENGTH + TAG_LENGTH;
    if message.len() < login_box_length {
        return Err(ProtocolError::AuthenticationFailed("login truncated".into()));
    }
    let (login_box, extensions_box) = message.split_at(login_box_length);
    let login = Zeroizing::new(
        state
            .transport
            .decrypt_with_cookie(&state.cck, HELLO_SEQUENCE, login_box)
            .map_err(|e| auth_failed("login", e))?,
    );

    let mut buf = login.as_slice();
    let identity = read_identity(&mut buf)?;
    let extensions_length = usize::from(read_u16(&mut buf)?);
    let sck: Cookie = read_array(&mut buf)?;
    let received_vouch: [u8; 32] = read_array(&mut buf)?;
    if sck != state.sck {
        return Err(ProtocolError::AuthenticationFailed(
            "login echoed a different server cookie".into(),
        ));
    }
    if extensions_box.len() != extensions_length {
        return Err(ProtocolError::AuthenticationFailed(
            "login extensions length mismatch".into(),
        ));
    }

    let client_public = client_public_key(&identity)
        .ok_or_else(|| ProtocolError::AuthenticationFailed(format!("unknown identity {identity}")))?;
    let expected = vouch(
        server_key.diffie_hellman(&client_public),
        state.tsk.diffie_hellman(&client_public),
        &state.sck,
        &state.tck_public,
    );
    if expected != received_vouch {
        return Err(ProtocolError::AuthenticationFailed(
            constants::ERR_VOUCH_MISMATCH.into(),
        ));
    }

    let extensions = LoginExtensions::decode(
        &state
            .transport
            .decrypt_with_cookie(&state.cck, LOGIN_SEQUENCE, extensions_box)
            .map_err(|e| auth_failed("login extensions", e))?,
    )?;

    debug!(%identity, "Server verified CSP login");
    Ok((
        ServerLoginState {
            transport: state.transport,
            cck: state.cck,
            sck: state.sck,
        },
        identity,
        extensions,
    ))
}

/// Acknowledge a verified login and open the server side transport
#[instrument(skip_all)]
pub fn server_login_ack(state: ServerLoginState) -> Result<(CspTransport, Vec<u8>)> {
    let message = state.transport.encrypt_with_cookie(
        &state.sck,
        LOGIN_SEQUENCE,
        &[0u8; LOGIN_ACK_RESERVED_LENGTH],
    )?;
    debug!("Server acknowledged CSP login");
    Ok((CspTransport::new(state.transport, state.sck, state.cck), message))
}

/// Verify the login-ack and open the client side transport
#[instrument(skip_all)]
pub fn client_verify_login_ack(state: ClientLoginState, message: &[u8]) -> Result<CspTransport> {
    let reserved = state
        .transport
        .decrypt_with_cookie(&state.sck, LOGIN_SEQUENCE, message)
        .map_err(|e| auth_failed("login-ack", e))?;
    if reserved.as_slice() != [0u8; LOGIN_ACK_RESERVED_LENGTH] {
        return Err(ProtocolError::AuthenticationFailed(
            constants::ERR_LOGIN_ACK_RESERVED.into(),
        ));
    }
    debug!("Client verified CSP login-ack");
    Ok(CspTransport::new(state.transport, state.cck, state.sck))
}

/// Encrypted CSP payload transport after login
///
/// Outbound payloads use the local cookie, inbound payloads the remote one. Each
/// direction has its own sequence number; encryption must therefore happen in wire
/// order on a single task, as must decryption.
pub struct CspTransport {
    transport: SharedBox,
    local_cookie: Cookie,
    remote_cookie: Cookie,
    local_sequence: AtomicU64,
    remote_sequence: AtomicU64,
}

impl CspTransport {
    fn new(transport: SharedBox, local_cookie: Cookie, remote_cookie: Cookie) -> Self {
        Self {
            transport,
            local_cookie,
            remote_cookie,
            local_sequence: AtomicU64::new(PAYLOAD_SEQUENCE),
            remote_sequence: AtomicU64::new(PAYLOAD_SEQUENCE),
        }
    }

    fn next(counter: &AtomicU64) -> Result<u64> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
            .map_err(|_| ProtocolError::SequenceNumberOverflow)
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let sequence = Self::next(&self.local_sequence)?;
        Ok(self
            .transport
            .encrypt_with_cookie(&self.local_cookie, sequence, plain)?)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let sequence = Self::next(&self.remote_sequence)?;
        Ok(self
            .transport
            .decrypt_with_cookie(&self.remote_cookie, sequence, ciphertext)?)
    }
}

impl fmt::Debug for CspTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CspTransport")
            .field("local_sequence", &self.local_sequence)
            .field("remote_sequence", &self.remote_sequence)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    struct Keys {
        server: SharedBoxFactory,
        client: SharedBoxFactory,
        identity: Identity,
    }

    fn keys() -> Keys {
        Keys {
            server: SharedBoxFactory::generate().unwrap(),
            client: SharedBoxFactory::generate().unwrap(),
            identity: "ECHOECHO".parse().unwrap(),
        }
    }

    fn extensions() -> LoginExtensions {
        LoginExtensions {
            client_info: "mdev-protocol;test".into(),
            csp_device_id: 77,
        }
    }

    fn run(keys: &Keys) -> (CspTransport, CspTransport) {
        let (client, hello) = client_hello().unwrap();
        let (server, server_hello) = server_hello(&keys.server, &hello).unwrap();
        let client =
            client_verify_server_hello(client, &keys.server.public_key(), &server_hello).unwrap();
        let (client, login) = client_login(
            client,
            &keys.identity,
            &keys.client,
            &keys.server.public_key(),
            &extensions(),
        )
        .unwrap();
        let client_public = keys.client.public_key();
        let (server, identity, received) =
            server_verify_login(server, &keys.server, |_| Some(client_public), &login).unwrap();
        assert_eq!(identity, keys.identity);
        assert_eq!(received, extensions());
        let (server_transport, ack) = server_login_ack(server).unwrap();
        (client_verify_login_ack(client, &ack).unwrap(), server_transport)
    }

    #[test]
    fn test_full_handshake() {
        let keys = keys();
        let (client, server) = run(&keys);

        let sealed = client.encrypt(b"payload one").unwrap();
        assert_eq!(server.decrypt(&sealed).unwrap(), b"payload one");
        let sealed = server.encrypt(b"reply").unwrap();
        assert_eq!(client.decrypt(&sealed).unwrap(), b"reply");
    }

    #[test]
    fn test_out_of_order_payload_fails() {
        let keys = keys();
        let (client, server) = run(&keys);
        let first = client.encrypt(b"one").unwrap();
        let second = client.encrypt(b"two").unwrap();
        assert!(server.decrypt(&second).is_err());
        drop(first);
    }

    #[test]
    fn test_wrong_server_key_rejected() {
        let keys = keys();
        let (client, hello) = client_hello().unwrap();
        let (_, message) = server_hello(&keys.server, &hello).unwrap();
        let other = SharedBoxFactory::generate().unwrap().public_key();
        assert!(matches!(
            client_verify_server_hello(client, &other, &message),
            Err(ProtocolError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_short_server_cookie_rejected() {
        let keys = keys();
        let (client, _) = client_hello().unwrap();
        let err = client_verify_server_hello(client, &keys.server.public_key(), &[0u8; 8])
            .err().unwrap();
        assert!(err.to_string().contains(constants::ERR_INVALID_SERVER_COOKIE));
    }

    #[test]
    fn test_repeated_cookie_rejected() {
        let keys = keys();
        let (client, _) = client_hello().unwrap();
        let mut message = client.client_cookie().to_vec();
        message.extend_from_slice(&[0u8; 64]);
        let err = client_verify_server_hello(client, &keys.server.public_key(), &message)
            .err().unwrap();
        assert!(err.to_string().contains(constants::ERR_REPEATED_COOKIE));
    }

    #[test]
    fn test_vouch_with_wrong_client_key_rejected() {
        let keys = keys();
        let (client, hello) = client_hello().unwrap();
        let (server, message) = server_hello(&keys.server, &hello).unwrap();
        let client =
            client_verify_server_hello(client, &keys.server.public_key(), &message).unwrap();
        let (_, login) = client_login(
            client,
            &keys.identity,
            &keys.client,
            &keys.server.public_key(),
            &extensions(),
        )
        .unwrap();
        let impostor = SharedBoxFactory::generate().unwrap().public_key();
        let err = server_verify_login(server, &keys.server, |_| Some(impostor), &login)
            .err()
            .unwrap();
        assert!(err.to_string().contains(constants::ERR_VOUCH_MISMATCH));
    }

    #[test]
    fn test_sequence_overflow_is_fatal() {
        let keys = keys();
        let (client, _) = run(&keys);
        client.local_sequence.store(u64::MAX, Ordering::Release);
        assert!(matches!(
            client.encrypt(b"x"),
            Err(ProtocolError::SequenceNumberOverflow)
        ));
    }
}
