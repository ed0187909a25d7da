//! # Error Types
//!
//! Error handling for the protocol pipeline, the cryptographic layer and the task manager.
//!
//! ## Error Categories
//! - **Fatal connection errors**: framing corruption, authentication failure, echo
//!   timeout. They terminate the pipeline and require a fresh connection.
//! - **Cryptographic errors**: key material, encryption, decryption and nonce misuse.
//!   Always fatal to the operation that produced them.
//! - **Task errors**: permanent (dropped, surfaced to the caller), transient (retried
//!   for persistent tasks) or aborted (connection went away before the task ran).
//!
//! Benign inconsistencies such as a delivery receipt for an unknown message are not
//! errors at all; they are logged where they are detected.
//!
//! ## Example Usage
//! ```rust
//! use mdev_protocol::error::{ProtocolError, Result};
//!
//! fn check_length(length: usize) -> Result<()> {
//!     if length < 4 {
//!         return Err(ProtocolError::InvalidFrameLength(length));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_length(2).unwrap_err().is_fatal());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Locking
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Framing and container errors
    pub const ERR_INVALID_HEADER: &str = "Invalid container header";
    pub const ERR_TRUNCATED_PAYLOAD: &str = "Payload truncated";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_PIPELINE_STAGE_GONE: &str = "Pipeline stage terminated";

    /// CSP handshake errors
    pub const ERR_INVALID_SERVER_COOKIE: &str = "Invalid server cookie length";
    pub const ERR_CLIENT_COOKIE_MISMATCH: &str = "Server did not echo the client cookie";
    pub const ERR_LOGIN_ACK_RESERVED: &str = "Invalid reserved bytes in login-ack";
    pub const ERR_REPEATED_COOKIE: &str = "Server cookie equals client cookie";
    pub const ERR_VOUCH_MISMATCH: &str = "Vouch verification failed";
    pub const ERR_CSP_STATE: &str = "CSP handshake message in unexpected state";

    /// D2M handshake errors
    pub const ERR_D2M_SERVER_HELLO_REPEATED: &str = "Unexpected server-hello after authentication";
    pub const ERR_D2M_SERVER_INFO_REPEATED: &str = "Unexpected server-info after authentication";
    pub const ERR_D2M_EXPECTED_SERVER_INFO: &str = "Expected server-info after client-hello";
    pub const ERR_D2M_EXPECTED_SERVER_HELLO: &str = "Expected server-hello as first message";

    /// Outbound gating
    pub const ERR_CSP_NOT_AUTHENTICATED: &str = "CSP payload before CSP authentication completed";
    pub const ERR_D2M_NOT_AUTHENTICATED: &str = "D2M payload before D2M authentication completed";

    /// Envelope errors
    pub const ERR_ENVELOPE_EMPTY: &str = "Envelope carries no content";
    pub const ERR_ENVELOPE_AMBIGUOUS: &str = "Envelope carries more than one content field";
}

/// Errors raised by key handling, boxes and the nonce service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("Nonce reuse detected in scope {0}")]
    NonceReuse(&'static str),

    #[error("Random source failure: {0}")]
    RandomSource(String),
}

/// ProtocolError is the primary error type for all pipeline and codec operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame length: {0} bytes")]
    InvalidFrameLength(usize),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(&'static str),

    #[error("Echo request timed out after {0:?}")]
    EchoTimeout(std::time::Duration),

    #[error("Server closed the connection: {0}")]
    ServerClose(String),

    #[error("Sequence number exhausted")]
    SequenceNumberOverflow,

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error terminates the connection it was raised on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::InvalidFrameLength(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::AuthenticationFailed(_)
                | ProtocolError::UnexpectedMessage(_)
                | ProtocolError::EchoTimeout(_)
                | ProtocolError::ServerClose(_)
                | ProtocolError::SequenceNumberOverflow
        )
    }

    /// Whether a task failing with this error may succeed when run again
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::ConnectionClosed
                | ProtocolError::EchoTimeout(_)
                | ProtocolError::ServerClose(_)
                | ProtocolError::Timeout
                | ProtocolError::NotAuthenticated(_)
        )
    }
}

/// Failure of a task run
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Grace period expired for message {0}")]
    GracePeriodExpired(String),

    #[error("Permanent task failure: {0}")]
    Permanent(String),

    #[error("Transient task failure: {0}")]
    Transient(String),

    #[error("Task aborted: {0}")]
    Aborted(&'static str),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TaskError {
    /// Whether a persistent task should be retried after this failure
    pub fn is_transient(&self) -> bool {
        match self {
            TaskError::Protocol(e) => e.is_transient(),
            TaskError::Transient(_) => true,
            TaskError::GracePeriodExpired(_) | TaskError::Permanent(_) | TaskError::Aborted(_) => {
                false
            }
        }
    }
}

impl From<CryptoError> for TaskError {
    fn from(e: CryptoError) -> Self {
        TaskError::Protocol(ProtocolError::Crypto(e))
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Type alias for task run results
pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::InvalidFrameLength(0).is_fatal());
        assert!(ProtocolError::EchoTimeout(std::time::Duration::from_secs(1)).is_fatal());
        assert!(!ProtocolError::Crypto(CryptoError::DecryptionFailure).is_fatal());
    }

    #[test]
    fn test_task_error_transience() {
        assert!(TaskError::from(ProtocolError::ConnectionClosed).is_transient());
        assert!(!TaskError::GracePeriodExpired("00".into()).is_transient());
        assert!(!TaskError::from(CryptoError::DecryptionFailure).is_transient());
    }
}
