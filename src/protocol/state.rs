//! Authentication state of one connection.
//!
//! Both state machines only move forward while the connection lives. They are published
//! through `watch` channels so the pipeline can wait for authentication and the encoder
//! can gate outbound payloads without locking.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// CSP login progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CspAuthState {
    /// client-hello not yet answered
    ClientHello,
    /// Waiting for server-hello
    ServerHello,
    /// login sent, waiting for login-ack
    LoginAck,
    Complete,
}

/// D2M login progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum D2mAuthState {
    AwaitServerHello,
    /// client-hello sent, waiting for server-info
    Login,
    Authenticated,
}

/// Shared authentication state, cheap to clone
#[derive(Debug, Clone)]
pub struct AuthStates {
    csp: Arc<watch::Sender<CspAuthState>>,
    d2m: Arc<watch::Sender<D2mAuthState>>,
}

impl Default for AuthStates {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStates {
    pub fn new() -> Self {
        Self {
            csp: Arc::new(watch::Sender::new(CspAuthState::ClientHello)),
            d2m: Arc::new(watch::Sender::new(D2mAuthState::AwaitServerHello)),
        }
    }

    pub fn csp(&self) -> CspAuthState {
        *self.csp.borrow()
    }

    pub fn d2m(&self) -> D2mAuthState {
        *self.d2m.borrow()
    }

    pub fn set_csp(&self, state: CspAuthState) {
        let previous = self.csp.send_replace(state);
        debug!(?previous, current = ?state, "CSP auth state");
    }

    pub fn set_d2m(&self, state: D2mAuthState) {
        let previous = self.d2m.send_replace(state);
        debug!(?previous, current = ?state, "D2M auth state");
    }

    /// Both channels authenticated
    pub fn is_authenticated(&self) -> bool {
        self.csp() == CspAuthState::Complete && self.d2m() == D2mAuthState::Authenticated
    }

    /// Back to the initial state after the connection went away
    pub fn reset(&self) {
        self.set_csp(CspAuthState::ClientHello);
        self.set_d2m(D2mAuthState::AwaitServerHello);
    }

    /// Resolve once both channels are authenticated
    pub async fn wait_authenticated(&self) {
        let mut csp = self.csp.subscribe();
        let mut d2m = self.d2m.subscribe();
        // The senders live in `self`, so the receivers cannot observe a closed channel
        let _ = csp.wait_for(|state| *state == CspAuthState::Complete).await;
        let _ = d2m
            .wait_for(|state| *state == D2mAuthState::Authenticated)
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_authenticated() {
        let states = AuthStates::new();
        let waiter = {
            let states = states.clone();
            tokio::spawn(async move { states.wait_authenticated().await })
        };

        states.set_d2m(D2mAuthState::Authenticated);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        states.set_csp(CspAuthState::Complete);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(states.is_authenticated());
    }

    #[test]
    fn test_reset() {
        let states = AuthStates::new();
        states.set_csp(CspAuthState::Complete);
        states.set_d2m(D2mAuthState::Authenticated);
        states.reset();
        assert_eq!(states.csp(), CspAuthState::ClientHello);
        assert_eq!(states.d2m(), D2mAuthState::AwaitServerHello);
    }
}
