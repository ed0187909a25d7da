//! Scoped nonce bookkeeping.
//!
//! Every nonce used with a long-lived key is recorded per scope. A nonce is handed
//! out as a [`NonceGuard`] that reserves it until the guard is committed (the nonce
//! is now permanently used) or discarded (the reservation is released). Encryption
//! APIs take the guard by value, so a guard cannot encrypt twice.
//!
//! Used nonces are tracked as SHA-256 hashes bound to their scope. Unlike a replay
//! cache there is no expiry: a nonce used once stays used for the lifetime of the
//! service.

use crate::crypto::random_bytes;
use crate::error::CryptoError;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Length of a box nonce
pub const NONCE_LENGTH: usize = 24;

/// Key domain a nonce is valid within
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonceScope {
    /// End-to-end encrypted messages between users
    Csp,
    /// Envelopes and scopes encrypted with device group keys
    D2d,
}

impl NonceScope {
    pub fn name(self) -> &'static str {
        match self {
            NonceScope::Csp => "csp",
            NonceScope::D2d => "d2d",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    pub fn from_bytes(bytes: [u8; NONCE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parse a nonce from an arbitrary slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NONCE_LENGTH] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: NONCE_LENGTH,
                    actual: bytes.len(),
                })?;
        Ok(Self(bytes))
    }

    pub fn random() -> Result<Self, CryptoError> {
        Ok(Self(random_bytes()?))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

type NonceHash = [u8; 32];

#[derive(Debug, Default)]
struct NonceTable {
    used: HashMap<NonceScope, HashSet<NonceHash>>,
    reserved: HashSet<(NonceScope, NonceHash)>,
}

impl NonceTable {
    fn is_taken(&self, scope: NonceScope, hash: &NonceHash) -> bool {
        self.reserved.contains(&(scope, *hash))
            || self
                .used
                .get(&scope)
                .is_some_and(|hashes| hashes.contains(hash))
    }
}

/// Compute the scope-bound hash under which a nonce is recorded
fn hash_nonce(scope: NonceScope, nonce: &Nonce) -> NonceHash {
    let mut hasher = Sha256::new();
    hasher.update(b"nonce-scope:");
    hasher.update(scope.name().as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.finalize().into()
}

/// Shared registry of used nonces, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct NonceService {
    table: Arc<Mutex<NonceTable>>,
}

impl NonceService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NonceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a fresh random nonce that was never used in `scope`
    pub fn next(&self, scope: NonceScope) -> Result<NonceGuard, CryptoError> {
        loop {
            let nonce = Nonce::random()?;
            let hash = hash_nonce(scope, &nonce);
            let mut table = self.lock();
            if table.is_taken(scope, &hash) {
                warn!(scope = scope.name(), "Random nonce collided, drawing again");
                continue;
            }
            table.reserved.insert((scope, hash));
            return Ok(NonceGuard::new(scope, nonce, hash, self.table.clone()));
        }
    }

    /// Reserve a nonce received from a peer
    ///
    /// # Errors
    /// Returns `CryptoError::NonceReuse` if the nonce was used or is reserved in `scope`
    pub fn import(&self, scope: NonceScope, nonce: Nonce) -> Result<NonceGuard, CryptoError> {
        let hash = hash_nonce(scope, &nonce);
        let mut table = self.lock();
        if table.is_taken(scope, &hash) {
            warn!(scope = scope.name(), ?nonce, "Nonce reuse detected");
            return Err(CryptoError::NonceReuse(scope.name()));
        }
        table.reserved.insert((scope, hash));
        Ok(NonceGuard::new(scope, nonce, hash, self.table.clone()))
    }

    /// Whether a nonce has been committed in `scope`
    pub fn is_used(&self, scope: NonceScope, nonce: &Nonce) -> bool {
        let hash = hash_nonce(scope, nonce);
        self.lock()
            .used
            .get(&scope)
            .is_some_and(|hashes| hashes.contains(&hash))
    }

    /// Number of committed nonces in `scope`
    pub fn used_count(&self, scope: NonceScope) -> usize {
        self.lock().used.get(&scope).map_or(0, HashSet::len)
    }
}

/// Reservation of a single nonce
///
/// Must be resolved with [`NonceGuard::commit`] or [`NonceGuard::discard`].
/// Dropping an unresolved guard releases the reservation and logs a warning.
#[must_use = "a nonce guard must be committed or discarded"]
pub struct NonceGuard {
    scope: NonceScope,
    nonce: Nonce,
    hash: NonceHash,
    table: Arc<Mutex<NonceTable>>,
    processed: bool,
}

impl NonceGuard {
    fn new(scope: NonceScope, nonce: Nonce, hash: NonceHash, table: Arc<Mutex<NonceTable>>) -> Self {
        Self {
            scope,
            nonce,
            hash,
            table,
            processed: false,
        }
    }

    pub fn scope(&self) -> NonceScope {
        self.scope
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Record the nonce as permanently used
    pub fn commit(mut self) {
        self.processed = true;
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.reserved.remove(&(self.scope, self.hash));
        table.used.entry(self.scope).or_default().insert(self.hash);
        debug!(scope = self.scope.name(), "Nonce committed");
    }

    /// Release the reservation without recording the nonce
    pub fn discard(mut self) {
        self.processed = true;
        self.release();
    }

    fn release(&self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.reserved.remove(&(self.scope, self.hash));
    }
}

impl Drop for NonceGuard {
    fn drop(&mut self) {
        if !self.processed {
            warn!(
                scope = self.scope.name(),
                "Nonce guard dropped without commit or discard"
            );
            self.release();
        }
    }
}

impl fmt::Debug for NonceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceGuard")
            .field("scope", &self.scope)
            .field("nonce", &self.nonce)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_committed_nonce_cannot_be_imported_again() {
        let service = NonceService::new();
        let guard = service.next(NonceScope::Csp).unwrap();
        let nonce = *guard.nonce();
        guard.commit();

        assert!(service.is_used(NonceScope::Csp, &nonce));
        assert_eq!(
            service.import(NonceScope::Csp, nonce).unwrap_err(),
            CryptoError::NonceReuse("csp")
        );
    }

    #[test]
    fn test_scopes_are_independent() {
        let service = NonceService::new();
        let guard = service.next(NonceScope::Csp).unwrap();
        let nonce = *guard.nonce();
        guard.commit();

        let other = service.import(NonceScope::D2d, nonce).unwrap();
        other.commit();
        assert_eq!(service.used_count(NonceScope::Csp), 1);
        assert_eq!(service.used_count(NonceScope::D2d), 1);
    }

    #[test]
    fn test_reserved_nonce_is_taken_until_discarded() {
        let service = NonceService::new();
        let nonce = Nonce::from_bytes([7u8; NONCE_LENGTH]);

        let first = service.import(NonceScope::D2d, nonce).unwrap();
        assert!(service.import(NonceScope::D2d, nonce).is_err());

        first.discard();
        assert!(!service.is_used(NonceScope::D2d, &nonce));
        service.import(NonceScope::D2d, nonce).unwrap().commit();
        assert!(service.is_used(NonceScope::D2d, &nonce));
    }

    #[test]
    fn test_dropped_guard_releases_reservation() {
        let service = NonceService::new();
        let nonce = Nonce::from_bytes([1u8; NONCE_LENGTH]);
        {
            let _guard = service.import(NonceScope::Csp, nonce).unwrap();
        }
        assert!(service.import(NonceScope::Csp, nonce).is_ok());
    }
}
