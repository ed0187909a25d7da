//! Blob transfer contract.
//!
//! Blobs are uploaded and downloaded outside the pipeline. Tasks that carry file
//! messages only see this trait; [`MemoryBlobBackend`] backs tests and local use.

use crate::error::{ProtocolError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub const BLOB_ID_LENGTH: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub [u8; BLOB_ID_LENGTH]);

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", hex::encode(self.0))
    }
}

/// Visibility of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobScope {
    /// Downloadable by other users
    Public,
    /// Only for the devices of the own identity
    Local,
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    async fn upload(&self, scope: BlobScope, data: Bytes) -> Result<BlobId>;

    async fn download(&self, scope: BlobScope, id: BlobId) -> Result<Bytes>;

    /// Tell the backend the blob was fully processed and may be removed
    async fn mark_done(&self, id: BlobId, scope: BlobScope) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryBlobBackend {
    blobs: Mutex<HashMap<(BlobScope, BlobId), Bytes>>,
}

impl MemoryBlobBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(BlobScope, BlobId), Bytes>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobBackend {
    async fn upload(&self, scope: BlobScope, data: Bytes) -> Result<BlobId> {
        let id = BlobId(crate::crypto::random_bytes()?);
        self.lock().insert((scope, id), data);
        debug!(?id, ?scope, "Blob uploaded");
        Ok(id)
    }

    async fn download(&self, scope: BlobScope, id: BlobId) -> Result<Bytes> {
        self.lock()
            .get(&(scope, id))
            .cloned()
            .ok_or_else(|| ProtocolError::Custom(format!("Blob {id:?} not found")))
    }

    async fn mark_done(&self, id: BlobId, scope: BlobScope) -> Result<()> {
        if scope == BlobScope::Local {
            self.lock().remove(&(scope, id));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scoped_download() {
        let backend = MemoryBlobBackend::new();
        let id = backend
            .upload(BlobScope::Local, Bytes::from_static(b"blob"))
            .await
            .unwrap();
        assert_eq!(backend.download(BlobScope::Local, id).await.unwrap(), "blob");
        assert!(backend.download(BlobScope::Public, id).await.is_err());

        backend.mark_done(id, BlobScope::Local).await.unwrap();
        assert!(backend.download(BlobScope::Local, id).await.is_err());
    }
}
