use std::sync::Arc;

use crate::core::domain::{ArtifactKey, ArtifactRef, RunId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact storage failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid artifact file name: {name:?}")]
    InvalidName { name: String },
    #[error("artifact storage is full: run {run_id} alone holds the capacity of {capacity} bytes")]
    Full { run_id: RunId, capacity: u64 },
}

#[derive(Clone, Debug)]
pub struct StoredArtifact {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mimetype: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub expired: usize,
    pub evicted: usize,
    pub freed_bytes: u64,
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait ArtifactStore: std::fmt::Debug + Send + Sync {
    /// Stores the bytes under a fresh key scoped to `run_id`. The returned
    /// URL resolves to exactly these bytes until the artifact expires.
    async fn put(
        &self,
        run_id: RunId,
        bytes: Vec<u8>,
        filename: &str,
        mimetype: &str,
    ) -> Result<ArtifactRef, StoreError>;

    async fn get(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError>;

    /// Drops expired artifacts and evicts the oldest ones while over capacity.
    async fn reap(&self) -> Result<ReapStats, StoreError>;
}

/// Handle given to a sandbox so it can only register files for its own run.
#[derive(Clone, Debug)]
pub struct ArtifactSink {
    run_id: RunId,
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactSink {
    pub fn new(run_id: RunId, store: Arc<dyn ArtifactStore>) -> Self {
        Self { run_id, store }
    }

    pub async fn put(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        mimetype: &str,
    ) -> Result<ArtifactRef, StoreError> {
        self.store.put(self.run_id, bytes, filename, mimetype).await
    }
}
