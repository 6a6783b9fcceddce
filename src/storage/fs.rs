use std::{
    collections::HashSet,
    io::ErrorKind,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};
use itertools::Itertools;
use tokio::fs;
use uuid::Uuid;

use crate::{
    constants::ARTIFACTS_ROUTE_PREFIX,
    core::{
        domain::{ArtifactKey, ArtifactRef, RunId},
        traits::artifact_store::{ArtifactStore, ReapStats, StoreError, StoredArtifact},
    },
    storage::sanitize_filename,
};

#[derive(Debug, Clone)]
pub struct FsStoreSettings {
    pub root: PathBuf,
    pub public_base_url: String,
    pub retention: Duration,
    pub max_total_bytes: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    path: PathBuf,
    filename: String,
    mimetype: String,
    size: u64,
    created_at: Instant,
    expires_at: Instant,
}

/// Keeps artifacts as plain files under `root/<run_id>/<seq>-<filename>`.
/// The index lives in memory, so artifacts do not survive a restart.
#[derive(Debug)]
pub struct FsArtifactStore {
    settings: FsStoreSettings,
    index: DashMap<ArtifactKey, IndexEntry>,
    /// Store-wide and never reset, so a key is never handed out twice.
    next_seq: AtomicU64,
    /// Puts in flight per run. A run directory is only pruned while vacant.
    writers: DashMap<RunId, usize>,
    total_bytes: AtomicU64,
}

struct WriteGuard<'a> {
    writers: &'a DashMap<RunId, usize>,
    run_id: RunId,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.writers.entry(self.run_id) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}

impl FsArtifactStore {
    pub fn new(settings: FsStoreSettings) -> std::io::Result<Self> {
        std::fs::create_dir_all(&settings.root)?;
        tracing::info!("Artifact store at {:?}", settings.root);

        Ok(Self {
            settings,
            index: DashMap::new(),
            next_seq: AtomicU64::new(0),
            writers: DashMap::new(),
            total_bytes: AtomicU64::new(0),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    fn begin_write(&self, run_id: RunId) -> WriteGuard<'_> {
        *self.writers.entry(run_id).or_insert(0) += 1;
        WriteGuard {
            writers: &self.writers,
            run_id,
        }
    }

    fn public_url(&self, key: &ArtifactKey, filename: &str) -> String {
        format!(
            "{}{}/{}/{}/{}",
            self.settings.public_base_url.trim_end_matches('/'),
            ARTIFACTS_ROUTE_PREFIX,
            key.run_id,
            key.seq,
            filename
        )
    }

    async fn remove(&self, key: &ArtifactKey) -> Result<Option<u64>, StoreError> {
        let Some((_, entry)) = self.index.remove(key) else {
            return Ok(None);
        };
        self.total_bytes.fetch_sub(entry.size, Ordering::AcqRel);

        match fs::remove_file(&entry.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Some(entry.size))
    }

    /// Removes the oldest artifacts until the store fits its capacity again.
    /// Artifacts of `writing` are never evicted: its refs may already be
    /// attached to a result.
    async fn evict_over_capacity(&self, writing: Option<RunId>) -> Result<ReapStats, StoreError> {
        let mut stats = ReapStats::default();
        if self.total_bytes() <= self.settings.max_total_bytes {
            return Ok(stats);
        }

        let by_age: Vec<(Instant, ArtifactKey)> = self
            .index
            .iter()
            .filter(|entry| Some(entry.key().run_id) != writing)
            .map(|entry| (entry.created_at, entry.key().clone()))
            .sorted()
            .collect();

        for (_, key) in by_age {
            if self.total_bytes() <= self.settings.max_total_bytes {
                break;
            }
            if let Some(size) = self.remove(&key).await? {
                tracing::debug!("Evicted artifact {:?} ({} bytes)", key, size);
                stats.evicted += 1;
                stats.freed_bytes += size;
            }
        }

        Ok(stats)
    }

    /// Deletes run directories that hold no indexed artifact and have no put
    /// in flight.
    async fn prune_empty_runs(&self) -> Result<(), StoreError> {
        let live: HashSet<RunId> = self.index.iter().map(|entry| entry.key().run_id).collect();
        let mut dirs = fs::read_dir(&self.settings.root).await?;

        while let Some(dir) = dirs.next_entry().await? {
            let Some(run_id) = dir
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            if live.contains(&run_id) {
                continue;
            }

            // Holding the vacant entry keeps a new put for this run out
            // until the directory is gone.
            if let Entry::Vacant(_) = self.writers.entry(run_id) {
                if let Err(err) = std::fs::remove_dir(dir.path()) {
                    if err.kind() != ErrorKind::NotFound {
                        tracing::debug!("Cannot remove artifact dir {:?}: {}", dir.path(), err);
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FsArtifactStore {
    #[tracing::instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn put(
        &self,
        run_id: RunId,
        bytes: Vec<u8>,
        filename: &str,
        mimetype: &str,
    ) -> Result<ArtifactRef, StoreError> {
        let clean_name = sanitize_filename(filename).ok_or_else(|| StoreError::InvalidName {
            name: filename.to_string(),
        })?;
        let _writing = self.begin_write(run_id);
        let key = ArtifactKey {
            run_id,
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
        };

        let dir = self.settings.root.join(run_id.to_string());
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}-{}", key.seq, clean_name));
        let partial = dir.join(format!(".{}-{}.partial", key.seq, clean_name));
        fs::write(&partial, &bytes).await?;
        fs::rename(&partial, &path).await?;

        let size = bytes.len() as u64;
        let now = Instant::now();
        self.index.insert(
            key.clone(),
            IndexEntry {
                path,
                filename: clean_name.clone(),
                mimetype: mimetype.to_string(),
                size,
                created_at: now,
                expires_at: now + self.settings.retention,
            },
        );
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
        tracing::debug!("Stored artifact: {:?}", key);

        self.evict_over_capacity(Some(run_id)).await?;
        if self.total_bytes() > self.settings.max_total_bytes {
            self.remove(&key).await?;
            return Err(StoreError::Full {
                run_id,
                capacity: self.settings.max_total_bytes,
            });
        }

        Ok(ArtifactRef {
            public_url: self.public_url(&key, &clean_name),
            key,
            filename: clean_name,
            mimetype: mimetype.to_string(),
        })
    }

    async fn get(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError> {
        let Some(entry) = self.index.get(key).map(|entry| entry.clone()) else {
            return Ok(None);
        };
        if entry.expires_at <= Instant::now() {
            return Ok(None);
        }

        match fs::read(&entry.path).await {
            Ok(bytes) => Ok(Some(StoredArtifact {
                bytes,
                filename: entry.filename,
                mimetype: entry.mimetype,
            })),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn reap(&self) -> Result<ReapStats, StoreError> {
        let now = Instant::now();
        let expired: Vec<ArtifactKey> = self
            .index
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut stats = ReapStats::default();
        for key in expired {
            if let Some(size) = self.remove(&key).await? {
                stats.expired += 1;
                stats.freed_bytes += size;
            }
        }

        let evicted = self.evict_over_capacity(None).await?;
        stats.evicted += evicted.evicted;
        stats.freed_bytes += evicted.freed_bytes;

        self.prune_empty_runs().await?;
        tracing::debug!(
            "Artifact store holds {} files, {} bytes",
            self.len(),
            self.total_bytes()
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    fn store(dir: &tempfile::TempDir, retention: Duration, max_total_bytes: u64) -> FsArtifactStore {
        FsArtifactStore::new(FsStoreSettings {
            root: dir.path().join("artifacts"),
            public_base_url: "http://localhost:8080/".to_string(),
            retention,
            max_total_bytes,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::from_secs(60), 1 << 20);
        let run_id = Uuid::new_v4();

        let artifact = store
            .put(run_id, b"%PDF-1.7".to_vec(), "document.pdf", "application/pdf")
            .await
            .unwrap();

        assert_eq!(artifact.filename, "document.pdf");
        assert_eq!(artifact.mimetype, "application/pdf");
        assert_eq!(
            artifact.public_url,
            format!("http://localhost:8080/artifacts/{run_id}/0/document.pdf")
        );

        let stored = store.get(&artifact.key).await.unwrap().unwrap();
        assert_eq!(stored.bytes, b"%PDF-1.7");
        assert_eq!(stored.mimetype, "application/pdf");
        assert_eq!(store.total_bytes(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_puts_get_unique_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir, Duration::from_secs(60), 1 << 20));
        let run_id = Uuid::new_v4();

        let puts = (0..16).map(|i| {
            let store = store.clone();
            async move {
                store
                    .put(run_id, vec![i as u8; 4], "shot.png", "image/png")
                    .await
                    .unwrap()
            }
        });
        let artifacts = futures::future::join_all(puts).await;

        let keys: HashSet<_> = artifacts.iter().map(|a| a.key.clone()).collect();
        assert_eq!(keys.len(), 16);
        let urls: HashSet<_> = artifacts.iter().map(|a| a.public_url.clone()).collect();
        assert_eq!(urls.len(), 16);

        for artifact in &artifacts {
            let stored = store.get(&artifact.key).await.unwrap().unwrap();
            assert_eq!(stored.bytes.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_same_filename_in_different_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::from_secs(60), 1 << 20);

        let first = store
            .put(Uuid::new_v4(), b"one".to_vec(), "out.txt", "text/plain")
            .await
            .unwrap();
        let second = store
            .put(Uuid::new_v4(), b"two".to_vec(), "out.txt", "text/plain")
            .await
            .unwrap();

        assert_ne!(first.public_url, second.public_url);
        assert_eq!(store.get(&first.key).await.unwrap().unwrap().bytes, b"one");
        assert_eq!(store.get(&second.key).await.unwrap().unwrap().bytes, b"two");
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::from_secs(60), 1 << 20);

        let result = store
            .put(Uuid::new_v4(), b"x".to_vec(), "..", "text/plain")
            .await;

        assert!(matches!(result, Err(StoreError::InvalidName { .. })));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_expired_artifacts_are_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::ZERO, 1 << 20);
        let run_id = Uuid::new_v4();

        let artifact = store
            .put(run_id, b"bytes".to_vec(), "out.txt", "text/plain")
            .await
            .unwrap();
        assert!(store.get(&artifact.key).await.unwrap().is_none());

        let stats = store.reap().await.unwrap();
        assert_eq!(
            stats,
            ReapStats {
                expired: 1,
                evicted: 0,
                freed_bytes: 5,
            }
        );
        assert_eq!(store.total_bytes(), 0);
        assert!(!dir.path().join("artifacts").join(run_id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_oldest_evicted_over_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::from_secs(60), 10);

        let first = store
            .put(Uuid::new_v4(), vec![1; 6], "a.bin", "application/octet-stream")
            .await
            .unwrap();
        let second = store
            .put(Uuid::new_v4(), vec![2; 6], "b.bin", "application/octet-stream")
            .await
            .unwrap();

        assert!(store.get(&first.key).await.unwrap().is_none());
        assert_eq!(store.get(&second.key).await.unwrap().unwrap().bytes, vec![2; 6]);
        assert_eq!(store.total_bytes(), 6);
    }

    #[tokio::test]
    async fn test_put_never_evicts_its_own_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::from_secs(60), 10);
        let run_id = Uuid::new_v4();

        let first = store
            .put(run_id, vec![1; 6], "a.bin", "application/octet-stream")
            .await
            .unwrap();
        let second = store
            .put(run_id, vec![2; 6], "b.bin", "application/octet-stream")
            .await;

        assert!(matches!(second, Err(StoreError::Full { capacity: 10, .. })));
        assert_eq!(store.get(&first.key).await.unwrap().unwrap().bytes, vec![1; 6]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 6);
    }

    #[tokio::test]
    async fn test_keys_stay_unique_after_run_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::ZERO, 1 << 20);
        let run_id = Uuid::new_v4();

        let first = store
            .put(run_id, b"one".to_vec(), "out.txt", "text/plain")
            .await
            .unwrap();
        store.reap().await.unwrap();
        let second = store
            .put(run_id, b"two".to_vec(), "out.txt", "text/plain")
            .await
            .unwrap();

        assert_ne!(first.key, second.key);
        assert_ne!(first.public_url, second.public_url);
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 3);
    }

    #[tokio::test]
    async fn test_reap_keeps_dir_of_run_being_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, Duration::from_secs(60), 1 << 20);
        let run_id = Uuid::new_v4();
        let run_dir = dir.path().join("artifacts").join(run_id.to_string());
        std::fs::create_dir_all(&run_dir).unwrap();

        let writing = store.begin_write(run_id);
        store.reap().await.unwrap();
        assert!(run_dir.exists());

        drop(writing);
        store.reap().await.unwrap();
        assert!(!run_dir.exists());
    }
}
