//! Content fingerprinting and the session dedup cache
//!
//! This module provides:
//! 1. [`HashEngine`], which digests file bytes on a background worker thread
//!    (or inline when no worker is available)
//! 2. [`HashCache`], the session-wide set of fingerprints already seen
//! 3. Optional persistence of the cache through [`Storage`]

pub mod worker;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::ImageFile;
use crate::storage::{HASH_CACHE_STORAGE_KEY, Storage, StorageError};

pub use worker::{FINGERPRINT_LEN, fingerprint};

/// Errors for hashing operations
#[derive(Error, Debug)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash worker failed: {0}")]
    Worker(String),

    #[error("Hash worker is not running")]
    WorkerUnavailable,
}

/// Result type for hashing operations
pub type HashResult<T> = Result<T, HashError>;

/// Result of a hash computation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashOutcome {
    pub fingerprint: String,
    /// The fingerprint was already in the cache before this computation
    pub known: bool,
}

/// Session-wide set of known fingerprints.
///
/// Entries are never evicted, so a lookup never reports a seen fingerprint as unknown.
pub struct HashCache {
    known: RwLock<HashSet<String>>,
    storage: Option<Storage>,
}

impl Default for HashCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HashCache {
    /// Empty, memory-only cache
    pub fn new() -> Self {
        Self {
            known: RwLock::new(HashSet::new()),
            storage: None,
        }
    }

    /// Cache restored from, and written back to, `storage`
    pub fn with_storage(storage: Storage) -> Result<Self, StorageError> {
        let restored: Vec<String> = storage.load(HASH_CACHE_STORAGE_KEY)?.unwrap_or_default();
        info!("Restored {} fingerprints into hash cache", restored.len());

        Ok(Self {
            known: RwLock::new(restored.into_iter().collect()),
            storage: Some(storage),
        })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.known.read().contains(fingerprint)
    }

    /// Register a fingerprint. Returns true when it was not known before
    pub fn insert(&self, fingerprint: impl Into<String>) -> bool {
        let inserted = self.known.write().insert(fingerprint.into());
        if inserted {
            self.persist();
        }
        inserted
    }

    /// Withdraw a fingerprint whose upload never completed
    pub fn forget(&self, fingerprint: &str) -> bool {
        let removed = self.known.write().remove(fingerprint);
        if removed {
            self.persist();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.known.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.read().is_empty()
    }

    /// Sorted copy of every known fingerprint
    pub fn snapshot(&self) -> Vec<String> {
        let mut all: Vec<String> = self.known.read().iter().cloned().collect();
        all.sort();
        all
    }

    fn persist(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(HASH_CACHE_STORAGE_KEY, &self.snapshot()) {
                warn!("Failed to persist hash cache: {}", e);
            }
        }
    }
}

type PendingMap = DashMap<Uuid, oneshot::Sender<Result<String, String>>>;

/// Channel ends and threads of a running worker
struct WorkerLink {
    requests: flume::Sender<worker::HashRequest>,
    pending: Arc<PendingMap>,
    _worker: JoinHandle<()>,
    _dispatcher: JoinHandle<()>,
}

impl WorkerLink {
    fn start() -> std::io::Result<Self> {
        let (req_tx, req_rx) = flume::unbounded();
        let (resp_tx, resp_rx) = flume::unbounded::<worker::HashResponse>();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());

        let worker = worker::spawn(req_rx, resp_tx)?;

        let dispatch_pending = pending.clone();
        let dispatcher = thread::Builder::new()
            .name("imghost-hash-dispatch".to_string())
            .spawn(move || {
                for response in resp_rx.iter() {
                    // Each response resolves its caller exactly once
                    match dispatch_pending.remove(&response.id) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(response.result);
                        }
                        None => debug!(id = %response.id, "Dropping response with no waiter"),
                    }
                }
                // Worker is gone: fail everything still waiting
                dispatch_pending.clear();
            })?;

        Ok(Self {
            requests: req_tx,
            pending,
            _worker: worker,
            _dispatcher: dispatcher,
        })
    }
}

/// Computes content fingerprints and records them in the [`HashCache`]
pub struct HashEngine {
    worker: Option<WorkerLink>,
    cache: Arc<HashCache>,
}

impl HashEngine {
    /// Engine backed by a background worker, falling back to inline hashing
    /// when the worker thread cannot be started
    pub fn new(cache: Arc<HashCache>) -> Self {
        match WorkerLink::start() {
            Ok(link) => {
                debug!("Hash engine using background worker");
                Self {
                    worker: Some(link),
                    cache,
                }
            }
            Err(e) => {
                warn!("Failed to start hash worker, hashing inline: {}", e);
                Self::inline(cache)
            }
        }
    }

    /// Engine that digests on the calling thread
    pub fn inline(cache: Arc<HashCache>) -> Self {
        Self {
            worker: None,
            cache,
        }
    }

    pub fn uses_worker(&self) -> bool {
        self.worker.is_some()
    }

    pub fn cache(&self) -> &Arc<HashCache> {
        &self.cache
    }

    /// Requests awaiting a worker response
    pub fn pending_requests(&self) -> usize {
        self.worker.as_ref().map_or(0, |link| link.pending.len())
    }

    /// Fingerprint `file` and register it in the cache
    #[instrument(skip(self, file), fields(file = %file.name, size = file.size()))]
    pub async fn compute_hash(&self, file: &ImageFile) -> HashResult<HashOutcome> {
        let fingerprint = self.digest(file).await?;

        let known = !self.cache.insert(fingerprint.clone());
        debug!(%fingerprint, known, "Computed fingerprint");

        Ok(HashOutcome { fingerprint, known })
    }

    /// Fingerprint `file` without touching the cache
    pub async fn digest(&self, file: &ImageFile) -> HashResult<String> {
        match &self.worker {
            Some(link) => Self::hash_on_worker(link, file).await,
            None => Ok(fingerprint(&file.bytes)),
        }
    }

    /// Read a file from disk and fingerprint it
    pub async fn hash_path(&self, path: impl AsRef<Path>) -> HashResult<HashOutcome> {
        let file = ImageFile::from_path(path).await?;
        self.compute_hash(&file).await
    }

    async fn hash_on_worker(link: &WorkerLink, file: &ImageFile) -> HashResult<String> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        link.pending.insert(id, tx);

        let request = worker::HashRequest {
            id,
            data: file.bytes.clone(),
        };
        if link.requests.send(request).is_err() {
            link.pending.remove(&id);
            return Err(HashError::WorkerUnavailable);
        }

        rx.await
            .map_err(|_| HashError::WorkerUnavailable)?
            .map_err(HashError::Worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file(bytes: &'static [u8]) -> ImageFile {
        ImageFile::new("a.png", "image/png", bytes)
    }

    #[tokio::test]
    async fn test_worker_and_inline_agree() {
        let worker = HashEngine::new(Arc::new(HashCache::new()));
        let inline = HashEngine::inline(Arc::new(HashCache::new()));
        assert!(worker.uses_worker());
        assert!(!inline.uses_worker());

        let a = worker.compute_hash(&file(b"abc")).await.unwrap();
        let b = inline.compute_hash(&file(b"abc")).await.unwrap();

        assert_eq!(a.fingerprint, "ba7816bf8f");
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(worker.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_second_computation_reports_known() {
        let cache = Arc::new(HashCache::new());
        let engine = HashEngine::new(cache.clone());

        let first = engine.compute_hash(&file(b"same bytes")).await.unwrap();
        let second = engine.compute_hash(&file(b"same bytes")).await.unwrap();
        let other = engine.compute_hash(&file(b"other bytes")).await.unwrap();

        assert!(!first.known);
        assert!(second.known);
        assert!(!other.known);
        assert_ne!(first.fingerprint, other.fingerprint);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_digest_leaves_cache_alone() {
        let cache = Arc::new(HashCache::new());
        let engine = HashEngine::new(cache.clone());

        assert_eq!(engine.digest(&file(b"abc")).await.unwrap(), "ba7816bf8f");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let engine = Arc::new(HashEngine::new(Arc::new(HashCache::new())));
        let payloads: Vec<Vec<u8>> = (0..32u8).map(|n| vec![n; 1024 * (n as usize + 1)]).collect();

        let mut handles = Vec::new();
        for payload in payloads.clone() {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let f = ImageFile::new("x.png", "image/png", payload);
                engine.compute_hash(&f).await.unwrap().fingerprint
            }));
        }

        for (handle, payload) in handles.into_iter().zip(payloads) {
            assert_eq!(handle.await.unwrap(), fingerprint(&payload));
        }
        assert_eq!(engine.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_hash_path_reports_io_error() {
        let engine = HashEngine::inline(Arc::new(HashCache::new()));
        let err = engine.hash_path("/definitely/not/here.png").await.unwrap_err();
        assert!(matches!(err, HashError::Io(_)));
    }

    #[test]
    fn test_forget_allows_reinsert() {
        let cache = HashCache::new();
        assert!(cache.insert("0123456789"));
        assert!(!cache.insert("0123456789"));
        assert!(cache.forget("0123456789"));
        assert!(!cache.contains("0123456789"));
        assert!(cache.insert("0123456789"));
    }

    #[test]
    fn test_cache_persists_through_storage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");

        {
            let cache = HashCache::with_storage(Storage::open(&path).unwrap()).unwrap();
            cache.insert("aaaaaaaaaa");
            cache.insert("bbbbbbbbbb");
        }

        let restored = HashCache::with_storage(Storage::open(&path).unwrap()).unwrap();
        assert_eq!(restored.snapshot(), vec!["aaaaaaaaaa", "bbbbbbbbbb"]);
    }
}
