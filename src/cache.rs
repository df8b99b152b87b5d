//! Artifact cache contract consumed by the core, plus the on-disk
//! implementation used by the CLI.
//!
//! The core only needs acquire-exclusive-by-key / release: a lease grants
//! exclusive use of a cache key's path for the duration of a download or
//! build-once operation, and is released exactly once (dropping it is the
//! backstop).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive, key-scoped access token. While held, no other acquisition of
/// the same key on the same cache proceeds.
pub struct CacheLease {
    path: PathBuf,
    guard: StdMutex<Option<OwnedMutexGuard<()>>>,
}

impl CacheLease {
    fn new(path: PathBuf, guard: OwnedMutexGuard<()>) -> Self {
        CacheLease {
            path,
            guard: StdMutex::new(Some(guard)),
        }
    }

    /// The on-disk path reserved for this key.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release exclusivity. Idempotent.
    pub fn release(&self) {
        self.guard.lock().expect("lease guard poisoned").take();
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Block until exclusive access to `key` is available.
    async fn acquire(&self, key: &str) -> CacheLease;
}

/// File-backed cache rooted at a directory; keys map to hashed file names
/// so arbitrary key strings (URLs, `iso:ubuntu-20.04`, ...) stay valid
/// paths.
pub struct FileCache {
    root: PathBuf,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileCache {
            root: root.into(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(hex::encode(digest))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("cache lock table poisoned");
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

#[async_trait]
impl Cache for FileCache {
    async fn acquire(&self, key: &str) -> CacheLease {
        let lock = self.key_lock(key);
        let guard = lock.lock_owned().await;
        CacheLease::new(self.key_path(key), guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn lease_path_is_stable_per_key() {
        let cache = FileCache::new("/tmp/kiln-cache");
        let a = cache.acquire("iso:ubuntu-20.04").await;
        let path = a.path().to_path_buf();
        a.release();
        let b = cache.acquire("iso:ubuntu-20.04").await;
        assert_eq!(b.path(), path);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let cache = FileCache::new("/tmp/kiln-cache");
        let lease = cache.acquire("k").await;
        lease.release();
        lease.release();
        // A fresh acquisition must not block after double release.
        let again = cache.acquire("k").await;
        again.release();
    }

    #[tokio::test]
    async fn second_acquisition_blocks_until_release() {
        let cache = Arc::new(FileCache::new("/tmp/kiln-cache"));
        let first = cache.acquire("iso:ubuntu-20.04").await;

        let cache2 = Arc::clone(&cache);
        let waiter = tokio::spawn(async move {
            let lease = cache2.acquire("iso:ubuntu-20.04").await;
            lease.release();
        });

        // The waiter cannot complete while the first lease is held.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.release();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after release")
            .unwrap();
    }

    #[tokio::test]
    async fn n_concurrent_acquisitions_never_overlap() {
        let cache = Arc::new(FileCache::new("/tmp/kiln-cache"));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            tasks.spawn(async move {
                let lease = cache.acquire("shared-key").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                lease.release();
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let cache = FileCache::new("/tmp/kiln-cache");
        let a = cache.acquire("a").await;
        // Must not block even while `a` is held.
        let b = tokio::time::timeout(Duration::from_secs(1), cache.acquire("b"))
            .await
            .expect("distinct key should acquire immediately");
        assert_ne!(a.path(), b.path());
    }
}
