//! The on-disk object cache and its single-flight fetch pipeline.
//!
//! One worker process owns one cache directory: a flat file per content key,
//! written exactly once. Concurrent requests for the same key coalesce onto
//! a single fetch task, and every waiter observes that task's outcome.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use prost::Message;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use kiln_proto::CacheEntry;

use crate::error::{CacheError, Result};
use crate::remote::Store;

type FetchOutcome = Result<()>;

/// Per-key fetch state. A key with no entry has never been requested (or its
/// last fetch failed) and is up for grabs.
enum KeyState {
    /// One fetch task is running; waiters subscribe to its completion.
    Fetching(watch::Receiver<Option<FetchOutcome>>),
    /// The object file exists at its final path, fully written.
    Present,
}

/// Content-addressed disk cache in front of a remote [`Store`].
///
/// Cheap to clone; all clones share state.
pub struct DiskCache<S> {
    inner: Arc<DiskCacheInner<S>>,
}

impl<S> Clone for DiskCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> std::ops::Deref for DiskCache<S> {
    type Target = DiskCacheInner<S>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

pub struct DiskCacheInner<S> {
    store: S,

    /// Root directory for cached objects, one flat file per key.
    cache_dir: Utf8PathBuf,

    /// Guards every state transition. Never held across store or disk I/O.
    state: Mutex<HashMap<String, KeyState>>,
}

impl<S: Store> DiskCache<S> {
    pub fn new(cache_dir: Utf8PathBuf, store: S) -> Self {
        Self {
            inner: Arc::new(DiskCacheInner {
                store,
                cache_dir,
                state: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ensure the object named by `key` is fully materialized on disk.
    ///
    /// Any number of callers may wait on the same key: exactly one remote
    /// fetch runs, and every waiter receives its outcome. `executable`
    /// picks the file mode, but only for the caller that starts the fetch;
    /// later requesters get whatever mode the winner chose.
    ///
    /// `timeout` bounds this caller's wait only. On expiry the fetch keeps
    /// running for the other waiters, and a later call for the same key
    /// will find it in flight (or already present).
    pub async fn ensure_cached(
        &self,
        key: &str,
        executable: bool,
        timeout: Duration,
    ) -> Result<()> {
        let mut rx = {
            let mut state = self.inner.state.lock().await;
            match state.entry(key.to_string()) {
                Entry::Occupied(entry) => match entry.get() {
                    KeyState::Present => return Ok(()),
                    KeyState::Fetching(rx) => rx.clone(),
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = watch::channel(None);
                    entry.insert(KeyState::Fetching(rx.clone()));

                    let inner = Arc::clone(&self.inner);
                    let key = key.to_string();
                    tokio::spawn(async move { inner.run_fetch(key, executable, tx).await });

                    rx
                }
            }
        };

        match tokio::time::timeout(timeout, rx.wait_for(|outcome| outcome.is_some())).await {
            Err(_) => Err(CacheError::Timeout),
            // The fetch task always signals before exiting; a closed channel
            // means it died without reporting.
            Ok(Err(_)) => Err(CacheError::Io(
                "fetch task exited without an outcome".to_string(),
            )),
            Ok(Ok(outcome)) => match (*outcome).clone() {
                Some(result) => result,
                None => Err(CacheError::Io(
                    "fetch task exited without an outcome".to_string(),
                )),
            },
        }
    }
}

impl<S: Store> DiskCacheInner<S> {
    /// Final on-disk path for a cached object. Only meaningful after a
    /// successful [`DiskCache::ensure_cached`] for the same key.
    pub fn object_path(&self, key: &str) -> Utf8PathBuf {
        self.cache_dir.join(key)
    }

    /// Body of the one elected fetch task: fetch, transition the key's
    /// state, then broadcast the outcome to every waiter.
    async fn run_fetch(
        &self,
        key: String,
        executable: bool,
        tx: watch::Sender<Option<FetchOutcome>>,
    ) {
        let outcome = self.fetch(&key, executable).await;

        {
            let mut state = self.state.lock().await;
            match &outcome {
                Ok(()) => {
                    state.insert(key.clone(), KeyState::Present);
                }
                // A failed key reverts to absent so the next request
                // triggers a fresh fetch.
                Err(_) => {
                    state.remove(&key);
                }
            }
        }

        if let Err(error) = &outcome {
            debug!(key = %key, error = %error, "fetch failed");
        }
        let _ = tx.send(Some(outcome));
    }

    async fn fetch(&self, key: &str, executable: bool) -> FetchOutcome {
        let path = self.object_path(key);

        // A file left behind by a previous run of this worker is trusted
        // as-is; the map just hasn't seen the key yet.
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(key = %key, "object already on disk");
            return Ok(());
        }

        let blob = self.store.get(key).await?;
        let entry = CacheEntry::decode(blob.as_slice())
            .map_err(|e| CacheError::Malformed(e.to_string()))?;

        let mode = if executable { 0o755 } else { 0o644 };
        write_object(&path, &entry.file_content, mode)
            .await
            .map_err(|e| CacheError::Io(format!("failed to write {}: {}", path, e)))?;

        debug!(key = %key, bytes = entry.file_content.len(), "object fetched");
        Ok(())
    }
}

/// Atomically write an object file with the given permission bits.
///
/// Writes to a temp file next to the final path, sets the mode, then renames
/// into place: the final path never holds a partially written object, and a
/// crashed fetch leaves nothing behind to go stale.
async fn write_object(path: &Utf8Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let parent_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    tokio::fs::create_dir_all(parent_dir).await?;

    let temp_file = tempfile::Builder::new()
        .prefix(".fetch-")
        .tempfile_in(parent_dir)
        .map_err(std::io::Error::other)?;

    let temp_path = temp_file.into_temp_path();
    tokio::fs::write(&temp_path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp_path
        .persist(path)
        .map_err(|e| std::io::Error::other(format!("failed to persist temp file: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemStore;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn test_cache(store: MemStore) -> (DiskCache<MemStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (DiskCache::new(root, store), dir)
    }

    #[cfg(unix)]
    fn file_mode(path: &Utf8Path) -> u32 {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[tokio::test]
    async fn miss_fetches_and_writes_file() {
        let store = MemStore::default();
        store.insert_blob("a1", b"HELLO");
        let (cache, _dir) = test_cache(store.clone());

        cache.ensure_cached("a1", false, TIMEOUT).await.unwrap();

        let path = cache.object_path("a1");
        assert_eq!(std::fs::read(&path).unwrap(), b"HELLO");
        assert_eq!(store.gets(), 1);
        #[cfg(unix)]
        assert_eq!(file_mode(&path), 0o644);
    }

    #[tokio::test]
    async fn second_ensure_is_a_hit() {
        let store = MemStore::default();
        store.insert_blob("a1", b"HELLO");
        let (cache, _dir) = test_cache(store.clone());

        cache.ensure_cached("a1", false, TIMEOUT).await.unwrap();
        cache.ensure_cached("a1", false, TIMEOUT).await.unwrap();

        assert_eq!(store.gets(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ensures_coalesce_into_one_get() {
        let store = MemStore::default();
        store.insert_blob("b2", b"XYZ");
        store.set_delay(Duration::from_millis(200));
        let (cache, _dir) = test_cache(store.clone());

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_cached("b2", true, TIMEOUT).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.gets(), 1);
        assert_eq!(std::fs::read(cache.object_path("b2")).unwrap(), b"XYZ");
        #[cfg(unix)]
        assert_eq!(file_mode(&cache.object_path("b2")), 0o755);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_fetch_amplification_under_load() {
        let store = MemStore::default();
        for i in 0..10 {
            store.insert_blob(&format!("k{}", i), b"body");
        }
        store.set_delay(Duration::from_millis(20));
        let (cache, _dir) = test_cache(store.clone());

        let tasks: Vec<_> = (0..1000)
            .map(|i| {
                let cache = cache.clone();
                let key = format!("k{}", i % 10);
                tokio::spawn(async move { cache.ensure_cached(&key, false, TIMEOUT).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.gets(), 10);
    }

    #[tokio::test]
    async fn failed_fetch_retries_on_next_ensure() {
        let store = MemStore::default();
        let (cache, _dir) = test_cache(store.clone());

        let err = cache.ensure_cached("c3", false, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound));
        assert_eq!(store.gets(), 1);

        store.insert_blob("c3", b"ok");
        cache.ensure_cached("c3", false, TIMEOUT).await.unwrap();
        assert_eq!(store.gets(), 2);
        assert_eq!(std::fs::read(cache.object_path("c3")).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn malformed_blob_reports_then_recovers() {
        let store = MemStore::default();
        // Field 2, length-delimited, claims five bytes but carries one.
        store.insert_raw("d4", vec![0x12, 0x05, 0x01]);
        let (cache, _dir) = test_cache(store.clone());

        let err = cache.ensure_cached("d4", false, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CacheError::Malformed(_)));
        assert!(!cache.object_path("d4").exists());

        store.insert_blob("d4", b"fixed");
        cache.ensure_cached("d4", false, TIMEOUT).await.unwrap();
        assert_eq!(store.gets(), 2);
        assert_eq!(std::fs::read(cache.object_path("d4")).unwrap(), b"fixed");
    }

    #[tokio::test]
    async fn waiter_timeout_leaves_fetch_running() {
        let store = MemStore::default();
        store.insert_blob("e5", b"slow");
        store.set_delay(Duration::from_millis(500));
        let (cache, _dir) = test_cache(store.clone());

        let err = cache
            .ensure_cached("e5", false, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Timeout));

        // The fetch keeps going; a patient caller sees it complete without
        // a second remote get.
        cache.ensure_cached("e5", false, TIMEOUT).await.unwrap();
        assert_eq!(store.gets(), 1);
        assert_eq!(std::fs::read(cache.object_path("e5")).unwrap(), b"slow");
    }

    #[tokio::test]
    async fn first_fetcher_picks_the_mode() {
        let store = MemStore::default();
        store.insert_blob("f6", b"#!/bin/sh\n");
        let (cache, _dir) = test_cache(store.clone());

        cache.ensure_cached("f6", true, TIMEOUT).await.unwrap();
        cache.ensure_cached("f6", false, TIMEOUT).await.unwrap();

        #[cfg(unix)]
        assert_eq!(file_mode(&cache.object_path("f6")), 0o755);
        assert_eq!(store.gets(), 1);
    }

    #[tokio::test]
    async fn file_from_previous_run_is_trusted() {
        let store = MemStore::default();
        let (cache, _dir) = test_cache(store.clone());
        std::fs::write(cache.object_path("g7"), b"leftover").unwrap();

        cache.ensure_cached("g7", false, TIMEOUT).await.unwrap();
        assert_eq!(store.gets(), 0);
    }
}
