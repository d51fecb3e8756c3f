//! In-memory store for exercising the cache without a network.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use prost::Message;

use kiln_proto::CacheEntry;

use crate::error::{CacheError, Result};
use crate::remote::Store;

/// Instrumented in-memory [`Store`]: counts gets, optionally delays them.
#[derive(Clone, Default)]
pub(crate) struct MemStore {
    inner: Arc<MemStoreInner>,
}

#[derive(Default)]
struct MemStoreInner {
    objects: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    gets: AtomicUsize,
    delay: std::sync::Mutex<Option<Duration>>,
}

impl MemStore {
    /// Store `content` under `key`, framed as a blob-wrapper cache entry.
    pub(crate) fn insert_blob(&self, key: &str, content: &[u8]) {
        let entry = CacheEntry {
            files: vec![],
            file_content: content.to_vec(),
        };
        self.insert_raw(key, entry.encode_to_vec());
    }

    /// Store raw bytes under `key`, unframed.
    pub(crate) fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.inner
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes);
    }

    /// Make every `get` sleep first, to widen coalescing windows.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = Some(delay);
    }

    /// How many `get` calls the store has served.
    pub(crate) fn gets(&self) -> usize {
        self.inner.gets.load(Ordering::SeqCst)
    }
}

impl Store for MemStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.gets.fetch_add(1, Ordering::SeqCst);

        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.inner.objects.lock().unwrap().get(key) {
            Some(bytes) => Ok(bytes.clone()),
            None => Err(CacheError::NotFound),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.insert_raw(key, data);
        Ok(())
    }
}
