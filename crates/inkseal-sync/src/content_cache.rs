//! In-memory cache of downloaded encrypted blobs.
//!
//! Holds ciphertext only, keyed by storage path, and evicts least recently
//! used blobs once the byte budget is exceeded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, (Arc<Vec<u8>>, u64)>,
    bytes: usize,
    seq: u64,
}

pub struct ContentCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl ContentCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner();
        inner.seq += 1;
        let seq = inner.seq;
        let (blob, last_used) = inner.entries.get_mut(path)?;
        *last_used = seq;
        Some(Arc::clone(blob))
    }

    /// Blobs larger than the whole budget are not cached.
    pub fn insert(&self, path: &str, blob: Arc<Vec<u8>>) {
        if blob.len() > self.max_bytes {
            return;
        }
        let mut inner = self.inner();
        inner.seq += 1;
        let seq = inner.seq;
        let size = blob.len();
        if let Some((old, _)) = inner.entries.insert(path.to_string(), (blob, seq)) {
            inner.bytes -= old.len();
        }
        inner.bytes += size;

        while inner.bytes > self.max_bytes {
            let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some((evicted, _)) = inner.entries.remove(&oldest) {
                inner.bytes -= evicted.len();
            }
        }
    }

    pub fn remove(&self, path: &str) {
        let mut inner = self.inner();
        if let Some((blob, _)) = inner.entries.remove(path) {
            inner.bytes -= blob.len();
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner();
        inner.entries.clear();
        inner.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0u8; len])
    }

    #[test]
    fn test_lru_eviction_by_bytes() {
        let cache = ContentCache::new(100);
        cache.insert("a", blob(40));
        cache.insert("b", blob(40));
        assert!(cache.get("a").is_some());

        cache.insert("c", blob(40));
        assert!(cache.get("b").is_none(), "b was least recently used");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.bytes(), 80);
    }

    #[test]
    fn test_oversized_blob_not_cached() {
        let cache = ContentCache::new(10);
        cache.insert("big", blob(11));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_and_remove() {
        let cache = ContentCache::new(100);
        cache.insert("a", blob(10));
        cache.insert("a", blob(30));
        assert_eq!(cache.bytes(), 30);
        cache.remove("a");
        assert_eq!(cache.bytes(), 0);
        assert!(cache.is_empty());
    }
}
