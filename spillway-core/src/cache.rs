//! In-memory TTL cache of resolved file locations.
//!
//! Descriptors are worker-scoped, so entries are keyed by the
//! `(message, worker)` pair. Entries expire after a fixed TTL, and the map
//! is capped with LRU eviction to bound memory under adversarial request
//! patterns.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::RwLock;
use tracing::warn;

use crate::upstream::{FileDescriptor, WorkerId};

/// Cache key: at most one entry per `(message, worker)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationKey {
    /// Message id holding the file.
    pub message_id: i32,
    /// Worker whose session resolved the descriptor.
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone)]
struct LocationEntry {
    descriptor: FileDescriptor,
    expires_at: Instant,
}

/// TTL + LRU map of message file locations.
pub struct LocationCache {
    entries: RwLock<LruCache<LocationKey, LocationEntry>>,
    ttl: Duration,
}

impl LocationCache {
    /// Default entry lifetime.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3 * 60 * 60);

    /// Default entry cap before LRU eviction.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Creates a cache with the given TTL and capacity.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(Self::DEFAULT_CAPACITY).unwrap());
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Creates a cache with default TTL and capacity.
    pub fn new_default() -> Self {
        Self::new(Self::DEFAULT_TTL, Self::DEFAULT_CAPACITY)
    }

    /// Returns the descriptor for `(message, worker)` unless absent or
    /// expired. Expired entries are evicted on the way out.
    pub async fn lookup(
        &self,
        message_id: i32,
        worker_id: WorkerId,
    ) -> Option<FileDescriptor> {
        let key = LocationKey {
            message_id,
            worker_id,
        };
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let expired = match entries.get(&key) {
            Some(entry) if entry.expires_at > now => return Some(entry.descriptor.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&key);
        }
        None
    }

    /// Unconditionally stores a descriptor with a fresh TTL.
    pub async fn store(&self, message_id: i32, worker_id: WorkerId, descriptor: FileDescriptor) {
        let key = LocationKey {
            message_id,
            worker_id,
        };
        let entry = LocationEntry {
            descriptor,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().await.put(key, entry);
    }

    /// Drops the entry for `(message, worker)` if present.
    pub async fn invalidate(&self, message_id: i32, worker_id: WorkerId) {
        let key = LocationKey {
            message_id,
            worker_id,
        };
        if self.entries.write().await.pop(&key).is_some() {
            warn!(msg = message_id, worker = worker_id, "file location invalidated");
        }
    }

    /// Number of live entries, expired ones included until they are
    /// touched.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
