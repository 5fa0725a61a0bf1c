// =============================================================================
// Signal admission — replay protection and idempotent response caching
// =============================================================================

pub mod idempotency;
pub mod replay;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// Narrow interface over a shared keyed store (e.g. Redis). When configured
/// it is the primary source for replay detection and idempotency; the
/// in-memory structures are the fallback when the store errors.
///
/// Persistence itself is a collaborator concern; the engine only needs these
/// three operations.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Atomically insert the key if absent. Returns `true` when inserted,
    /// `false` when the key already existed (a replay).
    async fn put_if_absent(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// In-process implementation used when no external store is configured and
/// in tests. TTL-bounded and size-bounded (oldest-insertion eviction).
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    max_entries: usize,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    fn purge_and_bound(entries: &mut HashMap<String, (String, Instant)>, max: usize) {
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        while entries.len() > max {
            // Evict whichever entry expires soonest.
            if let Some(key) = entries
                .iter()
                .min_by_key(|(_, (_, exp))| *exp)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&key);
            } else {
                break;
            }
        }
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Self::purge_and_bound(&mut entries, self.max_entries);
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Self::purge_and_bound(&mut entries, self.max_entries);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        Self::purge_and_bound(&mut entries, self.max_entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (String::new(), Instant::now() + ttl));
        Ok(true)
    }
}
