// =============================================================================
// Idempotency store — at-most-once execution per signal id
// =============================================================================
//
// Maps signal-id → the response envelope the first submission produced.
// `process` serializes handler execution, so PREPARE→CONFIRM→ABORT for a
// single signal id is observed in submission order and a duplicate is served
// the cached envelope of the first call without re-running the handler.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::admission::KeyedStore;
use crate::types::ResponseEnvelope;

/// Size bound for the in-memory envelope cache.
const CACHE_CAPACITY: usize = 4096;

/// Result of a `process` call.
pub struct ProcessOutcome {
    pub result: ResponseEnvelope,
    /// `true` when the envelope was served from cache (replay).
    pub cached: bool,
}

struct EnvelopeCache {
    entries: HashMap<String, (ResponseEnvelope, Instant)>,
    order: VecDeque<String>,
}

impl EnvelopeCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<ResponseEnvelope> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some((env, expires)) if *expires > now => Some(env.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, key: String, envelope: ResponseEnvelope, ttl: Duration) {
        self.entries
            .insert(key.clone(), (envelope, Instant::now() + ttl));
        self.order.push_back(key);
        while self.entries.len() > CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Keyed response cache with at-most-once handler execution.
pub struct IdempotencyStore {
    cache: Mutex<EnvelopeCache>,
    store: Option<Arc<dyn KeyedStore>>,
    /// Serializes handler execution; tokio's Mutex is fair, so queued signals
    /// run in arrival order.
    execution: tokio::sync::Mutex<()>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(ttl_ms: u64, store: Option<Arc<dyn KeyedStore>>) -> Self {
        Self {
            cache: Mutex::new(EnvelopeCache::new()),
            store,
            execution: tokio::sync::Mutex::new(()),
            ttl: Duration::from_millis(ttl_ms),
        }
    }

    /// Look up a prior envelope without executing anything.
    pub async fn lookup(&self, signal_id: &str) -> Option<ResponseEnvelope> {
        if let Some(store) = &self.store {
            match store.get(&Self::store_key(signal_id)).await {
                Ok(Some(json)) => match serde_json::from_str(&json) {
                    Ok(env) => return Some(env),
                    Err(e) => warn!(error = %e, "corrupt idempotency entry in shared store"),
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "shared idempotency store unavailable — using local cache");
                }
            }
        }
        self.cache.lock().get(signal_id)
    }

    /// Execute `handler` at most once per signal id within the TTL. Replays
    /// get the cached envelope with `cached = true`.
    pub async fn process<F, Fut>(&self, signal_id: &str, handler: F) -> ProcessOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResponseEnvelope>,
    {
        // Hold the execution lock across lookup + run + store so two
        // concurrent submissions of the same id cannot both run the handler.
        let _guard = self.execution.lock().await;

        if let Some(env) = self.lookup(signal_id).await {
            debug!(signal_id, "idempotent replay — serving cached envelope");
            return ProcessOutcome {
                result: env,
                cached: true,
            };
        }

        let envelope = handler().await;
        self.remember(signal_id, &envelope).await;

        ProcessOutcome {
            result: envelope,
            cached: false,
        }
    }

    async fn remember(&self, signal_id: &str, envelope: &ResponseEnvelope) {
        if let Some(store) = &self.store {
            match serde_json::to_string(envelope) {
                Ok(json) => {
                    if let Err(e) = store.set(&Self::store_key(signal_id), &json, self.ttl).await {
                        warn!(error = %e, "failed to persist idempotency entry — keeping local copy");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize response envelope"),
            }
        }
        self.cache
            .lock()
            .insert(signal_id.to_string(), envelope.clone(), self.ttl);
    }

    fn store_key(signal_id: &str) -> String {
        format!("idem:{signal_id}")
    }
}
