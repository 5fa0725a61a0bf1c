// =============================================================================
// Replay guard — timestamp drift and duplicate signal-id detection
// =============================================================================
//
// Two checks, in order, for every admitted payload:
//   1. Drift:     |now − payload.timestamp| must be within max_drift_ms.
//   2. Duplicate: the signal id must not have been seen within signal_ttl_ms.
//
// The seen-set is a size-bounded LRU with per-entry TTL. When a shared keyed
// store is configured it is the primary source of truth; the LRU is the
// fallback when the store errors, so a flaky store degrades to per-process
// protection instead of letting replays through unchecked.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::admission::KeyedStore;
use crate::error::{codes, EngineError};
use crate::types::{now_ms, parse_timestamp_ms};

/// Size bound of the in-memory seen-set.
const SEEN_SET_CAPACITY: usize = 10_000;

struct SeenSet {
    entries: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl SeenSet {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if the id was already present (a replay).
    fn check_and_insert(&mut self, id: &str, ttl: Duration) -> bool {
        let now = Instant::now();

        // Purge expired ids from the front of the insertion order.
        while let Some(front) = self.order.front() {
            match self.entries.get(front) {
                Some(expires) if *expires <= now => {
                    let key = self.order.pop_front().unwrap();
                    self.entries.remove(&key);
                }
                _ => break,
            }
        }

        if let Some(expires) = self.entries.get(id) {
            if *expires > now {
                return true;
            }
        }

        self.entries.insert(id.to_string(), now + ttl);
        self.order.push_back(id.to_string());

        // Size bound: evict the oldest insertions.
        while self.entries.len() > SEEN_SET_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }

        false
    }
}

/// Guards the webhook endpoint against stale and replayed signals.
pub struct ReplayGuard {
    seen: Mutex<SeenSet>,
    store: Option<Arc<dyn KeyedStore>>,
    max_drift_ms: i64,
    ttl: Duration,
}

impl ReplayGuard {
    pub fn new(max_drift_ms: u64, signal_ttl_ms: u64, store: Option<Arc<dyn KeyedStore>>) -> Self {
        Self {
            seen: Mutex::new(SeenSet::new()),
            store,
            max_drift_ms: max_drift_ms as i64,
            ttl: Duration::from_millis(signal_ttl_ms),
        }
    }

    /// Run both admission checks. On success the signal id is recorded in the
    /// seen-set so a second submission within the TTL is rejected.
    pub async fn admit(
        &self,
        signal_id: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<(), EngineError> {
        let signal_id = signal_id.filter(|s| !s.is_empty()).ok_or_else(|| {
            EngineError::validation(codes::MISSING_SIGNAL_ID, "payload is missing signal_id")
        })?;

        // 1. Drift.
        let ts = timestamp.ok_or_else(|| {
            EngineError::validation(codes::INVALID_TIMESTAMP, "payload is missing timestamp")
        })?;
        let payload_ms = parse_timestamp_ms(ts)?;
        let drift = (now_ms() - payload_ms).abs();
        if drift > self.max_drift_ms {
            return Err(EngineError::validation(
                codes::TIMESTAMP_DRIFT_EXCEEDED,
                format!("timestamp drift {drift}ms exceeds {}ms", self.max_drift_ms),
            ));
        }

        // 2. Duplicate — shared store first, LRU fallback on store errors.
        let duplicate = if let Some(store) = &self.store {
            let key = format!("seen:{signal_id}");
            match store.put_if_absent(&key, self.ttl).await {
                Ok(inserted) => {
                    // Mirror into the LRU so a later store outage still knows
                    // about recent ids.
                    self.seen.lock().check_and_insert(signal_id, self.ttl);
                    !inserted
                }
                Err(e) => {
                    warn!(error = %e, "shared seen-store unavailable — falling back to local LRU");
                    self.seen.lock().check_and_insert(signal_id, self.ttl)
                }
            }
        } else {
            self.seen.lock().check_and_insert(signal_id, self.ttl)
        };

        if duplicate {
            debug!(signal_id, "duplicate signal rejected");
            return Err(EngineError::validation(
                codes::DUPLICATE_SIGNAL_ID,
                format!("signal id '{signal_id}' was already processed"),
            ));
        }

        Ok(())
    }
}
