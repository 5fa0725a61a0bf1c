// =============================================================================
// Rate limiter — token bucket with queue-depth back-pressure signals
// =============================================================================
//
// Every outbound broker call acquires a token first. Tokens refill at
// `rate_limit_per_sec`; waiters queue FIFO behind a fair async mutex.
//
// Back-pressure is surfaced, not hidden: queue depth above the warning
// threshold emits `ratelimit:approaching`, above the force-market threshold
// emits `ratelimit:force_market` (strategies read the same hint and skip
// maker attempts), and N consecutive warnings escalate to `ratelimit:alert`.
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventBus};

/// Queue depth beyond which `approaching` fires.
const DEFAULT_WARN_DEPTH: usize = 5;
/// Queue depth beyond which `force_market` fires.
const DEFAULT_FORCE_MARKET_DEPTH: usize = 8;
/// Consecutive warnings before an operator alert.
const DEFAULT_ALERT_AFTER: u32 = 3;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Serializable state for the console snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub queue_depth: usize,
    pub rate_per_sec: u32,
    pub force_market: bool,
}

pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    /// Fair (FIFO) queue for waiters.
    turnstile: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
    consecutive_warnings: AtomicU32,
    rate_per_sec: u32,
    capacity: f64,
    warn_depth: usize,
    force_market_depth: usize,
    alert_after: u32,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, events: EventBus) -> Self {
        let rate = rate_per_sec.clamp(1, 50);
        Self {
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
            turnstile: tokio::sync::Mutex::new(()),
            waiting: AtomicUsize::new(0),
            consecutive_warnings: AtomicU32::new(0),
            rate_per_sec: rate,
            capacity: rate as f64,
            warn_depth: DEFAULT_WARN_DEPTH,
            force_market_depth: DEFAULT_FORCE_MARKET_DEPTH,
            alert_after: DEFAULT_ALERT_AFTER,
            events,
        }
    }

    /// Wait for a token. Queued callers are served in arrival order; dropping
    /// the returned future (cancellation) simply leaves the queue.
    pub async fn acquire(&self) {
        let depth = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        self.signal_pressure(depth);

        // Ensure the waiting count is decremented even if the caller is
        // cancelled while queued.
        struct Departing<'a>(&'a AtomicUsize);
        impl Drop for Departing<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _departing = Departing(&self.waiting);

        let _turn = self.turnstile.lock().await;
        loop {
            if self.try_take() {
                return;
            }
            // One token arrives every 1/rate seconds; sleeping a fraction of
            // that keeps latency low without spinning.
            sleep(Duration::from_millis(
                (1000 / u64::from(self.rate_per_sec)).clamp(5, 250) / 4 + 1,
            ))
            .await;
        }
    }

    /// Strategies consult this before attempting a maker entry: a saturated
    /// queue means skip the passive attempt and take liquidity immediately.
    pub fn force_market_hint(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > self.force_market_depth
    }

    pub fn queue_depth(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        RateLimiterSnapshot {
            queue_depth: self.queue_depth(),
            rate_per_sec: self.rate_per_sec,
            force_market: self.force_market_hint(),
        }
    }

    fn try_take(&self) -> bool {
        let mut bucket = self.bucket.lock();
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * f64::from(self.rate_per_sec)).min(self.capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn signal_pressure(&self, depth: usize) {
        if depth > self.force_market_depth {
            warn!(depth, "rate limiter saturated — advising market execution");
            self.events
                .publish(EngineEvent::RateLimitForceMarket { queue_depth: depth });
            self.bump_warnings();
        } else if depth > self.warn_depth {
            debug!(depth, "rate limiter queue building");
            self.events
                .publish(EngineEvent::RateLimitApproaching { queue_depth: depth });
            self.bump_warnings();
        } else {
            self.consecutive_warnings.store(0, Ordering::SeqCst);
        }
    }

    fn bump_warnings(&self) {
        let warnings = self.consecutive_warnings.fetch_add(1, Ordering::SeqCst) + 1;
        if warnings == self.alert_after {
            warn!(consecutive = warnings, "sustained rate-limit pressure");
            self.events.publish(EngineEvent::RateLimitAlert {
                consecutive_warnings: warnings,
            });
        }
    }
}
