// =============================================================================
// Drift / drawdown guard — Z-score and velocity-of-drawdown kill switches
// =============================================================================
//
// Two independent detectors over rolling windows:
//
//   Z-score: the mean of the last N realized P&Ls is compared against the
//   strategy's expected distribution. Only once the window is FULL and
//   Z = (observed_mean − expected_mean) / expected_stddev drops below the
//   (negative) threshold does `safety_stop` fire — the edge has drifted.
//
//   Drawdown velocity: rolling equity snapshots; if equity falls more than
//   the threshold percent from its in-window peak within the time window,
//   `hard_kill` fires with FLASH_CRASH_PROTECTION.
//
// Both latch until reset; reset clears the windows and requires fresh data.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::codes;
use crate::events::{EngineEvent, EventBus};

#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Number of trades in the P&L window.
    pub window_size: usize,
    /// Expected per-trade P&L mean of a healthy edge.
    pub expected_mean: f64,
    /// Expected per-trade P&L standard deviation.
    pub expected_stddev: f64,
    /// Negative threshold; Z below this trips the stop.
    pub zscore_threshold: f64,
    /// Peak-to-current percent fall that counts as a flash crash.
    pub drawdown_velocity_pct: f64,
    /// Time window for the equity snapshots.
    pub drawdown_window: Duration,
}

impl DriftConfig {
    pub fn from_limits(
        window_size: usize,
        zscore_threshold: f64,
        drawdown_velocity_pct: f64,
        drawdown_window_ms: u64,
    ) -> Self {
        Self {
            window_size,
            expected_mean: 0.0,
            expected_stddev: 1.0,
            zscore_threshold,
            drawdown_velocity_pct,
            drawdown_window: Duration::from_millis(drawdown_window_ms),
        }
    }
}

/// What a recording call decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Ok,
    SafetyStop,
    HardKill,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftSnapshot {
    pub window_len: usize,
    pub window_full: bool,
    pub zscore: Option<f64>,
    pub tripped: bool,
}

struct Windows {
    pnls: VecDeque<f64>,
    equity: VecDeque<(Instant, f64)>,
}

pub struct DriftGuard {
    windows: Mutex<Windows>,
    tripped: AtomicBool,
    config: DriftConfig,
    events: EventBus,
}

impl DriftGuard {
    pub fn new(config: DriftConfig, events: EventBus) -> Self {
        Self {
            windows: Mutex::new(Windows {
                pnls: VecDeque::new(),
                equity: VecDeque::new(),
            }),
            tripped: AtomicBool::new(false),
            config,
            events,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Record a realized P&L and evaluate the Z-score detector.
    pub fn record_pnl(&self, pnl: Decimal) -> GuardVerdict {
        let pnl = pnl.to_f64().unwrap_or(0.0);
        let zscore = {
            let mut windows = self.windows.lock();
            windows.pnls.push_back(pnl);
            while windows.pnls.len() > self.config.window_size {
                windows.pnls.pop_front();
            }
            if windows.pnls.len() < self.config.window_size {
                None
            } else {
                Some(self.zscore_of(&windows.pnls))
            }
        };

        if self.is_tripped() {
            return GuardVerdict::Ok;
        }

        if let Some(z) = zscore {
            if z < self.config.zscore_threshold {
                warn!(
                    zscore = z,
                    threshold = self.config.zscore_threshold,
                    "P&L drift beyond threshold — safety stop"
                );
                self.tripped.store(true, Ordering::SeqCst);
                self.events.publish(EngineEvent::SafetyStop {
                    zscore: z,
                    threshold: self.config.zscore_threshold,
                });
                return GuardVerdict::SafetyStop;
            }
        }
        GuardVerdict::Ok
    }

    /// Record an equity snapshot and evaluate the flash-crash detector.
    pub fn record_equity(&self, equity: Decimal) -> GuardVerdict {
        let equity = equity.to_f64().unwrap_or(0.0);
        let now = Instant::now();
        let drawdown_pct = {
            let mut windows = self.windows.lock();
            windows.equity.push_back((now, equity));
            let horizon = self.config.drawdown_window;
            while windows
                .equity
                .front()
                .map(|(t, _)| now.duration_since(*t) > horizon)
                .unwrap_or(false)
            {
                windows.equity.pop_front();
            }

            let peak = windows
                .equity
                .iter()
                .map(|(_, e)| *e)
                .fold(f64::MIN, f64::max);
            if peak > 0.0 {
                (equity - peak) / peak * 100.0
            } else {
                0.0
            }
        };

        if self.is_tripped() {
            return GuardVerdict::Ok;
        }

        if drawdown_pct <= -self.config.drawdown_velocity_pct {
            warn!(
                drawdown_pct,
                window = ?self.config.drawdown_window,
                "equity falling too fast — hard kill"
            );
            self.tripped.store(true, Ordering::SeqCst);
            self.events.publish(EngineEvent::HardKill {
                reason: codes::FLASH_CRASH_PROTECTION.to_string(),
                drawdown_pct,
            });
            return GuardVerdict::HardKill;
        }
        GuardVerdict::Ok
    }

    /// Clear both windows and the latch. Fresh data is required before the
    /// detectors can evaluate again.
    pub fn reset(&self) {
        let mut windows = self.windows.lock();
        windows.pnls.clear();
        windows.equity.clear();
        self.tripped.store(false, Ordering::SeqCst);
        info!("drift guard reset");
    }

    pub fn snapshot(&self) -> DriftSnapshot {
        let windows = self.windows.lock();
        let full = windows.pnls.len() >= self.config.window_size;
        DriftSnapshot {
            window_len: windows.pnls.len(),
            window_full: full,
            zscore: full.then(|| self.zscore_of(&windows.pnls)),
            tripped: self.is_tripped(),
        }
    }

    fn zscore_of(&self, pnls: &VecDeque<f64>) -> f64 {
        let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
        (mean - self.config.expected_mean) / self.config.expected_stddev
    }
}
