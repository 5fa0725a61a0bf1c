// =============================================================================
// Execution strategies — phase-aware order placement
// =============================================================================
//
// Two strategies implement the same narrow interface:
//   Limit-or-Kill (Phase 1, maker): post-only at the touch, poll, kill.
//   Limit Chaser  (Phase 2, taker): re-price toward the book under an alpha
//                                   decay budget.
//
// Both are cancel-aware: the dispatcher registers a token per signal and an
// emergency flatten cancels every in-flight strategy before closing orders.
// =============================================================================

pub mod limit_chaser;
pub mod limit_or_kill;
pub mod pyramid;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::Notify;

use crate::shadow::Fill;
use crate::types::{OrderSide, SignalClass};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// One-shot cancellation token. Strategies poll `is_cancelled` between steps
/// and select on `cancelled()` during timed waits.
pub struct CancelToken {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before re-checking the flag so a cancel() landing between
        // the check and the await cannot be missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// In-flight strategy executions keyed by signal id. ABORT cancels one;
/// emergency flatten cancels all.
#[derive(Default)]
pub struct ChaseRegistry {
    active: RwLock<HashMap<String, Arc<CancelToken>>>,
}

impl ChaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, signal_id: &str) -> Arc<CancelToken> {
        let token = CancelToken::new();
        self.active
            .write()
            .insert(signal_id.to_string(), token.clone());
        token
    }

    pub fn deregister(&self, signal_id: &str) {
        self.active.write().remove(signal_id);
    }

    pub fn cancel(&self, signal_id: &str) -> bool {
        if let Some(token) = self.active.read().get(signal_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn cancel_all(&self) -> usize {
        let active = self.active.read();
        for token in active.values() {
            token.cancel();
        }
        active.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }
}

// ---------------------------------------------------------------------------
// Strategy interface
// ---------------------------------------------------------------------------

/// Inputs common to both strategies.
#[derive(Debug, Clone)]
pub struct StrategyParams {
    pub signal_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub signal_class: SignalClass,
    pub alpha_half_life_ms: Option<u64>,
    pub urgency_score: Option<f64>,
    /// Post-only on chased orders; defaults on, overridable per signal.
    pub post_only: bool,
    /// Tick size override; derived from price magnitude when absent.
    pub tick_size: Option<Decimal>,
}

/// Book context sampled at decision points, included in every report.
#[derive(Debug, Clone, Serialize)]
pub struct MarketConditions {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub spread_pct: Option<f64>,
    pub obi: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecOutcome {
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "MISSED_ENTRY")]
    MissedEntry,
    #[serde(rename = "ALPHA_EXPIRED")]
    AlphaExpired,
    #[serde(rename = "OBI_WORSENING")]
    ObiWorsening,
    #[serde(rename = "FILL_TIMEOUT")]
    FillTimeout,
    #[serde(rename = "MAX_TICKS_EXCEEDED")]
    MaxTicksExceeded,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "ERROR")]
    Error,
}

/// Uniform result of a strategy run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub signal_id: String,
    pub outcome: ExecOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fill: Option<Fill>,
    pub chase_time_ms: u64,
    pub chase_ticks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_conditions: Option<MarketConditions>,
    /// MISSED_ENTRY diagnostics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid_at_entry: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub movement_pct: Option<f64>,
    /// Alpha remaining when the run ended (chaser only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_alpha: Option<f64>,
}

impl ExecutionReport {
    pub fn new(signal_id: &str, outcome: ExecOutcome) -> Self {
        Self {
            success: matches!(outcome, ExecOutcome::Filled | ExecOutcome::PartiallyFilled),
            signal_id: signal_id.to_string(),
            outcome,
            reason: None,
            fill: None,
            chase_time_ms: 0,
            chase_ticks: 0,
            market_conditions: None,
            bid_at_entry: None,
            current_bid: None,
            movement_pct: None,
            remaining_alpha: None,
        }
    }
}

/// The dispatcher selects an implementation by the current phase's execution
/// mode and calls it through this interface.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, params: StrategyParams, cancel: &CancelToken) -> ExecutionReport;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Resolve the alpha half-life: explicit override beats the class default;
/// very high urgency stretches the budget by 1.5×.
pub fn resolve_alpha_half_life_ms(
    class: SignalClass,
    override_ms: Option<u64>,
    urgency_score: Option<f64>,
) -> u64 {
    let base = override_ms.unwrap_or_else(|| class.default_half_life_ms());
    match urgency_score {
        Some(u) if u > 95.0 => (base as f64 * 1.5) as u64,
        _ => base,
    }
}

/// Remaining alpha after `elapsed_ms`: 0.5^(elapsed / half_life).
pub fn remaining_alpha(elapsed_ms: u64, half_life_ms: u64) -> f64 {
    if half_life_ms == 0 {
        return 0.0;
    }
    0.5_f64.powf(elapsed_ms as f64 / half_life_ms as f64)
}

/// Derive a tick size from price magnitude when the venue metadata is not
/// supplied: roughly four significant digits of granularity.
pub fn tick_size_for(price: Decimal) -> Decimal {
    if price >= dec!(10000) {
        dec!(1)
    } else if price >= dec!(1000) {
        dec!(0.1)
    } else if price >= dec!(100) {
        dec!(0.01)
    } else if price >= dec!(10) {
        dec!(0.001)
    } else if price >= dec!(1) {
        dec!(0.0001)
    } else {
        dec!(0.00001)
    }
}
