// =============================================================================
// Shadow State — authoritative in-process view of intents and positions
// =============================================================================
//
// Sole owner of every Intent and Position. All mutation goes through the
// single `parking_lot::RwLock`, which gives the pyramiding arithmetic and
// status transitions single-writer atomicity; readers get copy-on-read
// snapshots and never observe a half-applied fill.
//
// Intent lifecycle:
//   PENDING -> VALIDATED -> EXECUTED
//   PENDING | VALIDATED -> REJECTED
// Terminal intents (EXECUTED, REJECTED) are immutable; PENDING intents are
// garbage-collected after the TTL.
//
// Positions are keyed by symbol, which makes "at most one open position per
// symbol" structural rather than checked.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{codes, EngineError};
use crate::types::{CloseReason, Direction, RegimeVector, SignalClass};

/// Maximum pyramid layers per position.
pub const MAX_PYRAMID_LAYERS: u8 = 4;

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "VALIDATED")]
    Validated,
    #[serde(rename = "EXECUTED")]
    Executed,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl IntentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Executed | Self::Rejected)
    }
}

/// Everything the dispatcher extracts from an admitted PREPARE/CONFIRM body.
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_zone: Vec<Decimal>,
    pub stop_loss: Decimal,
    pub take_profits: Vec<Decimal>,
    pub regime: Option<RegimeVector>,
    pub signal_class: SignalClass,
    pub alpha_half_life_ms: Option<u64>,
}

/// A tracked trading intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_zone: Vec<Decimal>,
    pub stop_loss: Decimal,
    pub take_profits: Vec<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime: Option<RegimeVector>,
    pub signal_class: SignalClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha_half_life_ms: Option<u64>,
    pub status: IntentStatus,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(skip, default = "Instant::now")]
    created_at: Instant,
}

// ---------------------------------------------------------------------------
// Fill / Position / TradeRecord
// ---------------------------------------------------------------------------

/// Execution result handed to `confirm_execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub filled: bool,
    pub price: Decimal,
    pub size: Decimal,
}

impl Fill {
    pub fn filled(price: Decimal, size: Decimal) -> Self {
        Self {
            filled: true,
            price,
            size,
        }
    }

    pub fn missed() -> Self {
        Self {
            filled: false,
            price: Decimal::ZERO,
            size: Decimal::ZERO,
        }
    }
}

/// An open position. Entry price is volume-weighted across pyramid layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profits: Vec<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub phase_at_entry: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regime_at_entry: Option<RegimeVector>,
    pub pyramid_layers: u8,
    /// Size of the initial layer; the pyramid monitor adds layers of this size.
    pub layer_size: Decimal,
    /// Chain of signal ids that built this position (append-only).
    pub signal_ids: Vec<String>,
}

impl Position {
    /// Unrealized P&L at `mark`, in quote currency.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        match self.direction {
            Direction::Long => (mark - self.entry_price) * self.size,
            Direction::Short => (self.entry_price - mark) * self.size,
        }
    }
}

/// Immutable record of a full or partial close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: f64,
    pub reason: String,
    pub closed_at: DateTime<Utc>,
}

/// Outcome of `confirm_execution`.
#[derive(Debug, Clone)]
pub enum ConfirmResult {
    /// Intent executed; the (possibly pyramided) position after the fill.
    Executed(Position),
    /// Fill was empty or not filled; intent moved to REJECTED.
    Rejected,
}

// ---------------------------------------------------------------------------
// Serializable snapshot
// ---------------------------------------------------------------------------

/// Full serializable image of the shadow state; round-trips all open
/// positions and their entry math.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowSnapshot {
    pub intents: Vec<Intent>,
    pub positions: Vec<Position>,
    pub trades: Vec<TradeRecord>,
}

// ---------------------------------------------------------------------------
// ShadowState
// ---------------------------------------------------------------------------

struct Inner {
    intents: HashMap<String, Intent>,
    positions: HashMap<String, Position>,
    trades: Vec<TradeRecord>,
}

/// The authoritative local state machine.
pub struct ShadowState {
    inner: RwLock<Inner>,
    intent_ttl: Duration,
}

/// Bound on the retained trade history.
const MAX_TRADE_HISTORY: usize = 1000;

impl ShadowState {
    pub fn new(intent_ttl_ms: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                intents: HashMap::new(),
                positions: HashMap::new(),
                trades: Vec::new(),
            }),
            intent_ttl: Duration::from_millis(intent_ttl_ms),
        }
    }

    // -------------------------------------------------------------------------
    // Intent lifecycle
    // -------------------------------------------------------------------------

    /// Create (or return the existing) intent for a signal. Deterministic and
    /// idempotent within the TTL: resubmitting the same signal id yields the
    /// already-tracked intent unchanged.
    pub fn process_intent(&self, req: NewIntent) -> Result<Intent, EngineError> {
        if req.size <= Decimal::ZERO {
            return Err(EngineError::validation(
                codes::INVALID_PAYLOAD,
                format!("intent size must be positive, got {}", req.size),
            ));
        }

        let mut inner = self.inner.write();
        Self::gc_expired(&mut inner, self.intent_ttl);

        if let Some(existing) = inner.intents.get(&req.signal_id) {
            debug!(signal_id = %req.signal_id, status = ?existing.status, "intent already tracked");
            return Ok(existing.clone());
        }

        let intent = Intent {
            signal_id: req.signal_id.clone(),
            symbol: req.symbol,
            direction: req.direction,
            size: req.size,
            entry_zone: req.entry_zone,
            stop_loss: req.stop_loss,
            take_profits: req.take_profits,
            regime: req.regime,
            signal_class: req.signal_class,
            alpha_half_life_ms: req.alpha_half_life_ms,
            status: IntentStatus::Pending,
            created_at_ms: crate::types::now_ms(),
            rejection_reason: None,
            created_at: Instant::now(),
        };

        info!(
            signal_id = %intent.signal_id,
            symbol = %intent.symbol,
            direction = %intent.direction,
            size = %intent.size,
            class = %intent.signal_class,
            "intent created (PENDING)"
        );

        inner.intents.insert(req.signal_id, intent.clone());
        Ok(intent)
    }

    /// PENDING → VALIDATED.
    pub fn validate_intent(&self, signal_id: &str) -> Result<Intent, EngineError> {
        let mut inner = self.inner.write();
        let intent = inner.intents.get_mut(signal_id).ok_or_else(|| {
            EngineError::validation(
                codes::UNKNOWN_SIGNAL_ID,
                format!("no intent for '{signal_id}'"),
            )
        })?;

        match intent.status {
            IntentStatus::Pending => {
                intent.status = IntentStatus::Validated;
                debug!(signal_id, "intent VALIDATED");
                Ok(intent.clone())
            }
            IntentStatus::Validated => Ok(intent.clone()),
            status => Err(EngineError::validation(
                codes::INTENT_ALREADY_TERMINAL,
                format!("intent '{signal_id}' is terminal ({status:?})"),
            )),
        }
    }

    /// VALIDATED | PENDING → EXECUTED (on a real fill) or REJECTED.
    ///
    /// On execution the fill either opens a new position or pyramids into the
    /// existing same-direction position:
    ///   new_size  = old_size + fill_size
    ///   new_entry = (old_size·old_entry + fill_size·fill_price) / new_size
    pub fn confirm_execution(
        &self,
        signal_id: &str,
        fill: Fill,
        phase: u8,
    ) -> Result<ConfirmResult, EngineError> {
        let mut inner = self.inner.write();

        let intent = inner.intents.get(signal_id).cloned().ok_or_else(|| {
            EngineError::validation(
                codes::UNKNOWN_SIGNAL_ID,
                format!("no intent for '{signal_id}'"),
            )
        })?;

        if intent.status.is_terminal() {
            return Err(EngineError::validation(
                codes::INTENT_ALREADY_TERMINAL,
                format!("intent '{signal_id}' is terminal ({:?})", intent.status),
            ));
        }

        if !fill.filled || fill.size <= Decimal::ZERO {
            if let Some(i) = inner.intents.get_mut(signal_id) {
                i.status = IntentStatus::Rejected;
                i.rejection_reason = Some("no fill".to_string());
            }
            info!(signal_id, "intent REJECTED (no fill)");
            return Ok(ConfirmResult::Rejected);
        }

        // Check for direction conflict before touching anything.
        if let Some(existing) = inner.positions.get(&intent.symbol) {
            if existing.direction != intent.direction {
                return Err(EngineError::validation(
                    codes::POSITION_SIDE_CONFLICT,
                    format!(
                        "open {} position on {} conflicts with {} intent",
                        existing.direction, intent.symbol, intent.direction
                    ),
                ));
            }
        }

        let position = if inner.positions.contains_key(&intent.symbol) {
            // Pyramid into the existing position.
            let existing = inner
                .positions
                .get_mut(&intent.symbol)
                .expect("presence checked above");
            let old_notional = existing.size * existing.entry_price;
            let add_notional = fill.size * fill.price;
            let new_size = existing.size + fill.size;
            existing.entry_price = (old_notional + add_notional) / new_size;
            existing.size = new_size;
            existing.pyramid_layers += 1;
            existing.signal_ids.push(signal_id.to_string());
            info!(
                symbol = %existing.symbol,
                size = %existing.size,
                entry = %existing.entry_price,
                layers = existing.pyramid_layers,
                "position pyramided"
            );
            existing.clone()
        } else {
            let position = Position {
                symbol: intent.symbol.clone(),
                direction: intent.direction,
                size: fill.size,
                entry_price: fill.price,
                stop_loss: intent.stop_loss,
                take_profits: intent.take_profits.clone(),
                opened_at: Utc::now(),
                phase_at_entry: phase,
                regime_at_entry: intent.regime.clone(),
                pyramid_layers: 1,
                layer_size: fill.size,
                signal_ids: vec![signal_id.to_string()],
            };
            info!(
                symbol = %position.symbol,
                direction = %position.direction,
                size = %position.size,
                entry = %position.entry_price,
                "position opened"
            );
            inner.positions.insert(intent.symbol.clone(), position.clone());
            position
        };

        if let Some(i) = inner.intents.get_mut(signal_id) {
            i.status = IntentStatus::Executed;
        }

        Ok(ConfirmResult::Executed(position))
    }

    /// Move an intent to REJECTED with a reason. Terminal intents are left
    /// untouched (a rejected or executed intent never re-opens).
    pub fn reject_intent(&self, signal_id: &str, reason: &str) {
        let mut inner = self.inner.write();
        if let Some(intent) = inner.intents.get_mut(signal_id) {
            if !intent.status.is_terminal() {
                intent.status = IntentStatus::Rejected;
                intent.rejection_reason = Some(reason.to_string());
                info!(signal_id, reason, "intent REJECTED");
            }
        }
    }

    pub fn intent(&self, signal_id: &str) -> Option<Intent> {
        self.inner.read().intents.get(signal_id).cloned()
    }

    // -------------------------------------------------------------------------
    // Position closing
    // -------------------------------------------------------------------------

    /// Fully close the position on `symbol` and produce the trade record.
    pub fn close_position(
        &self,
        symbol: &str,
        exit_price: Decimal,
        reason: CloseReason,
    ) -> Result<TradeRecord, EngineError> {
        let mut inner = self.inner.write();
        let position = inner.positions.remove(symbol).ok_or_else(|| {
            EngineError::validation(
                codes::NO_OPEN_POSITION,
                format!("no open position on {symbol}"),
            )
        })?;

        let record = Self::make_record(&position, exit_price, position.size, reason);
        info!(
            symbol,
            exit = %exit_price,
            pnl = %record.pnl,
            reason = %record.reason,
            "position closed"
        );
        Self::push_trade(&mut inner, record.clone());
        Ok(record)
    }

    /// Close part of a position. `close_size` must be strictly between zero
    /// and the open size; the volume-weighted entry price is unchanged.
    pub fn close_partial_position(
        &self,
        symbol: &str,
        exit_price: Decimal,
        close_size: Decimal,
        reason: CloseReason,
    ) -> Result<TradeRecord, EngineError> {
        let mut inner = self.inner.write();
        let position = inner.positions.get_mut(symbol).ok_or_else(|| {
            EngineError::validation(
                codes::NO_OPEN_POSITION,
                format!("no open position on {symbol}"),
            )
        })?;

        if close_size <= Decimal::ZERO || close_size >= position.size {
            return Err(EngineError::validation(
                codes::INVALID_PARTIAL_CLOSE,
                format!(
                    "partial close size {close_size} must be in (0, {})",
                    position.size
                ),
            ));
        }

        position.size -= close_size;
        let record = Self::make_record(position, exit_price, close_size, reason);
        info!(
            symbol,
            closed = %close_size,
            remaining = %position.size,
            pnl = %record.pnl,
            reason = %record.reason,
            "partial close"
        );
        Self::push_trade(&mut inner, record.clone());
        Ok(record)
    }

    /// Batch flatten used by the safety paths. `price_fn` supplies the exit
    /// price per symbol; positions with no price fall back to their entry
    /// (zero P&L — better than blocking an emergency flatten).
    pub fn close_all_positions<F>(&self, price_fn: F, reason: CloseReason) -> Vec<TradeRecord>
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        let mut inner = self.inner.write();
        let symbols: Vec<String> = inner.positions.keys().cloned().collect();
        let mut records = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            if let Some(position) = inner.positions.remove(&symbol) {
                let exit = price_fn(&symbol).unwrap_or(position.entry_price);
                let record = Self::make_record(&position, exit, position.size, reason);
                warn!(
                    symbol = %symbol,
                    exit = %exit,
                    pnl = %record.pnl,
                    reason = %record.reason,
                    "position flattened"
                );
                Self::push_trade(&mut inner, record.clone());
                records.push(record);
            }
        }
        records
    }

    /// A close-style signal with no open position is a zombie: acknowledged
    /// and ignored rather than failed.
    pub fn is_zombie_signal(&self, symbol: &str, signal_id: &str) -> bool {
        let zombie = !self.inner.read().positions.contains_key(symbol);
        if zombie {
            debug!(symbol, signal_id, "zombie close signal — no open position");
        }
        zombie
    }

    // -------------------------------------------------------------------------
    // Pyramid monitor support
    // -------------------------------------------------------------------------

    /// Add a monitor-driven pyramid layer. Returns the updated position and
    /// whether the auto-trail (stop to VWAP entry on the 2nd layer) fired.
    pub fn add_pyramid_layer(
        &self,
        symbol: &str,
        fill_price: Decimal,
        fill_size: Decimal,
    ) -> Result<(Position, bool), EngineError> {
        let mut inner = self.inner.write();
        let position = inner.positions.get_mut(symbol).ok_or_else(|| {
            EngineError::validation(
                codes::NO_OPEN_POSITION,
                format!("no open position on {symbol}"),
            )
        })?;

        if position.pyramid_layers >= MAX_PYRAMID_LAYERS {
            return Err(EngineError::business(
                codes::MAX_PYRAMID_LAYERS,
                format!("{symbol} already at {MAX_PYRAMID_LAYERS} layers"),
            ));
        }

        let old_notional = position.size * position.entry_price;
        let new_size = position.size + fill_size;
        position.entry_price = (old_notional + fill_size * fill_price) / new_size;
        position.size = new_size;
        position.pyramid_layers += 1;

        // Auto-trail: once the 2nd layer is on, the stop moves to the
        // volume-weighted average entry.
        let auto_trailed = position.pyramid_layers == 2;
        if auto_trailed {
            position.stop_loss = position.entry_price;
        }

        info!(
            symbol,
            layers = position.pyramid_layers,
            entry = %position.entry_price,
            size = %position.size,
            auto_trailed,
            "pyramid layer added"
        );

        Ok((position.clone(), auto_trailed))
    }

    /// Update the stop on an open position (e.g. broker-confirmed trail).
    pub fn update_stop(&self, symbol: &str, stop: Decimal) -> Result<(), EngineError> {
        let mut inner = self.inner.write();
        let position = inner.positions.get_mut(symbol).ok_or_else(|| {
            EngineError::validation(
                codes::NO_OPEN_POSITION,
                format!("no open position on {symbol}"),
            )
        })?;
        position.stop_loss = stop;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries & snapshot
    // -------------------------------------------------------------------------

    pub fn open_positions(&self) -> Vec<Position> {
        self.inner.read().positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn open_position_count(&self) -> usize {
        self.inner.read().positions.len()
    }

    pub fn recent_trades(&self, count: usize) -> Vec<TradeRecord> {
        let inner = self.inner.read();
        inner.trades.iter().rev().take(count).cloned().collect()
    }

    pub fn pending_intent_count(&self) -> usize {
        self.inner
            .read()
            .intents
            .values()
            .filter(|i| i.status == IntentStatus::Pending)
            .count()
    }

    /// Serializable image of the full state.
    pub fn snapshot(&self) -> ShadowSnapshot {
        let inner = self.inner.read();
        ShadowSnapshot {
            intents: inner.intents.values().cloned().collect(),
            positions: inner.positions.values().cloned().collect(),
            trades: inner.trades.clone(),
        }
    }

    /// Rebuild from a snapshot (intent TTLs restart from now).
    pub fn restore(snapshot: ShadowSnapshot, intent_ttl_ms: u64) -> Self {
        let state = Self::new(intent_ttl_ms);
        {
            let mut inner = state.inner.write();
            for intent in snapshot.intents {
                inner.intents.insert(intent.signal_id.clone(), intent);
            }
            for position in snapshot.positions {
                inner.positions.insert(position.symbol.clone(), position);
            }
            inner.trades = snapshot.trades;
        }
        state
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn gc_expired(inner: &mut Inner, ttl: Duration) {
        let before = inner.intents.len();
        inner.intents.retain(|_, intent| {
            intent.status != IntentStatus::Pending || intent.created_at.elapsed() <= ttl
        });
        let evicted = before - inner.intents.len();
        if evicted > 0 {
            debug!(evicted, "expired PENDING intents garbage-collected");
        }
    }

    fn push_trade(inner: &mut Inner, record: TradeRecord) {
        inner.trades.push(record);
        if inner.trades.len() > MAX_TRADE_HISTORY {
            let excess = inner.trades.len() - MAX_TRADE_HISTORY;
            inner.trades.drain(..excess);
        }
    }

    fn make_record(
        position: &Position,
        exit_price: Decimal,
        size: Decimal,
        reason: CloseReason,
    ) -> TradeRecord {
        let pnl = match position.direction {
            Direction::Long => (exit_price - position.entry_price) * size,
            Direction::Short => (position.entry_price - exit_price) * size,
        };
        let pnl_pct = if position.entry_price > Decimal::ZERO {
            let signed = match position.direction {
                Direction::Long => (exit_price - position.entry_price) / position.entry_price,
                Direction::Short => (position.entry_price - exit_price) / position.entry_price,
            };
            (signed * Decimal::from(100)).to_f64().unwrap_or(0.0)
        } else {
            0.0
        };

        TradeRecord {
            signal_id: position
                .signal_ids
                .first()
                .cloned()
                .unwrap_or_default(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            size,
            entry_price: position.entry_price,
            exit_price,
            pnl,
            pnl_pct,
            reason: reason.to_string(),
            closed_at: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_intent(signal_id: &str, symbol: &str, direction: Direction, size: Decimal) -> NewIntent {
        NewIntent {
            signal_id: signal_id.to_string(),
            symbol: symbol.to_string(),
            direction,
            size,
            entry_zone: vec![dec!(50000)],
            stop_loss: dec!(49500),
            take_profits: vec![dec!(50500), dec!(51000), dec!(52000)],
            regime: None,
            signal_class: SignalClass::Scalp,
            alpha_half_life_ms: None,
        }
    }

    #[test]
    fn intent_lifecycle_pending_to_executed() {
        let shadow = ShadowState::new(300_000);
        let intent = shadow
            .process_intent(new_intent("titan_BTCUSDT_100_15", "BTCUSDT", Direction::Long, dec!(0.1)))
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);

        let validated = shadow.validate_intent("titan_BTCUSDT_100_15").unwrap();
        assert_eq!(validated.status, IntentStatus::Validated);

        let result = shadow
            .confirm_execution("titan_BTCUSDT_100_15", Fill::filled(dec!(50000), dec!(0.1)), 1)
            .unwrap();
        let position = match result {
            ConfirmResult::Executed(p) => p,
            ConfirmResult::Rejected => panic!("expected execution"),
        };
        assert_eq!(position.size, dec!(0.1));
        assert_eq!(position.entry_price, dec!(50000));
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.phase_at_entry, 1);
        assert_eq!(shadow.intent("titan_BTCUSDT_100_15").unwrap().status, IntentStatus::Executed);
    }

    #[test]
    fn process_intent_is_idempotent() {
        let shadow = ShadowState::new(300_000);
        let a = shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(0.1)))
            .unwrap();
        shadow.validate_intent("titan_BTCUSDT_1_15").unwrap();

        // Resubmission returns the tracked intent, not a reset one.
        let b = shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(0.5)))
            .unwrap();
        assert_eq!(b.status, IntentStatus::Validated);
        assert_eq!(b.size, a.size);
    }

    #[test]
    fn non_positive_size_rejected() {
        let shadow = ShadowState::new(300_000);
        let err = shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(0)))
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_PAYLOAD);
    }

    #[test]
    fn unfilled_confirm_rejects_intent() {
        let shadow = ShadowState::new(300_000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_2_15", "BTCUSDT", Direction::Long, dec!(0.1)))
            .unwrap();
        let result = shadow
            .confirm_execution("titan_BTCUSDT_2_15", Fill::missed(), 1)
            .unwrap();
        assert!(matches!(result, ConfirmResult::Rejected));
        assert_eq!(
            shadow.intent("titan_BTCUSDT_2_15").unwrap().status,
            IntentStatus::Rejected
        );
        assert_eq!(shadow.open_position_count(), 0);

        // A rejected intent never re-opens.
        let err = shadow
            .confirm_execution("titan_BTCUSDT_2_15", Fill::filled(dec!(50000), dec!(0.1)), 1)
            .unwrap_err();
        assert_eq!(err.code(), codes::INTENT_ALREADY_TERMINAL);
    }

    #[test]
    fn pyramiding_volume_weights_the_entry() {
        let shadow = ShadowState::new(300_000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(50000), dec!(1)), 2)
            .unwrap();

        shadow
            .process_intent(new_intent("titan_BTCUSDT_2_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        let result = shadow
            .confirm_execution("titan_BTCUSDT_2_15", Fill::filled(dec!(51000), dec!(1)), 2)
            .unwrap();

        let position = match result {
            ConfirmResult::Executed(p) => p,
            _ => panic!(),
        };
        // (1·50000 + 1·51000) / 2 = 50500, exactly.
        assert_eq!(position.entry_price, dec!(50500));
        assert_eq!(position.size, dec!(2));
        assert_eq!(position.pyramid_layers, 2);
        assert_eq!(position.signal_ids.len(), 2);
        // Still exactly one position for the symbol.
        assert_eq!(shadow.open_position_count(), 1);
    }

    #[test]
    fn opposite_direction_confirm_is_a_conflict() {
        let shadow = ShadowState::new(300_000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(50000), dec!(1)), 1)
            .unwrap();

        shadow
            .process_intent(new_intent("titan_BTCUSDT_2_15", "BTCUSDT", Direction::Short, dec!(1)))
            .unwrap();
        let err = shadow
            .confirm_execution("titan_BTCUSDT_2_15", Fill::filled(dec!(50000), dec!(1)), 1)
            .unwrap_err();
        assert_eq!(err.code(), codes::POSITION_SIDE_CONFLICT);
    }

    #[test]
    fn long_and_short_pnl_signs() {
        let shadow = ShadowState::new(300_000);

        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(0.1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(50000), dec!(0.1)), 1)
            .unwrap();
        let record = shadow
            .close_position("BTCUSDT", dec!(51000), CloseReason::TakeProfit(1))
            .unwrap();
        // LONG: (exit − entry)·size = 1000 · 0.1 = 100
        assert_eq!(record.pnl, dec!(100.0));
        assert!((record.pnl_pct - 2.0).abs() < 1e-9);
        assert_eq!(record.reason, "TP1");

        shadow
            .process_intent(new_intent("titan_ETHUSDT_1_15", "ETHUSDT", Direction::Short, dec!(2)))
            .unwrap();
        shadow
            .confirm_execution("titan_ETHUSDT_1_15", Fill::filled(dec!(3000), dec!(2)), 1)
            .unwrap();
        let record = shadow
            .close_position("ETHUSDT", dec!(2900), CloseReason::Stop)
            .unwrap();
        // SHORT: (entry − exit)·size = 100 · 2 = 200
        assert_eq!(record.pnl, dec!(200));
        assert!((record.pnl_pct - (100.0 / 3000.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn partial_close_keeps_entry_price() {
        let shadow = ShadowState::new(300_000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(50000), dec!(1)), 2)
            .unwrap();

        let record = shadow
            .close_partial_position("BTCUSDT", dec!(50500), dec!(0.4), CloseReason::TakeProfit(1))
            .unwrap();
        assert_eq!(record.size, dec!(0.4));
        assert_eq!(record.pnl, dec!(200.0));

        let position = shadow.position("BTCUSDT").unwrap();
        assert_eq!(position.size, dec!(0.6));
        assert_eq!(position.entry_price, dec!(50000));

        // Degenerate sizes are refused.
        assert_eq!(
            shadow
                .close_partial_position("BTCUSDT", dec!(50500), dec!(0.6), CloseReason::Manual)
                .unwrap_err()
                .code(),
            codes::INVALID_PARTIAL_CLOSE
        );
        assert_eq!(
            shadow
                .close_partial_position("BTCUSDT", dec!(50500), dec!(0), CloseReason::Manual)
                .unwrap_err()
                .code(),
            codes::INVALID_PARTIAL_CLOSE
        );
    }

    #[test]
    fn close_all_flattens_every_position() {
        let shadow = ShadowState::new(300_000);
        for (id, symbol) in [("titan_BTCUSDT_1_15", "BTCUSDT"), ("titan_ETHUSDT_1_15", "ETHUSDT")] {
            shadow
                .process_intent(new_intent(id, symbol, Direction::Long, dec!(1)))
                .unwrap();
            shadow
                .confirm_execution(id, Fill::filled(dec!(100), dec!(1)), 1)
                .unwrap();
        }

        let records = shadow.close_all_positions(
            |symbol| if symbol == "BTCUSDT" { Some(dec!(110)) } else { None },
            CloseReason::DeadMansSwitch,
        );
        assert_eq!(records.len(), 2);
        assert_eq!(shadow.open_position_count(), 0);
        assert!(records.iter().all(|r| r.reason == "DEAD_MANS_SWITCH"));

        // ETHUSDT had no price — closed at entry, zero P&L.
        let eth = records.iter().find(|r| r.symbol == "ETHUSDT").unwrap();
        assert_eq!(eth.pnl, Decimal::ZERO);
        let btc = records.iter().find(|r| r.symbol == "BTCUSDT").unwrap();
        assert_eq!(btc.pnl, dec!(10));
    }

    #[test]
    fn zombie_signal_detection() {
        let shadow = ShadowState::new(300_000);
        assert!(shadow.is_zombie_signal("BTCUSDT", "titan_BTCUSDT_9_15"));

        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(100), dec!(1)), 1)
            .unwrap();
        assert!(!shadow.is_zombie_signal("BTCUSDT", "titan_BTCUSDT_9_15"));
    }

    #[test]
    fn pyramid_layer_cap_and_auto_trail() {
        let shadow = ShadowState::new(300_000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(50000), dec!(1)), 2)
            .unwrap();

        // 2nd layer: stop auto-trails to the VWAP entry.
        let (position, trailed) = shadow
            .add_pyramid_layer("BTCUSDT", dec!(51000), dec!(1))
            .unwrap();
        assert!(trailed);
        assert_eq!(position.entry_price, dec!(50500));
        assert_eq!(position.stop_loss, dec!(50500));

        let (_, trailed) = shadow.add_pyramid_layer("BTCUSDT", dec!(52000), dec!(1)).unwrap();
        assert!(!trailed);
        let (position, _) = shadow.add_pyramid_layer("BTCUSDT", dec!(53000), dec!(1)).unwrap();
        assert_eq!(position.pyramid_layers, 4);

        let err = shadow
            .add_pyramid_layer("BTCUSDT", dec!(54000), dec!(1))
            .unwrap_err();
        assert_eq!(err.code(), codes::MAX_PYRAMID_LAYERS);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_intents_are_garbage_collected() {
        let shadow = ShadowState::new(1000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        // Executed intents survive GC; pending ones do not.
        shadow
            .process_intent(new_intent("titan_ETHUSDT_1_15", "ETHUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_ETHUSDT_1_15", Fill::filled(dec!(100), dec!(1)), 1)
            .unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        // GC runs on the next process_intent.
        shadow
            .process_intent(new_intent("titan_SOLUSDT_1_15", "SOLUSDT", Direction::Long, dec!(1)))
            .unwrap();

        assert!(shadow.intent("titan_BTCUSDT_1_15").is_none());
        assert!(shadow.intent("titan_ETHUSDT_1_15").is_some());
    }

    #[test]
    fn snapshot_round_trip_preserves_entry_math() {
        let shadow = ShadowState::new(300_000);
        shadow
            .process_intent(new_intent("titan_BTCUSDT_1_15", "BTCUSDT", Direction::Long, dec!(1)))
            .unwrap();
        shadow
            .confirm_execution("titan_BTCUSDT_1_15", Fill::filled(dec!(50000), dec!(1)), 2)
            .unwrap();
        shadow.add_pyramid_layer("BTCUSDT", dec!(51000), dec!(1)).unwrap();

        let snapshot = shadow.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: ShadowSnapshot = serde_json::from_str(&json).unwrap();
        let restored = ShadowState::restore(decoded, 300_000);

        let position = restored.position("BTCUSDT").unwrap();
        assert_eq!(position.entry_price, dec!(50500));
        assert_eq!(position.size, dec!(2));
        assert_eq!(position.pyramid_layers, 2);
        assert_eq!(restored.intent("titan_BTCUSDT_1_15").unwrap().status, IntentStatus::Executed);
    }
}
