// =============================================================================
// Pyramid monitor — add to winners, kill on regime flip (Phase 2 only)
// =============================================================================
//
// Periodic sweep over open positions:
//   - price 2% beyond the (volume-weighted) entry in our favour AND the
//     symbol's regime is Risk-On → add a layer of the original size, max 4.
//   - the 2nd layer moves the stop to the VWAP entry (auto-trail), confirmed
//     to the broker.
//   - regime flips Risk-Off → close the whole stack with REGIME_KILL.
//
// The monitor reads regime state from the signal stream, not from any local
// inference.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::broker::gateway::BrokerGateway;
use crate::broker::OrderRequest;
use crate::events::{EngineEvent, EventBus};
use crate::market_data::OrderBookCache;
use crate::phase::PhaseManager;
use crate::safety::drift::DriftGuard;
use crate::safety::gates::SafetyGates;
use crate::shadow::{Position, ShadowState, MAX_PYRAMID_LAYERS};
use crate::types::{CloseReason, Direction, RegimeVector};

/// Price advance (fraction of entry) that earns another layer.
const LAYER_ADVANCE: Decimal = dec!(0.02);

/// Latest regime vector per symbol, fed by the signal stream.
#[derive(Default)]
pub struct RegimeBook {
    regimes: RwLock<HashMap<String, RegimeVector>>,
}

impl RegimeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from an inbound signal; emits REGIME_CHANGE on a risk flip.
    pub fn update(&self, symbol: &str, regime: RegimeVector, events: &EventBus) {
        let mut regimes = self.regimes.write();
        let flipped = regimes
            .get(symbol)
            .map(|old| old.is_risk_on() != regime.is_risk_on())
            .unwrap_or(true);
        if flipped {
            events.publish(EngineEvent::RegimeChange {
                symbol: symbol.to_string(),
                risk_on: regime.is_risk_on(),
            });
        }
        regimes.insert(symbol.to_string(), regime);
    }

    pub fn get(&self, symbol: &str) -> Option<RegimeVector> {
        self.regimes.read().get(symbol).cloned()
    }

    pub fn is_risk_on(&self, symbol: &str) -> bool {
        self.regimes
            .read()
            .get(symbol)
            .map(|r| r.is_risk_on())
            .unwrap_or(false)
    }
}

pub struct PyramidMonitor {
    shadow: Arc<ShadowState>,
    gateway: Arc<BrokerGateway>,
    cache: Arc<OrderBookCache>,
    phase: Arc<PhaseManager>,
    regimes: Arc<RegimeBook>,
    gates: Arc<SafetyGates>,
    drift: Arc<DriftGuard>,
    events: EventBus,
    sweep_interval: Duration,
}

impl PyramidMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shadow: Arc<ShadowState>,
        gateway: Arc<BrokerGateway>,
        cache: Arc<OrderBookCache>,
        phase: Arc<PhaseManager>,
        regimes: Arc<RegimeBook>,
        gates: Arc<SafetyGates>,
        drift: Arc<DriftGuard>,
        events: EventBus,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            shadow,
            gateway,
            cache,
            phase,
            regimes,
            gates,
            drift,
            events,
            sweep_interval,
        }
    }

    /// One sweep over all open positions.
    pub async fn sweep_once(&self) {
        if !self.phase.current().pyramiding_allowed {
            return;
        }

        for position in self.shadow.open_positions() {
            // Regime flip closes the whole stack regardless of layer count.
            if !self.regimes.is_risk_on(&position.symbol) {
                self.regime_kill(&position).await;
                continue;
            }

            if position.pyramid_layers >= MAX_PYRAMID_LAYERS {
                continue;
            }

            let mark = match self.cache.mid_price(&position.symbol) {
                Some(p) => p,
                None => continue,
            };

            if Self::advanced_enough(&position, mark) {
                self.add_layer(&position, mark).await;
            }
        }
    }

    fn advanced_enough(position: &Position, mark: Decimal) -> bool {
        let advance = position.entry_price * LAYER_ADVANCE;
        match position.direction {
            Direction::Long => mark >= position.entry_price + advance,
            Direction::Short => mark <= position.entry_price - advance,
        }
    }

    async fn add_layer(&self, position: &Position, mark: Decimal) {
        let request = OrderRequest::market(
            position
                .signal_ids
                .first()
                .map(String::as_str)
                .unwrap_or("pyramid"),
            &position.symbol,
            position.direction.entry_side(),
            position.layer_size,
        );

        let ack = match self.gateway.send_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "pyramid layer order failed");
                return;
            }
        };
        if ack.filled_size <= Decimal::ZERO {
            debug!(symbol = %position.symbol, "pyramid layer order not filled");
            return;
        }
        let fill_price = ack.avg_fill_price.unwrap_or(mark);

        match self
            .shadow
            .add_pyramid_layer(&position.symbol, fill_price, ack.filled_size)
        {
            Ok((updated, auto_trailed)) => {
                info!(
                    symbol = %updated.symbol,
                    layers = updated.pyramid_layers,
                    entry = %updated.entry_price,
                    "pyramid layer filled"
                );
                self.events.publish(EngineEvent::PositionUpdate {
                    symbol: updated.symbol.clone(),
                    open: true,
                });
                if auto_trailed {
                    if let Err(e) = self
                        .gateway
                        .update_stop_loss(&updated.symbol, updated.stop_loss)
                        .await
                    {
                        warn!(symbol = %updated.symbol, error = %e, "auto-trail stop update failed");
                    }
                }
            }
            Err(e) => warn!(symbol = %position.symbol, error = %e, "pyramid bookkeeping failed"),
        }
    }

    async fn regime_kill(&self, position: &Position) {
        let exit = self
            .cache
            .mid_price(&position.symbol)
            .unwrap_or(position.entry_price);

        info!(symbol = %position.symbol, "regime flipped Risk-Off — closing stack");

        match self
            .shadow
            .close_position(&position.symbol, exit, CloseReason::RegimeKill)
        {
            Ok(record) => {
                self.phase.apply_pnl(record.pnl);
                self.gates.record_trade(record.pnl_pct);
                self.drift.record_pnl(record.pnl);
                self.events.publish(EngineEvent::PositionUpdate {
                    symbol: record.symbol.clone(),
                    open: false,
                });
            }
            Err(e) => warn!(symbol = %position.symbol, error = %e, "regime kill bookkeeping failed"),
        }

        if let Err(e) = self.gateway.close_position(&position.symbol).await {
            warn!(symbol = %position.symbol, error = %e, "broker close failed during regime kill");
        }
    }

    /// Background loop; spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        info!(interval = ?self.sweep_interval, "pyramid monitor started");
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }
}
