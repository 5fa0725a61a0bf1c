// =============================================================================
// Limit-or-Kill — Phase 1 maker entry
// =============================================================================
//
// Post-only LIMIT at the touch (bid for buys, ask for sells), then poll the
// order every 100 ms for exactly 5 s:
//   FILLED           — done.
//   partial at kill  — cancel the remainder, keep the partial.
//   nothing at kill  — cancel and report MISSED_ENTRY with how far the book
//                      ran away (bid_at_entry vs current_bid).
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker::gateway::BrokerGateway;
use crate::broker::OrderRequest;
use crate::events::{EngineEvent, EventBus};
use crate::market_data::{OrderBookCache, DEFAULT_OBI_DEPTH};
use crate::shadow::Fill;
use crate::types::OrderSide;

use super::{CancelToken, ExecOutcome, ExecutionReport, ExecutionStrategy, MarketConditions, StrategyParams};

/// Poll cadence for order status.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Total time the resting order is given before the kill.
const KILL_AFTER: Duration = Duration::from_millis(5000);

pub struct LimitOrKill {
    cache: Arc<OrderBookCache>,
    gateway: Arc<BrokerGateway>,
    events: EventBus,
}

impl LimitOrKill {
    pub fn new(cache: Arc<OrderBookCache>, gateway: Arc<BrokerGateway>, events: EventBus) -> Self {
        Self {
            cache,
            gateway,
            events,
        }
    }

    fn conditions(&self, symbol: &str) -> MarketConditions {
        MarketConditions {
            best_bid: self.cache.best_bid(symbol),
            best_ask: self.cache.best_ask(symbol),
            spread_pct: self.cache.spread_pct(symbol),
            obi: self.cache.obi(symbol, DEFAULT_OBI_DEPTH),
        }
    }

    fn emit_fill(&self, params: &StrategyParams, price: Decimal, size: Decimal) {
        self.events.publish(EngineEvent::OrderFilled {
            signal_id: params.signal_id.clone(),
            symbol: params.symbol.clone(),
            side: params.side,
            price,
            size,
        });
    }
}

#[async_trait]
impl ExecutionStrategy for LimitOrKill {
    fn name(&self) -> &'static str {
        "limit_or_kill"
    }

    async fn execute(&self, params: StrategyParams, cancel: &CancelToken) -> ExecutionReport {
        let entry_price = match params.side {
            OrderSide::Buy => self.cache.best_bid(&params.symbol),
            OrderSide::Sell => self.cache.best_ask(&params.symbol),
        };
        let entry_price = match entry_price {
            Some(p) => p,
            None => {
                let mut report = ExecutionReport::new(&params.signal_id, ExecOutcome::Error);
                report.reason = Some("ERROR: no book for symbol".to_string());
                return report;
            }
        };
        let bid_at_entry = self.cache.best_bid(&params.symbol);

        let request = OrderRequest::limit(
            &params.signal_id,
            &params.symbol,
            params.side,
            params.size,
            entry_price,
            true, // post-only: this strategy never crosses the spread
        );

        info!(
            signal_id = %params.signal_id,
            symbol = %params.symbol,
            side = %params.side,
            price = %entry_price,
            size = %params.size,
            "limit-or-kill: posting at the touch"
        );

        let started = Instant::now();
        let ack = match self.gateway.send_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                let mut report = ExecutionReport::new(&params.signal_id, ExecOutcome::Error);
                report.reason = Some(format!("ERROR: {}", e.message()));
                report.market_conditions = Some(self.conditions(&params.symbol));
                return report;
            }
        };

        let mut last = ack;
        let deadline = started + KILL_AFTER;

        while !last.is_filled() && Instant::now() < deadline {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self
                        .gateway
                        .cancel_order(&params.signal_id, &params.symbol, &last.order_id)
                        .await;
                    let mut report = ExecutionReport::new(&params.signal_id, ExecOutcome::Cancelled);
                    report.chase_time_ms = started.elapsed().as_millis() as u64;
                    return report;
                }
                _ = sleep(POLL_INTERVAL) => {}
            }

            match self
                .gateway
                .get_order_status(&params.symbol, &last.order_id)
                .await
            {
                Ok(status) => last = status,
                Err(e) => {
                    warn!(error = %e, "limit-or-kill: status poll failed");
                }
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;

        if last.is_filled() {
            let price = last.avg_fill_price.unwrap_or(entry_price);
            self.emit_fill(&params, price, last.filled_size);
            let mut report = ExecutionReport::new(&params.signal_id, ExecOutcome::Filled);
            report.fill = Some(Fill::filled(price, last.filled_size));
            report.chase_time_ms = elapsed_ms;
            report.market_conditions = Some(self.conditions(&params.symbol));
            return report;
        }

        // Kill time: cancel whatever is left.
        if let Err(e) = self
            .gateway
            .cancel_order(&params.signal_id, &params.symbol, &last.order_id)
            .await
        {
            warn!(error = %e, "limit-or-kill: cancel at kill failed");
        }

        if last.has_partial() {
            let price = last.avg_fill_price.unwrap_or(entry_price);
            debug!(
                signal_id = %params.signal_id,
                filled = %last.filled_size,
                "limit-or-kill: keeping partial at kill"
            );
            self.emit_fill(&params, price, last.filled_size);
            let mut report = ExecutionReport::new(&params.signal_id, ExecOutcome::PartiallyFilled);
            report.fill = Some(Fill::filled(price, last.filled_size));
            report.chase_time_ms = elapsed_ms;
            report.market_conditions = Some(self.conditions(&params.symbol));
            return report;
        }

        // Nothing filled: report how far the market moved away.
        let current_bid = self.cache.best_bid(&params.symbol);
        let movement_pct = match (bid_at_entry, current_bid) {
            (Some(entry), Some(now)) if entry > Decimal::ZERO => {
                ((now - entry) / entry * Decimal::from(100)).to_f64()
            }
            _ => None,
        };

        let mut report = ExecutionReport::new(&params.signal_id, ExecOutcome::MissedEntry);
        report.reason = Some("no fill within kill window".to_string());
        report.chase_time_ms = elapsed_ms;
        report.market_conditions = Some(self.conditions(&params.symbol));
        report.bid_at_entry = bid_at_entry;
        report.current_bid = current_bid;
        report.movement_pct = movement_pct;
        report
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::gateway::GatewayConfig;
    use crate::broker::paper::{FillMode, PaperAdapter};
    use crate::ratelimit::RateLimiter;
    use crate::types::SignalClass;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    struct Rig {
        strategy: LimitOrKill,
        paper: Arc<PaperAdapter>,
        cache: Arc<OrderBookCache>,
        events: EventBus,
    }

    fn rig(mode: FillMode) -> Rig {
        let events = EventBus::new();
        let paper = Arc::new(PaperAdapter::new(mode));
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        let gateway = Arc::new(BrokerGateway::new(
            paper.clone(),
            limiter,
            events.clone(),
            GatewayConfig::default(),
        ));
        let cache = Arc::new(OrderBookCache::new(100));
        cache.set_feed_connected(true);
        cache.apply_snapshot(
            "BTCUSDT",
            vec![(dec!(50000), dec!(5))],
            vec![(dec!(50010), dec!(5))],
        );
        Rig {
            strategy: LimitOrKill::new(cache.clone(), gateway, events.clone()),
            paper,
            cache,
            events,
        }
    }

    fn params() -> StrategyParams {
        StrategyParams {
            signal_id: "titan_BTCUSDT_100_15".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            size: dec!(0.1),
            signal_class: SignalClass::Scalp,
            alpha_half_life_ms: None,
            urgency_score: None,
            post_only: true,
            tick_size: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fills_at_the_bid_and_emits() {
        let rig = rig(FillMode::ImmediateFill);
        let mut rx = rig.events.subscribe();
        let cancel = CancelToken::new();

        let report = rig.strategy.execute(params(), &cancel).await;
        assert!(report.success);
        assert_eq!(report.outcome, ExecOutcome::Filled);
        let fill = report.fill.unwrap();
        // Buys post at the bid.
        assert_eq!(fill.price, dec!(50000));
        assert_eq!(fill.size, dec!(0.1));

        let mut saw_fill_event = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::OrderFilled { price, .. } = ev {
                assert_eq!(price, dec!(50000));
                saw_fill_event = true;
            }
        }
        assert!(saw_fill_event);
    }

    #[tokio::test(start_paused = true)]
    async fn fill_during_polling_succeeds() {
        let rig = rig(FillMode::FillAfterPolls(3));
        let cancel = CancelToken::new();
        let report = rig.strategy.execute(params(), &cancel).await;
        assert_eq!(report.outcome, ExecOutcome::Filled);
        // Three polls at 100 ms.
        assert!(report.chase_time_ms >= 300);
        assert!(report.chase_time_ms < 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn no_fill_is_killed_with_movement_diagnostics() {
        let rig = rig(FillMode::NeverFill);
        let cancel = CancelToken::new();

        rig.cache.apply_snapshot(
            "BTCUSDT",
            vec![(dec!(50100), dec!(5))],
            vec![(dec!(50110), dec!(5))],
        );
        // Market runs away while the order rests.
        let handle = {
            let strategy_cache = rig.cache.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(1000)).await;
                strategy_cache.apply_snapshot(
                    "BTCUSDT",
                    vec![(dec!(50200), dec!(5))],
                    vec![(dec!(50210), dec!(5))],
                );
            })
        };

        let report = rig.strategy.execute(params(), &cancel).await;
        handle.await.unwrap();

        assert!(!report.success);
        assert_eq!(report.outcome, ExecOutcome::MissedEntry);
        assert!(report.chase_time_ms >= 5000);
        assert_eq!(report.bid_at_entry, Some(dec!(50100)));
        assert_eq!(report.current_bid, Some(dec!(50200)));
        let moved = report.movement_pct.unwrap();
        assert!(moved > 0.19 && moved < 0.21, "movement {moved}");
        // The resting order was cancelled.
        assert_eq!(rig.paper.canceled_orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_at_kill_keeps_the_partial() {
        let rig = rig(FillMode::PartialFill(dec!(0.5)));
        let cancel = CancelToken::new();
        let report = rig.strategy.execute(params(), &cancel).await;

        assert!(report.success);
        assert_eq!(report.outcome, ExecOutcome::PartiallyFilled);
        let fill = report.fill.unwrap();
        assert_eq!(fill.size, dec!(0.05));
        // Remainder cancelled.
        assert_eq!(rig.paper.canceled_orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_kills_the_resting_order() {
        let rig = rig(FillMode::NeverFill);
        let cancel = CancelToken::new();
        let strategy_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            strategy_cancel.cancel();
        });

        let report = rig.strategy.execute(params(), &cancel).await;
        handle.await.unwrap();

        assert_eq!(report.outcome, ExecOutcome::Cancelled);
        assert!(report.chase_time_ms < 5000);
        assert_eq!(rig.paper.canceled_orders.load(Ordering::SeqCst), 1);
    }
}
