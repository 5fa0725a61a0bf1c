// =============================================================================
// Limit Chaser — Phase 2 taker entry under an alpha-decay budget
// =============================================================================
//
// Starts at the opposite touch (ask for buys, bid for sells) and re-prices
// one tick more aggressive per interval until one of:
//   FILLED             — an order filled.
//   ALPHA_EXPIRED      — 0.5^(elapsed/half_life) fell below the floor; the
//                        edge is gone, stop paying for it.
//   OBI_WORSENING      — the book started leaning against this side.
//   FILL_TIMEOUT       — max chase time exhausted.
//   MAX_TICKS_EXCEEDED — re-price budget exhausted.
//
// A saturated rate limiter short-circuits the whole dance: one MARKET order.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker::gateway::BrokerGateway;
use crate::broker::{OrderAck, OrderRequest};
use crate::events::{EngineEvent, EventBus};
use crate::market_data::{OrderBookCache, DEFAULT_OBI_DEPTH};
use crate::shadow::Fill;
use crate::types::OrderSide;

use super::{
    remaining_alpha, resolve_alpha_half_life_ms, tick_size_for, CancelToken, ExecOutcome,
    ExecutionReport, ExecutionStrategy, MarketConditions, StrategyParams,
};

/// Tolerance below which an OBI change is noise, not a trend.
const OBI_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct ChaserConfig {
    pub chase_interval: Duration,
    pub max_chase_time: Duration,
    pub max_chase_ticks: u32,
    pub min_alpha_threshold: f64,
}

impl ChaserConfig {
    pub fn from_ms(
        chase_interval_ms: u64,
        max_chase_time_ms: u64,
        max_chase_ticks: u32,
        min_alpha_threshold: f64,
    ) -> Self {
        Self {
            chase_interval: Duration::from_millis(chase_interval_ms),
            max_chase_time: Duration::from_millis(max_chase_time_ms),
            max_chase_ticks,
            min_alpha_threshold,
        }
    }
}

impl Default for ChaserConfig {
    fn default() -> Self {
        Self::from_ms(200, 1000, 5, 0.3)
    }
}

pub struct LimitChaser {
    cache: Arc<OrderBookCache>,
    gateway: Arc<BrokerGateway>,
    events: EventBus,
    config: ChaserConfig,
}

impl LimitChaser {
    pub fn new(
        cache: Arc<OrderBookCache>,
        gateway: Arc<BrokerGateway>,
        events: EventBus,
        config: ChaserConfig,
    ) -> Self {
        Self {
            cache,
            gateway,
            events,
            config,
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

    fn finish(
        &self,
        params: &StrategyParams,
        outcome: ExecOutcome,
        started: Instant,
        ticks: u32,
        alpha: Option<f64>,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::new(&params.signal_id, outcome);
        report.chase_time_ms = started.elapsed().as_millis() as u64;
        report.chase_ticks = ticks;
        report.market_conditions = Some(self.conditions(&params.symbol));
        report.remaining_alpha = alpha;
        report.reason = match outcome {
            ExecOutcome::AlphaExpired => Some("remaining alpha below floor".to_string()),
            ExecOutcome::ObiWorsening => Some("order book turning against entry".to_string()),
            ExecOutcome::FillTimeout => Some("chase time budget exhausted".to_string()),
            ExecOutcome::MaxTicksExceeded => Some("re-price budget exhausted".to_string()),
            _ => None,
        };
        report
    }

    fn filled_report(
        &self,
        params: &StrategyParams,
        ack: &OrderAck,
        price_fallback: Decimal,
        started: Instant,
        ticks: u32,
    ) -> ExecutionReport {
        let price = ack.avg_fill_price.unwrap_or(price_fallback);
        self.emit_fill(params, price, ack.filled_size);
        let mut report = self.finish(params, ExecOutcome::Filled, started, ticks, None);
        report.fill = Some(Fill::filled(price, ack.filled_size));
        report
    }

    async fn cancel_quiet(&self, params: &StrategyParams, order_id: &str) {
        if let Err(e) = self
            .gateway
            .cancel_order(&params.signal_id, &params.symbol, order_id)
            .await
        {
            warn!(error = %e, "limit-chaser: cancel failed");
        }
    }
}

#[async_trait]
impl ExecutionStrategy for LimitChaser {
    fn name(&self) -> &'static str {
        "limit_chaser"
    }

    async fn execute(&self, params: StrategyParams, cancel: &CancelToken) -> ExecutionReport {
        let started = Instant::now();
        let half_life_ms = resolve_alpha_half_life_ms(
            params.signal_class,
            params.alpha_half_life_ms,
            params.urgency_score,
        );

        // Saturated rate limiter: skip the maker dance entirely.
        if self.gateway.limiter().force_market_hint() {
            info!(
                signal_id = %params.signal_id,
                "limit-chaser: rate limiter saturated — going straight to market"
            );
            let request =
                OrderRequest::market(&params.signal_id, &params.symbol, params.side, params.size);
            return match self.gateway.send_order(&request).await {
                Ok(ack) => {
                    let fallback = self.cache.mid_price(&params.symbol).unwrap_or(Decimal::ZERO);
                    self.filled_report(&params, &ack, fallback, started, 0)
                }
                Err(e) => {
                    let mut report = self.finish(&params, ExecOutcome::Error, started, 0, None);
                    report.reason = Some(format!("ERROR: {}", e.message()));
                    report
                }
            };
        }

        // Initial price: the opposite touch.
        let initial_price = match params.side {
            OrderSide::Buy => self.cache.best_ask(&params.symbol),
            OrderSide::Sell => self.cache.best_bid(&params.symbol),
        };
        let mut price = match initial_price {
            Some(p) => p,
            None => {
                let mut report = self.finish(&params, ExecOutcome::Error, started, 0, None);
                report.reason = Some("ERROR: no book for symbol".to_string());
                return report;
            }
        };
        let tick = params.tick_size.unwrap_or_else(|| tick_size_for(price));
        let mut prev_obi = self.cache.obi(&params.symbol, DEFAULT_OBI_DEPTH);

        info!(
            signal_id = %params.signal_id,
            symbol = %params.symbol,
            side = %params.side,
            price = %price,
            tick = %tick,
            half_life_ms,
            "limit-chaser: starting chase"
        );

        let request = OrderRequest::limit(
            &params.signal_id,
            &params.symbol,
            params.side,
            params.size,
            price,
            params.post_only,
        );
        let mut ack = match self.gateway.send_order(&request).await {
            Ok(ack) => ack,
            Err(e) => {
                let mut report = self.finish(&params, ExecOutcome::Error, started, 0, None);
                report.reason = Some(format!("ERROR: {}", e.message()));
                return report;
            }
        };
        if ack.is_filled() {
            return self.filled_report(&params, &ack, price, started, 0);
        }

        let mut ticks_used: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel_quiet(&params, &ack.order_id).await;
                    return self.finish(&params, ExecOutcome::Cancelled, started, ticks_used, None);
                }
                _ = sleep(self.config.chase_interval) => {}
            }

            let elapsed = started.elapsed();

            // Alpha decay: the reason we were chasing may already be gone.
            let alpha = remaining_alpha(elapsed.as_millis() as u64, half_life_ms);
            if alpha < self.config.min_alpha_threshold {
                debug!(signal_id = %params.signal_id, alpha, "alpha expired — abandoning chase");
                self.cancel_quiet(&params, &ack.order_id).await;
                return self.finish(
                    &params,
                    ExecOutcome::AlphaExpired,
                    started,
                    ticks_used,
                    Some(alpha),
                );
            }

            // OBI turning against this side.
            let obi = self.cache.obi(&params.symbol, DEFAULT_OBI_DEPTH);
            if let (Some(prev), Some(now)) = (prev_obi, obi) {
                let worsening = match params.side {
                    OrderSide::Buy => now < prev - OBI_EPSILON,
                    OrderSide::Sell => now > prev + OBI_EPSILON,
                };
                if worsening {
                    debug!(
                        signal_id = %params.signal_id,
                        prev_obi = prev,
                        obi = now,
                        "OBI worsening — abandoning chase"
                    );
                    self.cancel_quiet(&params, &ack.order_id).await;
                    return self.finish(
                        &params,
                        ExecOutcome::ObiWorsening,
                        started,
                        ticks_used,
                        Some(alpha),
                    );
                }
            }
            prev_obi = obi;

            // Did the resting order fill meanwhile?
            match self
                .gateway
                .get_order_status(&params.symbol, &ack.order_id)
                .await
            {
                Ok(status) if status.is_filled() => {
                    return self.filled_report(&params, &status, price, started, ticks_used);
                }
                Ok(status) => ack = status,
                Err(e) => warn!(error = %e, "limit-chaser: status poll failed"),
            }

            // Budgets.
            if elapsed >= self.config.max_chase_time {
                self.cancel_quiet(&params, &ack.order_id).await;
                return self.finish(
                    &params,
                    ExecOutcome::FillTimeout,
                    started,
                    ticks_used,
                    Some(alpha),
                );
            }
            if ticks_used >= self.config.max_chase_ticks {
                self.cancel_quiet(&params, &ack.order_id).await;
                return self.finish(
                    &params,
                    ExecOutcome::MaxTicksExceeded,
                    started,
                    ticks_used,
                    Some(alpha),
                );
            }

            // Re-price one tick more aggressive.
            self.cancel_quiet(&params, &ack.order_id).await;
            price = match params.side {
                OrderSide::Buy => price + tick,
                OrderSide::Sell => price - tick,
            };
            ticks_used += 1;

            let request = OrderRequest::limit(
                &params.signal_id,
                &params.symbol,
                params.side,
                params.size,
                price,
                params.post_only,
            );
            ack = match self.gateway.send_order(&request).await {
                Ok(ack) => ack,
                Err(e) => {
                    let mut report =
                        self.finish(&params, ExecOutcome::Error, started, ticks_used, Some(alpha));
                    report.reason = Some(format!("ERROR: {}", e.message()));
                    return report;
                }
            };
            if ack.is_filled() {
                return self.filled_report(&params, &ack, price, started, ticks_used);
            }
        }
    }
}
