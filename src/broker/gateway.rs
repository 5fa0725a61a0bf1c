// =============================================================================
// Broker gateway — rate-limited, deadline-bounded, retrying order operations
// =============================================================================
//
// Every external call:
//   1. acquires a rate-limiter token (back-pressure is visible to strategies),
//   2. runs under an explicit deadline (exceeded -> TIMEOUT),
//   3. is retried with bounded exponential back-off on transient failure.
//
// Failures surface as `EngineError::Transient` with the error taxonomy code;
// nothing is silently swallowed. Cancel and flatten results are published on
// the event bus for the status feed.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

use crate::error::{codes, EngineError};
use crate::events::{EngineEvent, EventBus};
use crate::ratelimit::RateLimiter;

use super::{Adapter, BrokerPosition, OrderAck, OrderRequest};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline applied to every adapter call.
    pub call_deadline: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base back-off; doubles per retry.
    pub retry_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_deadline: Duration::from_secs(2),
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

pub struct BrokerGateway {
    adapter: Arc<dyn Adapter>,
    limiter: Arc<RateLimiter>,
    events: EventBus,
    config: GatewayConfig,
}

impl BrokerGateway {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        limiter: Arc<RateLimiter>,
        events: EventBus,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapter,
            limiter,
            events,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    pub async fn send_order(&self, request: &OrderRequest) -> Result<OrderAck, EngineError> {
        let result = self.call("send_order", || self.adapter.send_order(request)).await;
        if let Err(e) = &result {
            self.events.publish(EngineEvent::OrderRejected {
                signal_id: request.signal_id.clone(),
                symbol: request.symbol.clone(),
                reason: e.message().to_string(),
            });
        }
        result
    }

    pub async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderAck, EngineError> {
        self.call("get_order_status", || {
            self.adapter.get_order_status(symbol, order_id)
        })
        .await
    }

    pub async fn cancel_order(
        &self,
        signal_id: &str,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderAck, EngineError> {
        let ack = self
            .call("cancel_order", || self.adapter.cancel_order(symbol, order_id))
            .await?;
        self.events.publish(EngineEvent::OrderCanceled {
            signal_id: signal_id.to_string(),
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        });
        Ok(ack)
    }

    pub async fn update_stop_loss(&self, symbol: &str, stop: Decimal) -> Result<(), EngineError> {
        self.call("update_stop_loss", || self.adapter.update_stop_loss(symbol, stop))
            .await
    }

    pub async fn update_take_profit(
        &self,
        symbol: &str,
        take_profits: &[Decimal],
    ) -> Result<(), EngineError> {
        self.call("update_take_profit", || {
            self.adapter.update_take_profit(symbol, take_profits)
        })
        .await
    }

    pub async fn get_positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
        self.call("get_positions", || self.adapter.get_positions()).await
    }

    pub async fn close_position(&self, symbol: &str) -> Result<(), EngineError> {
        self.call("close_position", || self.adapter.close_position(symbol))
            .await
    }

    pub async fn close_all_positions(&self, trigger: &str) -> Result<u32, EngineError> {
        let count = self
            .call("close_all_positions", || self.adapter.close_all_positions())
            .await?;
        self.events.publish(EngineEvent::PositionsFlattened {
            count,
            trigger: trigger.to_string(),
        });
        Ok(count)
    }

    pub async fn test_connection(&self) -> Result<(), EngineError> {
        self.call("test_connection", || self.adapter.test_connection()).await
    }

    // -------------------------------------------------------------------------
    // Retry core
    // -------------------------------------------------------------------------

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire().await;

            let outcome = timeout(self.config.call_deadline, f()).await;
            match outcome {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(op, attempt, "broker call recovered after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(op, attempt, error = %e, "broker call failed");
                    if attempt >= self.config.max_retries {
                        return Err(EngineError::transient(
                            codes::BROKER_ERROR,
                            format!("{op} failed after {} attempts: {e}", attempt + 1),
                        ));
                    }
                }
                Err(_) => {
                    warn!(op, attempt, deadline = ?self.config.call_deadline, "broker call deadline exceeded");
                    if attempt >= self.config.max_retries {
                        return Err(EngineError::transient(
                            codes::TIMEOUT,
                            format!("{op} exceeded {:?} deadline", self.config.call_deadline),
                        ));
                    }
                }
            }

            let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
            attempt += 1;
            sleep(backoff).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::paper::{FillMode, PaperAdapter};
    use crate::broker::OrderState;
    use crate::types::OrderSide;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gateway(adapter: Arc<dyn Adapter>) -> BrokerGateway {
        let events = EventBus::new();
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        BrokerGateway::new(adapter, limiter, events, GatewayConfig::default())
    }

    #[tokio::test]
    async fn send_order_passes_through() {
        let paper = Arc::new(PaperAdapter::new(FillMode::ImmediateFill));
        let gw = gateway(paper.clone());
        let req = OrderRequest::limit(
            "titan_BTCUSDT_1_15",
            "BTCUSDT",
            OrderSide::Buy,
            dec!(0.1),
            dec!(50000),
            true,
        );
        let ack = gw.send_order(&req).await.unwrap();
        assert!(ack.is_filled());
        assert_eq!(paper.sent_orders.load(Ordering::SeqCst), 1);
    }

    /// Fails `failures` times, then delegates to a paper adapter.
    struct FlakyAdapter {
        inner: PaperAdapter,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Adapter for FlakyAdapter {
        async fn send_order(&self, request: &OrderRequest) -> anyhow::Result<OrderAck> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1)).is_ok() {
                return Err(anyhow!("flaky: try again"));
            }
            self.inner.send_order(request).await
        }
        async fn get_order_status(&self, s: &str, o: &str) -> anyhow::Result<OrderAck> {
            self.inner.get_order_status(s, o).await
        }
        async fn cancel_order(&self, s: &str, o: &str) -> anyhow::Result<OrderAck> {
            self.inner.cancel_order(s, o).await
        }
        async fn update_stop_loss(&self, s: &str, p: Decimal) -> anyhow::Result<()> {
            self.inner.update_stop_loss(s, p).await
        }
        async fn update_take_profit(&self, s: &str, t: &[Decimal]) -> anyhow::Result<()> {
            self.inner.update_take_profit(s, t).await
        }
        async fn get_positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            self.inner.get_positions().await
        }
        async fn close_position(&self, s: &str) -> anyhow::Result<()> {
            self.inner.close_position(s).await
        }
        async fn close_all_positions(&self) -> anyhow::Result<u32> {
            self.inner.close_all_positions().await
        }
        async fn test_connection(&self) -> anyhow::Result<()> {
            self.inner.test_connection().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_backoff() {
        let flaky = Arc::new(FlakyAdapter {
            inner: PaperAdapter::new(FillMode::ImmediateFill),
            failures: AtomicU32::new(2),
        });
        let gw = gateway(flaky);
        let req = OrderRequest::limit(
            "titan_BTCUSDT_1_15",
            "BTCUSDT",
            OrderSide::Buy,
            dec!(0.1),
            dec!(50000),
            true,
        );
        // Two failures, two retries allowed: the third attempt succeeds.
        let ack = gw.send_order(&req).await.unwrap();
        assert!(ack.is_filled());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_surfaces_transient_error() {
        let flaky = Arc::new(FlakyAdapter {
            inner: PaperAdapter::new(FillMode::ImmediateFill),
            failures: AtomicU32::new(10),
        });
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        let gw = BrokerGateway::new(flaky, limiter, events, GatewayConfig::default());

        let req = OrderRequest::limit(
            "titan_BTCUSDT_1_15",
            "BTCUSDT",
            OrderSide::Buy,
            dec!(0.1),
            dec!(50000),
            true,
        );
        let err = gw.send_order(&req).await.unwrap_err();
        assert!(err.is_transient());

        // A rejection event was published for the status feed.
        let mut saw_rejected = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, EngineEvent::OrderRejected { .. }) {
                saw_rejected = true;
            }
        }
        assert!(saw_rejected);
    }

    /// Adapter whose calls never complete.
    struct HangingAdapter;

    #[async_trait]
    impl Adapter for HangingAdapter {
        async fn send_order(&self, _r: &OrderRequest) -> anyhow::Result<OrderAck> {
            std::future::pending().await
        }
        async fn get_order_status(&self, _s: &str, _o: &str) -> anyhow::Result<OrderAck> {
            std::future::pending().await
        }
        async fn cancel_order(&self, _s: &str, _o: &str) -> anyhow::Result<OrderAck> {
            std::future::pending().await
        }
        async fn update_stop_loss(&self, _s: &str, _p: Decimal) -> anyhow::Result<()> {
            std::future::pending().await
        }
        async fn update_take_profit(&self, _s: &str, _t: &[Decimal]) -> anyhow::Result<()> {
            std::future::pending().await
        }
        async fn get_positions(&self) -> anyhow::Result<Vec<BrokerPosition>> {
            std::future::pending().await
        }
        async fn close_position(&self, _s: &str) -> anyhow::Result<()> {
            std::future::pending().await
        }
        async fn close_all_positions(&self) -> anyhow::Result<u32> {
            std::future::pending().await
        }
        async fn test_connection(&self) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exceeded_deadline_raises_timeout() {
        let gw = gateway(Arc::new(HangingAdapter));
        let err = gw.get_positions().await.unwrap_err();
        assert_eq!(err.code(), codes::TIMEOUT);
    }

    #[tokio::test]
    async fn flatten_publishes_event_with_count() {
        let paper = Arc::new(PaperAdapter::new(FillMode::ImmediateFill));
        paper.seed_position("BTCUSDT", crate::types::Direction::Long, dec!(1), dec!(50000));
        paper.seed_position("ETHUSDT", crate::types::Direction::Short, dec!(2), dec!(3000));

        let events = EventBus::new();
        let mut rx = events.subscribe();
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        let gw = BrokerGateway::new(paper.clone(), limiter, events, GatewayConfig::default());

        let count = gw.close_all_positions("DEAD_MANS_SWITCH").await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(paper.close_all_calls.load(Ordering::SeqCst), 1);

        match rx.recv().await.unwrap() {
            EngineEvent::PositionsFlattened { count, trigger } => {
                assert_eq!(count, 2);
                assert_eq!(trigger, "DEAD_MANS_SWITCH");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_publishes_cancel_event() {
        let paper = Arc::new(PaperAdapter::new(FillMode::NeverFill));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        let gw = BrokerGateway::new(paper, limiter, events, GatewayConfig::default());

        let req = OrderRequest::limit(
            "titan_BTCUSDT_1_15",
            "BTCUSDT",
            OrderSide::Buy,
            dec!(0.1),
            dec!(50000),
            true,
        );
        let ack = gw.send_order(&req).await.unwrap();
        assert_eq!(ack.state, OrderState::New);

        gw.cancel_order("titan_BTCUSDT_1_15", "BTCUSDT", &ack.order_id)
            .await
            .unwrap();

        let mut saw_cancel = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::OrderCanceled { order_id, .. } = ev {
                assert_eq!(order_id, ack.order_id);
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }
}
