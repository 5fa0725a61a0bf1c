// =============================================================================
// Paper adapter — scriptable in-process broker for tests and demo mode
// =============================================================================
//
// Fill behaviour is scripted per test scenario:
//   ImmediateFill          — every order fills at its price on send
//   NeverFill              — orders rest forever (chase/timeout paths)
//   FillAfterPolls(n)      — order fills on the n-th status poll
//   PartialFill(fraction)  — order partially fills on send, never completes
//
// The adapter also keeps its own position book so reconciliation tests can
// diverge it from the shadow state on purpose.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::types::Direction;

use super::{Adapter, BrokerPosition, OrderAck, OrderRequest, OrderState, OrderType};

/// Scripted fill behaviour.
#[derive(Debug, Clone, Copy)]
pub enum FillMode {
    ImmediateFill,
    NeverFill,
    FillAfterPolls(u32),
    /// Fraction of the size filled immediately; remainder never fills.
    PartialFill(Decimal),
}

struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
    filled_size: Decimal,
    avg_fill_price: Option<Decimal>,
}

/// In-memory broker.
pub struct PaperAdapter {
    mode: RwLock<FillMode>,
    orders: RwLock<HashMap<String, PaperOrder>>,
    positions: RwLock<HashMap<String, BrokerPosition>>,
    next_order_id: AtomicU64,
    /// Status polls across all orders; FillAfterPolls counts these.
    status_polls: AtomicU32,
    pub sent_orders: AtomicU32,
    pub canceled_orders: AtomicU32,
    pub close_all_calls: AtomicU32,
    /// When true, every adapter call fails (outage simulation).
    pub fail_all: RwLock<bool>,
}

impl PaperAdapter {
    pub fn new(mode: FillMode) -> Self {
        Self {
            mode: RwLock::new(mode),
            orders: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            next_order_id: AtomicU64::new(1),
            status_polls: AtomicU32::new(0),
            sent_orders: AtomicU32::new(0),
            canceled_orders: AtomicU32::new(0),
            close_all_calls: AtomicU32::new(0),
            fail_all: RwLock::new(false),
        }
    }

    pub fn set_mode(&self, mode: FillMode) {
        *self.mode.write() = mode;
    }

    /// Seed a broker-side position directly (reconciliation divergence).
    pub fn seed_position(&self, symbol: &str, direction: Direction, size: Decimal, entry: Decimal) {
        self.positions.write().insert(
            symbol.to_string(),
            BrokerPosition {
                symbol: symbol.to_string(),
                direction,
                size,
                entry_price: entry,
            },
        );
    }

    pub fn remove_position(&self, symbol: &str) {
        self.positions.write().remove(symbol);
    }

    fn check_up(&self) -> Result<()> {
        if *self.fail_all.read() {
            Err(anyhow!("paper broker: simulated outage"))
        } else {
            Ok(())
        }
    }

    fn fill_price(request: &OrderRequest) -> Decimal {
        request.price.unwrap_or(Decimal::ZERO)
    }

    /// Paper has no book of its own; a priceless (market) fill reports no
    /// average so the caller falls back to its own mark.
    fn price_or_none(request: &OrderRequest) -> Option<Decimal> {
        request.price.filter(|p| *p > Decimal::ZERO)
    }

    fn apply_fill_to_book(&self, request: &OrderRequest, price: Decimal, size: Decimal) {
        let mut positions = self.positions.write();
        let direction = match request.side {
            crate::types::OrderSide::Buy => Direction::Long,
            crate::types::OrderSide::Sell => Direction::Short,
        };
        let entry = positions
            .entry(request.symbol.clone())
            .or_insert_with(|| BrokerPosition {
                symbol: request.symbol.clone(),
                direction,
                size: Decimal::ZERO,
                entry_price: price,
            });
        let old_notional = entry.size * entry.entry_price;
        entry.size += size;
        if entry.size > Decimal::ZERO {
            entry.entry_price = (old_notional + size * price) / entry.size;
        }
    }
}

#[async_trait]
impl Adapter for PaperAdapter {
    async fn send_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.check_up()?;
        self.sent_orders.fetch_add(1, Ordering::SeqCst);

        let order_id = format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let mode = *self.mode.read();

        let (state, filled_size, avg_price) = match (mode, request.order_type) {
            // Market orders always fill in paper.
            (_, OrderType::Market) => {
                (OrderState::Filled, request.size, Self::price_or_none(request))
            }
            (FillMode::ImmediateFill, _) => {
                (OrderState::Filled, request.size, Self::price_or_none(request))
            }
            (FillMode::NeverFill, _) => (OrderState::New, Decimal::ZERO, None),
            (FillMode::FillAfterPolls(_), _) => (OrderState::New, Decimal::ZERO, None),
            (FillMode::PartialFill(fraction), _) => {
                let filled = request.size * fraction;
                (
                    OrderState::PartiallyFilled,
                    filled,
                    Self::price_or_none(request),
                )
            }
        };

        if filled_size > Decimal::ZERO {
            self.apply_fill_to_book(request, avg_price.unwrap_or_default(), filled_size);
        }

        self.orders.write().insert(
            order_id.clone(),
            PaperOrder {
                request: request.clone(),
                state,
                filled_size,
                avg_fill_price: avg_price,
            },
        );

        Ok(OrderAck {
            order_id,
            state,
            filled_size,
            avg_fill_price: avg_price,
        })
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<OrderAck> {
        self.check_up()?;
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;

        let polls = self.status_polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let FillMode::FillAfterPolls(n) = *self.mode.read() {
            if order.state == OrderState::New && polls >= n {
                order.state = OrderState::Filled;
                order.filled_size = order.request.size;
                order.avg_fill_price = Some(Self::fill_price(&order.request));
                let (req, price, size) =
                    (order.request.clone(), order.avg_fill_price.unwrap(), order.filled_size);
                drop(orders);
                self.apply_fill_to_book(&req, price, size);
                return Ok(OrderAck {
                    order_id: order_id.to_string(),
                    state: OrderState::Filled,
                    filled_size: size,
                    avg_fill_price: Some(price),
                });
            }
        }

        Ok(OrderAck {
            order_id: order_id.to_string(),
            state: order.state,
            filled_size: order.filled_size,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<OrderAck> {
        self.check_up()?;
        self.canceled_orders.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| anyhow!("unknown order {order_id}"))?;
        if order.state == OrderState::New || order.state == OrderState::PartiallyFilled {
            order.state = OrderState::Canceled;
        }
        Ok(OrderAck {
            order_id: order_id.to_string(),
            state: order.state,
            filled_size: order.filled_size,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn update_stop_loss(&self, _symbol: &str, _stop: Decimal) -> Result<()> {
        self.check_up()
    }

    async fn update_take_profit(&self, _symbol: &str, _take_profits: &[Decimal]) -> Result<()> {
        self.check_up()
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        self.check_up()?;
        Ok(self
            .positions
            .read()
            .values()
            .filter(|p| p.size > Decimal::ZERO)
            .cloned()
            .collect())
    }

    async fn close_position(&self, symbol: &str) -> Result<()> {
        self.check_up()?;
        self.positions.write().remove(symbol);
        Ok(())
    }

    async fn close_all_positions(&self) -> Result<u32> {
        self.check_up()?;
        self.close_all_calls.fetch_add(1, Ordering::SeqCst);
        let mut positions = self.positions.write();
        let count = positions.len() as u32;
        positions.clear();
        Ok(count)
    }

    async fn test_connection(&self) -> Result<()> {
        self.check_up()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn immediate_fill_reports_and_books() {
        let paper = PaperAdapter::new(FillMode::ImmediateFill);
        let req = OrderRequest::limit("titan_BTCUSDT_1_15", "BTCUSDT", OrderSide::Buy, dec!(0.1), dec!(50000), true);
        let ack = paper.send_order(&req).await.unwrap();
        assert!(ack.is_filled());
        assert_eq!(ack.filled_size, dec!(0.1));

        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].entry_price, dec!(50000));
    }

    #[tokio::test]
    async fn fill_after_polls_flips_on_nth_status_check() {
        let paper = PaperAdapter::new(FillMode::FillAfterPolls(3));
        let req = OrderRequest::limit("titan_BTCUSDT_1_15", "BTCUSDT", OrderSide::Buy, dec!(1), dec!(50000), true);
        let ack = paper.send_order(&req).await.unwrap();
        assert_eq!(ack.state, OrderState::New);

        let s1 = paper.get_order_status("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(s1.state, OrderState::New);
        let s2 = paper.get_order_status("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(s2.state, OrderState::New);
        let s3 = paper.get_order_status("BTCUSDT", &ack.order_id).await.unwrap();
        assert!(s3.is_filled());
    }

    #[tokio::test]
    async fn cancel_leaves_partials_intact() {
        let paper = PaperAdapter::new(FillMode::PartialFill(dec!(0.5)));
        let req = OrderRequest::limit("titan_BTCUSDT_1_15", "BTCUSDT", OrderSide::Buy, dec!(2), dec!(50000), true);
        let ack = paper.send_order(&req).await.unwrap();
        assert_eq!(ack.state, OrderState::PartiallyFilled);
        assert_eq!(ack.filled_size, dec!(1.0));

        let canceled = paper.cancel_order("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(canceled.state, OrderState::Canceled);
        assert_eq!(canceled.filled_size, dec!(1.0));
    }

    #[tokio::test]
    async fn outage_mode_fails_everything() {
        let paper = PaperAdapter::new(FillMode::ImmediateFill);
        *paper.fail_all.write() = true;
        assert!(paper.test_connection().await.is_err());
        assert!(paper.get_positions().await.is_err());
    }
}
