// =============================================================================
// Broker layer — uniform order operations over a pluggable adapter
// =============================================================================

pub mod gateway;
pub mod paper;
pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Direction, OrderSide};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MARKET")]
    Market,
}

/// An order as handed to the adapter. Every order is tagged with the signal
/// id that caused it — the client order id embeds it so fills remain
/// attributable across reconnects.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub signal_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: Decimal,
    /// Required for LIMIT orders.
    pub price: Option<Decimal>,
    pub post_only: bool,
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn limit(
        signal_id: &str,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
        post_only: bool,
    ) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            size,
            price: Some(price),
            post_only,
            reduce_only: false,
            client_order_id: format!("{signal_id}-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn market(signal_id: &str, symbol: &str, side: OrderSide, size: Decimal) -> Self {
        Self {
            signal_id: signal_id.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            size,
            price: None,
            post_only: false,
            reduce_only: false,
            client_order_id: format!("{signal_id}-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    #[serde(rename = "NEW")]
    New,
    #[serde(rename = "PARTIALLY_FILLED")]
    PartiallyFilled,
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "CANCELED")]
    Canceled,
    #[serde(rename = "REJECTED")]
    Rejected,
}

/// Broker acknowledgement / status for an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub state: OrderState,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

impl OrderAck {
    pub fn is_filled(&self) -> bool {
        self.state == OrderState::Filled
    }

    pub fn has_partial(&self) -> bool {
        self.filled_size > Decimal::ZERO
    }
}

/// A position as reported by the broker, for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub direction: Direction,
    pub size: Decimal,
    pub entry_price: Decimal,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The narrow interface every exchange integration implements. The gateway
/// wraps it with rate limiting, deadlines, retry, and event emission — an
/// adapter only speaks the venue's protocol.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn send_order(&self, request: &OrderRequest) -> Result<OrderAck>;
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> Result<OrderAck>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck>;
    async fn update_stop_loss(&self, symbol: &str, stop: Decimal) -> Result<()>;
    async fn update_take_profit(&self, symbol: &str, take_profits: &[Decimal]) -> Result<()>;
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn close_position(&self, symbol: &str) -> Result<()>;
    /// Returns the number of positions closed.
    async fn close_all_positions(&self) -> Result<u32>;
    async fn test_connection(&self) -> Result<()>;
}
