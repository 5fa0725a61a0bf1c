// =============================================================================
// Engine event bus — broadcast fan-out for safety loops and WebSocket feeds
// =============================================================================
//
// Components never hold references to each other; they publish events here
// and the interested parties (status WebSocket, console fan-out, operator
// alerting) subscribe. A lagging or disconnected subscriber never blocks a
// publisher — `tokio::sync::broadcast` drops the oldest entries instead.
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::OrderSide;

/// Capacity of the broadcast ring. Slow consumers lag rather than block.
const EVENT_BUS_CAPACITY: usize = 256;

/// Every observable state transition in the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "order:filled")]
    OrderFilled {
        signal_id: String,
        symbol: String,
        side: OrderSide,
        price: Decimal,
        size: Decimal,
    },
    #[serde(rename = "order:rejected")]
    OrderRejected {
        signal_id: String,
        symbol: String,
        reason: String,
    },
    #[serde(rename = "order:canceled")]
    OrderCanceled {
        signal_id: String,
        symbol: String,
        order_id: String,
    },
    #[serde(rename = "positions:flattened")]
    PositionsFlattened {
        count: u32,
        trigger: String,
    },
    #[serde(rename = "heartbeat_missed")]
    HeartbeatMissed {
        missed: u32,
        last_beat_age_ms: u64,
    },
    #[serde(rename = "safety_stop")]
    SafetyStop {
        zscore: f64,
        threshold: f64,
    },
    #[serde(rename = "hard_kill")]
    HardKill {
        reason: String,
        drawdown_pct: f64,
    },
    #[serde(rename = "EMERGENCY_FLATTEN")]
    EmergencyFlatten {
        trigger: String,
        positions_closed: u32,
        symbols: Vec<String>,
    },
    #[serde(rename = "PHASE_CHANGE")]
    PhaseChange {
        from: u8,
        to: u8,
        equity: Decimal,
    },
    #[serde(rename = "MASTER_ARM_CHANGE")]
    MasterArmChange {
        armed: bool,
        reason: String,
    },
    #[serde(rename = "CONFIG_CHANGE")]
    ConfigChange {
        summary: String,
    },
    #[serde(rename = "EQUITY_UPDATE")]
    EquityUpdate {
        equity: Decimal,
    },
    #[serde(rename = "POSITION_UPDATE")]
    PositionUpdate {
        symbol: String,
        open: bool,
    },
    #[serde(rename = "REGIME_CHANGE")]
    RegimeChange {
        symbol: String,
        risk_on: bool,
    },
    #[serde(rename = "signal:rejected")]
    SignalRejected {
        signal_id: String,
        code: String,
    },
    #[serde(rename = "ratelimit:approaching")]
    RateLimitApproaching {
        queue_depth: usize,
    },
    #[serde(rename = "ratelimit:force_market")]
    RateLimitForceMarket {
        queue_depth: usize,
    },
    #[serde(rename = "ratelimit:alert")]
    RateLimitAlert {
        consecutive_warnings: u32,
    },
    #[serde(rename = "reconcile:mismatch")]
    ReconcileMismatch {
        symbol: String,
        kind: String,
        consecutive: u32,
    },
    #[serde(rename = "reconcile:sync_ok")]
    ReconcileSyncOk,
}

impl EngineEvent {
    /// Critical events bypass console batching.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::PhaseChange { .. }
                | Self::MasterArmChange { .. }
                | Self::EmergencyFlatten { .. }
                | Self::ConfigChange { .. }
        )
    }

    /// Events pushed on the operator status WebSocket (`/ws/status`).
    pub fn on_status_feed(&self) -> bool {
        matches!(
            self,
            Self::OrderFilled { .. }
                | Self::OrderRejected { .. }
                | Self::OrderCanceled { .. }
                | Self::PositionsFlattened { .. }
                | Self::HeartbeatMissed { .. }
                | Self::SafetyStop { .. }
                | Self::HardKill { .. }
        )
    }
}

/// Cheap-to-clone handle onto the process-wide broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having zero subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
