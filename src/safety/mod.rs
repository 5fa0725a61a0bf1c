// =============================================================================
// Safety substrate — master arm and the shared emergency flatten path
// =============================================================================

pub mod drift;
pub mod gates;
pub mod heartbeat;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, warn};

use crate::broker::gateway::BrokerGateway;
use crate::events::{EngineEvent, EventBus};
use crate::market_data::OrderBookCache;
use crate::phase::PhaseManager;
use crate::shadow::{ShadowState, TradeRecord};
use crate::storage::{EventSink, Severity, SystemEvent};
use crate::strategy::ChaseRegistry;
use crate::types::CloseReason;

// ---------------------------------------------------------------------------
// Master arm
// ---------------------------------------------------------------------------

/// Global execution enable. Every kill path clears it; an operator must
/// explicitly re-arm.
pub struct MasterArm {
    armed: AtomicBool,
    events: EventBus,
}

impl MasterArm {
    pub fn new(armed: bool, events: EventBus) -> Self {
        Self {
            armed: AtomicBool::new(armed),
            events,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn set(&self, armed: bool, reason: &str) {
        let was = self.armed.swap(armed, Ordering::SeqCst);
        if was != armed {
            if armed {
                warn!(reason, "master arm ENABLED");
            } else {
                warn!(reason, "master arm DISABLED");
            }
            self.events.publish(EngineEvent::MasterArmChange {
                armed,
                reason: reason.to_string(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Emergency flatten
// ---------------------------------------------------------------------------

/// The one flatten path shared by the dead-man switch, the drift guard, and
/// reconciliation. Order of operations:
///   1. cancel every in-flight strategy,
///   2. close all shadow positions (local truth first — always succeeds),
///   3. best-effort broker close-all (errors logged, never block),
///   4. disarm,
///   5. publish + persist the CRITICAL event.
pub struct Flattener {
    shadow: Arc<ShadowState>,
    gateway: Arc<BrokerGateway>,
    cache: Arc<OrderBookCache>,
    arm: Arc<MasterArm>,
    phase: Arc<PhaseManager>,
    chases: Arc<ChaseRegistry>,
    events: EventBus,
    sink: Arc<dyn EventSink>,
}

impl Flattener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shadow: Arc<ShadowState>,
        gateway: Arc<BrokerGateway>,
        cache: Arc<OrderBookCache>,
        arm: Arc<MasterArm>,
        phase: Arc<PhaseManager>,
        chases: Arc<ChaseRegistry>,
        events: EventBus,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            shadow,
            gateway,
            cache,
            arm,
            phase,
            chases,
            events,
            sink,
        }
    }

    pub async fn emergency_flatten(&self, trigger: &str, reason: CloseReason) -> Vec<TradeRecord> {
        warn!(trigger, "EMERGENCY FLATTEN");

        let cancelled = self.chases.cancel_all();
        if cancelled > 0 {
            warn!(cancelled, "in-flight strategies cancelled");
        }

        // Local truth first: the shadow flatten cannot fail.
        let records = self
            .shadow
            .close_all_positions(|symbol| self.cache.mid_price(symbol), reason);

        let realized: Decimal = records.iter().map(|r| r.pnl).sum();
        if !records.is_empty() {
            self.phase.apply_pnl(realized);
        }

        // Broker flatten is best-effort — a dead venue must not stop us from
        // disarming.
        if let Err(e) = self.gateway.close_all_positions(trigger).await {
            error!(trigger, error = %e, "broker close-all failed during emergency flatten");
        }

        self.arm.set(false, trigger);

        let symbols: Vec<String> = records.iter().map(|r| r.symbol.clone()).collect();
        self.events.publish(EngineEvent::EmergencyFlatten {
            trigger: trigger.to_string(),
            positions_closed: records.len() as u32,
            symbols: symbols.clone(),
        });

        let event = SystemEvent::new(
            "emergency_flatten",
            Severity::Critical,
            format!("emergency flatten triggered by {trigger}"),
            serde_json::json!({
                "positions_closed": records.len(),
                "symbols": symbols,
                "trigger_reason": trigger,
            }),
        );
        if let Err(e) = self.sink.record_event(event).await {
            error!(error = %e, "failed to persist emergency_flatten event");
        }

        for record in &records {
            if let Err(e) = self.sink.record_trade(record).await {
                error!(error = %e, "failed to persist flatten trade record");
            }
        }

        records
    }
}
