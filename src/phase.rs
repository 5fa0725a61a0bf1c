// =============================================================================
// Phase manager — equity-banded policy regime
// =============================================================================
//
// Phase 1 (equity < $1000): maker-only scalps, conservative risk, no
// pyramiding. Phase 2 (equity >= $1000): taker execution, DAY/SWING signals,
// pyramiding with auto-trail. Crossing the band in either direction emits a
// PHASE_CHANGE; dropping back to Phase 1 immediately disables pyramiding and
// shrinks the allowed signal classes.
// =============================================================================

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::events::{EngineEvent, EventBus};
use crate::types::SignalClass;

/// Equity boundary between Phase 1 and Phase 2, in quote currency.
pub const PHASE_2_EQUITY_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionMode {
    #[serde(rename = "MAKER")]
    Maker,
    #[serde(rename = "TAKER")]
    Taker,
}

/// Policy for one equity band.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseConfig {
    pub phase: u8,
    pub label: &'static str,
    pub risk_pct: f64,
    pub max_leverage: f64,
    pub execution_mode: ExecutionMode,
    pub allowed_signal_classes: Vec<SignalClass>,
    pub pyramiding_allowed: bool,
}

pub struct PhaseManager {
    equity: RwLock<Decimal>,
    phase_1_risk_pct: f64,
    phase_2_risk_pct: f64,
    events: EventBus,
}

impl PhaseManager {
    pub fn new(
        starting_equity: Decimal,
        phase_1_risk_pct: f64,
        phase_2_risk_pct: f64,
        events: EventBus,
    ) -> Self {
        Self {
            equity: RwLock::new(starting_equity),
            phase_1_risk_pct,
            phase_2_risk_pct,
            events,
        }
    }

    fn phase_for(equity: Decimal) -> u8 {
        if equity >= Decimal::from(PHASE_2_EQUITY_THRESHOLD) {
            2
        } else {
            1
        }
    }

    fn config_for(&self, phase: u8) -> PhaseConfig {
        match phase {
            1 => PhaseConfig {
                phase: 1,
                label: "Foundation",
                risk_pct: self.phase_1_risk_pct,
                max_leverage: 3.0,
                execution_mode: ExecutionMode::Maker,
                allowed_signal_classes: vec![SignalClass::Scalp],
                pyramiding_allowed: false,
            },
            _ => PhaseConfig {
                phase: 2,
                label: "Acceleration",
                risk_pct: self.phase_2_risk_pct,
                max_leverage: 20.0,
                execution_mode: ExecutionMode::Taker,
                allowed_signal_classes: vec![SignalClass::Day, SignalClass::Swing],
                pyramiding_allowed: true,
            },
        }
    }

    pub fn current(&self) -> PhaseConfig {
        self.config_for(Self::phase_for(*self.equity.read()))
    }

    pub fn equity(&self) -> Decimal {
        *self.equity.read()
    }

    /// Update tracked equity, emitting PHASE_CHANGE on a band crossing.
    pub fn update_equity(&self, equity: Decimal) {
        let (from, to) = {
            let mut current = self.equity.write();
            let from = Self::phase_for(*current);
            *current = equity;
            (from, Self::phase_for(equity))
        };

        self.events.publish(EngineEvent::EquityUpdate { equity });

        if from != to {
            info!(from, to, equity = %equity, "phase transition");
            self.events.publish(EngineEvent::PhaseChange { from, to, equity });
        }
    }

    /// Apply a realized P&L delta to equity.
    pub fn apply_pnl(&self, pnl: Decimal) {
        let equity = *self.equity.read() + pnl;
        self.update_equity(equity);
    }

    /// Whether the current phase accepts this signal class. A refusal emits
    /// `signal:rejected` so the operator can see phase-filtered signals.
    pub fn validate_signal(&self, signal_id: &str, class: SignalClass) -> bool {
        let config = self.current();
        let allowed = config.allowed_signal_classes.contains(&class);
        if !allowed {
            info!(
                signal_id,
                class = %class,
                phase = config.phase,
                "signal class not allowed in current phase"
            );
            self.events.publish(EngineEvent::SignalRejected {
                signal_id: signal_id.to_string(),
                code: crate::error::codes::PHASE_DISALLOWED_SIGNAL.to_string(),
            });
        }
        allowed
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager(equity: Decimal) -> (PhaseManager, EventBus) {
        let bus = EventBus::new();
        (PhaseManager::new(equity, 0.05, 0.02, bus.clone()), bus)
    }

    #[test]
    fn phase_1_policy_below_threshold() {
        let (pm, _) = manager(dec!(500));
        let config = pm.current();
        assert_eq!(config.phase, 1);
        assert_eq!(config.execution_mode, ExecutionMode::Maker);
        assert_eq!(config.allowed_signal_classes, vec![SignalClass::Scalp]);
        assert!(!config.pyramiding_allowed);
        assert!((config.risk_pct - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn phase_2_policy_at_threshold() {
        let (pm, _) = manager(dec!(1000));
        let config = pm.current();
        assert_eq!(config.phase, 2);
        assert_eq!(config.execution_mode, ExecutionMode::Taker);
        assert!(config.pyramiding_allowed);
        assert!(config.allowed_signal_classes.contains(&SignalClass::Day));
        assert!(config.allowed_signal_classes.contains(&SignalClass::Swing));
        assert!(!config.allowed_signal_classes.contains(&SignalClass::Scalp));
        assert!((config.max_leverage - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn crossing_the_band_emits_phase_change() {
        let (pm, bus) = manager(dec!(900));
        let mut rx = bus.subscribe();

        pm.update_equity(dec!(1100));
        let mut saw_change = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::PhaseChange { from, to, .. } = ev {
                assert_eq!((from, to), (1, 2));
                saw_change = true;
            }
        }
        assert!(saw_change);

        // Dropping back re-enters Phase 1 and disables pyramiding.
        let mut rx = bus.subscribe();
        pm.update_equity(dec!(800));
        let mut saw_demotion = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::PhaseChange { from, to, .. } = ev {
                assert_eq!((from, to), (2, 1));
                saw_demotion = true;
            }
        }
        assert!(saw_demotion);
        assert!(!pm.current().pyramiding_allowed);
    }

    #[test]
    fn equity_updates_without_crossing_do_not_emit_phase_change() {
        let (pm, bus) = manager(dec!(500));
        let mut rx = bus.subscribe();
        pm.update_equity(dec!(600));
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(ev, EngineEvent::PhaseChange { .. }));
        }
    }

    #[test]
    fn signal_class_validation_per_phase() {
        let (pm, bus) = manager(dec!(1500));
        let mut rx = bus.subscribe();

        assert!(!pm.validate_signal("titan_BTCUSDT_1_15", SignalClass::Scalp));
        assert!(pm.validate_signal("titan_BTCUSDT_2_15", SignalClass::Day));

        let mut saw_rejection = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::SignalRejected { signal_id, code } = ev {
                assert_eq!(signal_id, "titan_BTCUSDT_1_15");
                assert_eq!(code, "PHASE_DISALLOWED_SIGNAL");
                saw_rejection = true;
            }
        }
        assert!(saw_rejection);
    }

    #[test]
    fn pnl_application_moves_equity() {
        let (pm, _) = manager(dec!(990));
        pm.apply_pnl(dec!(20));
        assert_eq!(pm.equity(), dec!(1010));
        assert_eq!(pm.current().phase, 2);
        pm.apply_pnl(dec!(-50));
        assert_eq!(pm.current().phase, 1);
    }
}
