// =============================================================================
// Reconciliation — shadow state vs. broker, with mismatch escalation
// =============================================================================
//
// Every cycle fetches broker positions and diffs them against the shadow
// book by symbol:
//   MISSING_IN_SHADOW — broker has a position we do not know about
//   MISSING_IN_BROKER — we think we are exposed, broker says flat
//   SIZE_MISMATCH     — sizes differ beyond the configured epsilon
//   SIDE_MISMATCH     — opposite directions on the same symbol
//
// A clean cycle emits `sync_ok` and resets the consecutive counter. Reaching
// `max_consecutive_mismatches` means local truth cannot be trusted: the
// shared emergency flatten fires with CONSECUTIVE_MISMATCHES and execution
// is disabled until an operator intervenes.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::broker::gateway::BrokerGateway;
use crate::broker::BrokerPosition;
use crate::error::{codes, EngineError};
use crate::events::{EngineEvent, EventBus};
use crate::safety::Flattener;
use crate::shadow::{Position, ShadowState};
use crate::types::CloseReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MismatchKind {
    #[serde(rename = "MISSING_IN_SHADOW")]
    MissingInShadow,
    #[serde(rename = "MISSING_IN_BROKER")]
    MissingInBroker,
    #[serde(rename = "SIZE_MISMATCH")]
    SizeMismatch,
    #[serde(rename = "SIDE_MISMATCH")]
    SideMismatch,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInShadow => write!(f, "MISSING_IN_SHADOW"),
            Self::MissingInBroker => write!(f, "MISSING_IN_BROKER"),
            Self::SizeMismatch => write!(f, "SIZE_MISMATCH"),
            Self::SideMismatch => write!(f, "SIDE_MISMATCH"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Mismatch {
    pub symbol: String,
    pub kind: MismatchKind,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    pub max_consecutive_mismatches: u32,
    /// Size tolerance; zero means any non-zero delta is a mismatch.
    pub size_epsilon: Decimal,
}

impl ReconcilerConfig {
    pub fn from_limits(interval_ms: u64, max_consecutive: u32, size_epsilon: Decimal) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            max_consecutive_mismatches: max_consecutive,
            size_epsilon,
        }
    }
}

pub struct Reconciler {
    shadow: Arc<ShadowState>,
    gateway: Arc<BrokerGateway>,
    events: EventBus,
    consecutive: AtomicU32,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        shadow: Arc<ShadowState>,
        gateway: Arc<BrokerGateway>,
        events: EventBus,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            shadow,
            gateway,
            events,
            consecutive: AtomicU32::new(0),
            config,
        }
    }

    pub fn consecutive_mismatches(&self) -> u32 {
        self.consecutive.load(Ordering::SeqCst)
    }

    /// Pure diff of the two books.
    fn diff(
        &self,
        shadow: &[Position],
        broker: &[BrokerPosition],
    ) -> Vec<Mismatch> {
        let shadow_by_symbol: HashMap<&str, &Position> =
            shadow.iter().map(|p| (p.symbol.as_str(), p)).collect();
        let broker_by_symbol: HashMap<&str, &BrokerPosition> =
            broker.iter().map(|p| (p.symbol.as_str(), p)).collect();

        let mut mismatches = Vec::new();

        for (symbol, local) in &shadow_by_symbol {
            match broker_by_symbol.get(symbol) {
                None => mismatches.push(Mismatch {
                    symbol: symbol.to_string(),
                    kind: MismatchKind::MissingInBroker,
                }),
                Some(remote) => {
                    if remote.direction != local.direction {
                        mismatches.push(Mismatch {
                            symbol: symbol.to_string(),
                            kind: MismatchKind::SideMismatch,
                        });
                    } else if (remote.size - local.size).abs() > self.config.size_epsilon {
                        mismatches.push(Mismatch {
                            symbol: symbol.to_string(),
                            kind: MismatchKind::SizeMismatch,
                        });
                    }
                }
            }
        }

        for symbol in broker_by_symbol.keys() {
            if !shadow_by_symbol.contains_key(symbol) {
                mismatches.push(Mismatch {
                    symbol: symbol.to_string(),
                    kind: MismatchKind::MissingInShadow,
                });
            }
        }

        mismatches
    }

    /// One reconciliation cycle. Returns the mismatches found, or the broker
    /// error (broker unavailability is not itself a mismatch).
    pub async fn run_once(&self, flattener: &Flattener) -> Result<Vec<Mismatch>, EngineError> {
        let broker_positions = self.gateway.get_positions().await?;
        let shadow_positions = self.shadow.open_positions();

        let mismatches = self.diff(&shadow_positions, &broker_positions);

        if mismatches.is_empty() {
            let had = self.consecutive.swap(0, Ordering::SeqCst);
            if had > 0 {
                info!(previous = had, "reconciliation back in sync");
            } else {
                debug!("reconciliation clean");
            }
            self.events.publish(EngineEvent::ReconcileSyncOk);
            return Ok(mismatches);
        }

        let consecutive = self.consecutive.fetch_add(1, Ordering::SeqCst) + 1;
        for m in &mismatches {
            warn!(symbol = %m.symbol, kind = %m.kind, consecutive, "reconciliation mismatch");
            self.events.publish(EngineEvent::ReconcileMismatch {
                symbol: m.symbol.clone(),
                kind: m.kind.to_string(),
                consecutive,
            });
        }

        if consecutive >= self.config.max_consecutive_mismatches {
            warn!(
                consecutive,
                limit = self.config.max_consecutive_mismatches,
                "shadow and broker cannot agree — escalating to emergency flatten"
            );
            flattener
                .emergency_flatten(codes::CONSECUTIVE_MISMATCHES, CloseReason::ReconcileFlatten)
                .await;
            self.consecutive.store(0, Ordering::SeqCst);
        }

        Ok(mismatches)
    }

    /// Background loop; spawn once at startup.
    pub async fn run(self: Arc<Self>, flattener: Arc<Flattener>) {
        info!(interval = ?self.config.interval, "reconciliation loop started");
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(&flattener).await {
                warn!(error = %e, "reconciliation cycle failed");
            }
        }
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
    use crate::market_data::OrderBookCache;
    use crate::phase::PhaseManager;
    use crate::ratelimit::RateLimiter;
    use crate::safety::MasterArm;
    use crate::shadow::{Fill, NewIntent};
    use crate::storage::LogSink;
    use crate::strategy::ChaseRegistry;
    use crate::types::{Direction, SignalClass};
    use rust_decimal_macros::dec;

    struct Rig {
        reconciler: Reconciler,
        flattener: Flattener,
        shadow: Arc<ShadowState>,
        paper: Arc<PaperAdapter>,
        arm: Arc<MasterArm>,
        events: EventBus,
    }

    fn rig(epsilon: Decimal) -> Rig {
        let events = EventBus::new();
        let shadow = Arc::new(ShadowState::new(300_000));
        let paper = Arc::new(PaperAdapter::new(FillMode::ImmediateFill));
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        let gateway = Arc::new(BrokerGateway::new(
            paper.clone(),
            limiter,
            events.clone(),
            GatewayConfig::default(),
        ));
        let cache = Arc::new(OrderBookCache::new(100));
        let arm = Arc::new(MasterArm::new(true, events.clone()));
        let phase = Arc::new(PhaseManager::new(dec!(1500), 0.05, 0.02, events.clone()));
        let chases = Arc::new(ChaseRegistry::new());
        let flattener = Flattener::new(
            shadow.clone(),
            gateway.clone(),
            cache,
            arm.clone(),
            phase,
            chases,
            events.clone(),
            Arc::new(LogSink),
        );
        let reconciler = Reconciler::new(
            shadow.clone(),
            gateway,
            events.clone(),
            ReconcilerConfig::from_limits(100, 3, epsilon),
        );
        Rig {
            reconciler,
            flattener,
            shadow,
            paper,
            arm,
            events,
        }
    }

    fn open_shadow_long(shadow: &ShadowState, symbol: &str, size: Decimal, entry: Decimal) {
        let id = format!("titan_{symbol}_1_15");
        shadow
            .process_intent(NewIntent {
                signal_id: id.clone(),
                symbol: symbol.to_string(),
                direction: Direction::Long,
                size,
                entry_zone: vec![entry],
                stop_loss: entry * dec!(0.99),
                take_profits: vec![entry * dec!(1.02)],
                regime: None,
                signal_class: SignalClass::Day,
                alpha_half_life_ms: None,
            })
            .unwrap();
        shadow
            .confirm_execution(&id, Fill::filled(entry, size), 2)
            .unwrap();
    }

    #[tokio::test]
    async fn matching_books_emit_sync_ok() {
        let rig = rig(Decimal::ZERO);
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50100));
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.1), dec!(50100));

        let mut rx = rig.events.subscribe();
        let mismatches = rig.reconciler.run_once(&rig.flattener).await.unwrap();
        assert!(mismatches.is_empty());
        assert_eq!(rig.reconciler.consecutive_mismatches(), 0);

        let mut saw_sync = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, EngineEvent::ReconcileSyncOk) {
                saw_sync = true;
            }
        }
        assert!(saw_sync);
    }

    #[tokio::test]
    async fn size_mismatch_is_detected_exactly() {
        let rig = rig(Decimal::ZERO);
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50100));
        // Broker reports double the size.
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.2), dec!(50100));

        let mismatches = rig.reconciler.run_once(&rig.flattener).await.unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].kind, MismatchKind::SizeMismatch);
        assert_eq!(rig.reconciler.consecutive_mismatches(), 1);
    }

    #[tokio::test]
    async fn epsilon_tolerates_dust_differences() {
        let rig = rig(dec!(0.001));
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50100));
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.1005), dec!(50100));

        let mismatches = rig.reconciler.run_once(&rig.flattener).await.unwrap();
        assert!(mismatches.is_empty());
    }

    #[tokio::test]
    async fn all_four_mismatch_kinds() {
        let rig = rig(Decimal::ZERO);
        // BTCUSDT: size differs. ETHUSDT: side differs. SOLUSDT: shadow-only.
        // XRPUSDT: broker-only.
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50000));
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.3), dec!(50000));
        open_shadow_long(&rig.shadow, "ETHUSDT", dec!(1), dec!(3000));
        rig.paper
            .seed_position("ETHUSDT", Direction::Short, dec!(1), dec!(3000));
        open_shadow_long(&rig.shadow, "SOLUSDT", dec!(10), dec!(150));
        rig.paper
            .seed_position("XRPUSDT", Direction::Long, dec!(100), dec!(0.5));

        let mismatches = rig.reconciler.run_once(&rig.flattener).await.unwrap();
        let kind_of = |symbol: &str| {
            mismatches
                .iter()
                .find(|m| m.symbol == symbol)
                .map(|m| m.kind)
                .unwrap()
        };
        assert_eq!(mismatches.len(), 4);
        assert_eq!(kind_of("BTCUSDT"), MismatchKind::SizeMismatch);
        assert_eq!(kind_of("ETHUSDT"), MismatchKind::SideMismatch);
        assert_eq!(kind_of("SOLUSDT"), MismatchKind::MissingInBroker);
        assert_eq!(kind_of("XRPUSDT"), MismatchKind::MissingInShadow);
    }

    #[tokio::test]
    async fn three_consecutive_mismatches_flatten_and_disarm() {
        let rig = rig(Decimal::ZERO);
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50100));
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.2), dec!(50100));

        let mut rx = rig.events.subscribe();
        rig.reconciler.run_once(&rig.flattener).await.unwrap();
        rig.reconciler.run_once(&rig.flattener).await.unwrap();
        assert!(rig.arm.is_armed());
        rig.reconciler.run_once(&rig.flattener).await.unwrap();

        assert!(!rig.arm.is_armed());
        assert_eq!(rig.shadow.open_position_count(), 0);
        assert_eq!(
            rig.paper.close_all_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let mut saw_flatten = false;
        while let Ok(ev) = rx.try_recv() {
            if let EngineEvent::EmergencyFlatten { trigger, .. } = ev {
                assert_eq!(trigger, "CONSECUTIVE_MISMATCHES");
                saw_flatten = true;
            }
        }
        assert!(saw_flatten);

        let trades = rig.shadow.recent_trades(5);
        assert_eq!(trades[0].reason, "RECONCILE_FLATTEN");
    }

    #[tokio::test]
    async fn sync_resets_the_consecutive_counter() {
        let rig = rig(Decimal::ZERO);
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50100));
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.2), dec!(50100));

        rig.reconciler.run_once(&rig.flattener).await.unwrap();
        rig.reconciler.run_once(&rig.flattener).await.unwrap();
        assert_eq!(rig.reconciler.consecutive_mismatches(), 2);

        // Broker corrects itself before the third cycle.
        rig.paper
            .seed_position("BTCUSDT", Direction::Long, dec!(0.1), dec!(50100));
        rig.reconciler.run_once(&rig.flattener).await.unwrap();
        assert_eq!(rig.reconciler.consecutive_mismatches(), 0);
        assert!(rig.arm.is_armed());
    }

    #[tokio::test]
    async fn broker_outage_is_an_error_not_a_mismatch() {
        let rig = rig(Decimal::ZERO);
        open_shadow_long(&rig.shadow, "BTCUSDT", dec!(0.1), dec!(50100));
        *rig.paper.fail_all.write() = true;

        let err = rig.reconciler.run_once(&rig.flattener).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rig.reconciler.consecutive_mismatches(), 0);
        assert!(rig.arm.is_armed());
    }
}
