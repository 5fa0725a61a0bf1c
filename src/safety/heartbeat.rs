// =============================================================================
// Heartbeat dead-man switch — flatten when the upstream brain goes quiet
// =============================================================================
//
// The signal producer beats on a fixed cadence. Every check interval we
// compare the age of the last beat against the expected interval; each
// stale check increments the missed counter and emits `heartbeat_missed`.
// At `max_missed` — and only while the market is open — the switch fires the
// shared emergency flatten and disarms. Re-arming requires an explicit
// `reset()`, which also clears the last-beat timestamp so a stale beat can't
// immediately re-trip the switch.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{interval, Duration, Instant};
use tracing::{info, warn};

use crate::events::{EngineEvent, EventBus};
use crate::safety::Flattener;
use crate::types::CloseReason;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub expected_interval: Duration,
    pub check_interval: Duration,
    pub max_missed: u32,
}

impl HeartbeatConfig {
    pub fn from_ms(expected_interval_ms: u64, check_interval_ms: u64, max_missed: u32) -> Self {
        Self {
            expected_interval: Duration::from_millis(expected_interval_ms),
            check_interval: Duration::from_millis(check_interval_ms),
            max_missed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatSnapshot {
    pub missed: u32,
    pub last_beat_age_ms: Option<u64>,
    pub tripped: bool,
}

pub struct HeartbeatMonitor {
    last_beat: RwLock<Option<Instant>>,
    missed: AtomicU32,
    tripped: AtomicBool,
    market_open: AtomicBool,
    config: HeartbeatConfig,
    events: EventBus,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, events: EventBus) -> Self {
        Self {
            last_beat: RwLock::new(None),
            missed: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            market_open: AtomicBool::new(true),
            config,
            events,
        }
    }

    /// Record a heartbeat from the producer.
    pub fn beat(&self) {
        *self.last_beat.write() = Some(Instant::now());
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Market-session gate; when closed, missed beats never flatten.
    pub fn set_market_open(&self, open: bool) {
        self.market_open.store(open, Ordering::SeqCst);
    }

    /// Operator reset: clears the trip latch, the missed counter, and the
    /// last-beat timestamp. Re-arming the master arm is a separate action.
    pub fn reset(&self) {
        *self.last_beat.write() = None;
        self.missed.store(0, Ordering::SeqCst);
        self.tripped.store(false, Ordering::SeqCst);
        info!("dead-man switch reset");
    }

    pub fn snapshot(&self) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            missed: self.missed.load(Ordering::SeqCst),
            last_beat_age_ms: self
                .last_beat
                .read()
                .map(|t| t.elapsed().as_millis() as u64),
            tripped: self.tripped.load(Ordering::SeqCst),
        }
    }

    /// One check-interval evaluation. Returns `true` if the switch fired.
    pub async fn check_once(&self, flattener: &Flattener) -> bool {
        if self.tripped.load(Ordering::SeqCst) {
            return false;
        }

        let age = self.last_beat.read().map(|t| t.elapsed());
        let stale = match age {
            Some(age) => age > self.config.expected_interval,
            // Never beaten: only start counting once a first beat arrived.
            None => return false,
        };

        if !stale {
            return false;
        }

        let missed = self.missed.fetch_add(1, Ordering::SeqCst) + 1;
        let age_ms = age.map(|a| a.as_millis() as u64).unwrap_or(0);
        warn!(missed, age_ms, "heartbeat missed");
        self.events.publish(EngineEvent::HeartbeatMissed {
            missed,
            last_beat_age_ms: age_ms,
        });

        if missed < self.config.max_missed {
            return false;
        }

        if !self.market_open.load(Ordering::SeqCst) {
            warn!(missed, "dead-man threshold reached but market is closed — not flattening");
            return false;
        }

        self.tripped.store(true, Ordering::SeqCst);
        flattener
            .emergency_flatten("DEAD_MANS_SWITCH", CloseReason::DeadMansSwitch)
            .await;
        true
    }

    /// Background loop; spawn once at startup.
    pub async fn run(self: Arc<Self>, flattener: Arc<Flattener>) {
        info!(
            expected = ?self.config.expected_interval,
            check = ?self.config.check_interval,
            max_missed = self.config.max_missed,
            "heartbeat monitor started"
        );
        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_once(&flattener).await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::gateway::{BrokerGateway, GatewayConfig};
    use crate::broker::paper::{FillMode, PaperAdapter};
    use crate::market_data::OrderBookCache;
    use crate::phase::PhaseManager;
    use crate::ratelimit::RateLimiter;
    use crate::safety::MasterArm;
    use crate::shadow::{Fill, NewIntent, ShadowState};
    use crate::storage::LogSink;
    use crate::strategy::ChaseRegistry;
    use crate::types::{Direction, SignalClass};
    use rust_decimal_macros::dec;

    struct Rig {
        monitor: HeartbeatMonitor,
        flattener: Flattener,
        shadow: Arc<ShadowState>,
        arm: Arc<MasterArm>,
        events: EventBus,
    }

    fn rig() -> Rig {
        let events = EventBus::new();
        let shadow = Arc::new(ShadowState::new(300_000));
        let paper = Arc::new(PaperAdapter::new(FillMode::ImmediateFill));
        let limiter = Arc::new(RateLimiter::new(50, events.clone()));
        let gateway = Arc::new(BrokerGateway::new(
            paper,
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
            gateway,
            cache,
            arm.clone(),
            phase,
            chases,
            events.clone(),
            Arc::new(LogSink),
        );
        let monitor = HeartbeatMonitor::new(
            HeartbeatConfig::from_ms(1000, 500, 3),
            events.clone(),
        );
        Rig {
            monitor,
            flattener,
            shadow,
            arm,
            events,
        }
    }

    fn open_two_positions(shadow: &ShadowState) {
        for (id, symbol) in [("titan_BTCUSDT_1_15", "BTCUSDT"), ("titan_ETHUSDT_1_15", "ETHUSDT")] {
            shadow
                .process_intent(NewIntent {
                    signal_id: id.to_string(),
                    symbol: symbol.to_string(),
                    direction: Direction::Long,
                    size: dec!(1),
                    entry_zone: vec![dec!(100)],
                    stop_loss: dec!(95),
                    take_profits: vec![dec!(110)],
                    regime: None,
                    signal_class: SignalClass::Day,
                    alpha_half_life_ms: None,
                })
                .unwrap();
            shadow
                .confirm_execution(id, Fill::filled(dec!(100), dec!(1)), 2)
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_missed_beats_flatten_when_market_open() {
        let rig = rig();
        open_two_positions(&rig.shadow);
        let mut rx = rig.events.subscribe();

        rig.monitor.beat();
        // Beat goes stale, then three checks each count a miss.
        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(!rig.monitor.check_once(&rig.flattener).await);
        assert!(!rig.monitor.check_once(&rig.flattener).await);
        // Third miss fires within the same check interval.
        assert!(rig.monitor.check_once(&rig.flattener).await);

        assert_eq!(rig.shadow.open_position_count(), 0);
        assert!(!rig.arm.is_armed());

        let mut missed_events = 0;
        let mut saw_flatten = false;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                EngineEvent::HeartbeatMissed { .. } => missed_events += 1,
                EngineEvent::EmergencyFlatten { trigger, positions_closed, .. } => {
                    assert_eq!(trigger, "DEAD_MANS_SWITCH");
                    assert_eq!(positions_closed, 2);
                    saw_flatten = true;
                }
                _ => {}
            }
        }
        assert_eq!(missed_events, 3);
        assert!(saw_flatten);

        // Latch: no second flatten without reset.
        assert!(!rig.monitor.check_once(&rig.flattener).await);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_market_never_flattens() {
        let rig = rig();
        open_two_positions(&rig.shadow);
        rig.monitor.set_market_open(false);

        rig.monitor.beat();
        tokio::time::advance(Duration::from_millis(1100)).await;
        for _ in 0..5 {
            assert!(!rig.monitor.check_once(&rig.flattener).await);
        }
        assert_eq!(rig.shadow.open_position_count(), 2);
        assert!(rig.arm.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_beats_keep_the_counter_at_zero() {
        let rig = rig();
        rig.monitor.beat();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!rig.monitor.check_once(&rig.flattener).await);
        assert_eq!(rig.monitor.snapshot().missed, 0);

        // A beat after a couple of misses resets the count.
        tokio::time::advance(Duration::from_millis(1100)).await;
        rig.monitor.check_once(&rig.flattener).await;
        assert_eq!(rig.monitor.snapshot().missed, 1);
        rig.monitor.beat();
        assert_eq!(rig.monitor.snapshot().missed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_beats_yet_means_no_countdown() {
        let rig = rig();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!rig.monitor.check_once(&rig.flattener).await);
        assert_eq!(rig.monitor.snapshot().missed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_trip_and_timestamp() {
        let rig = rig();
        open_two_positions(&rig.shadow);
        rig.monitor.beat();
        tokio::time::advance(Duration::from_millis(1100)).await;
        for _ in 0..3 {
            rig.monitor.check_once(&rig.flattener).await;
        }
        assert!(rig.monitor.snapshot().tripped);

        rig.monitor.reset();
        let snap = rig.monitor.snapshot();
        assert!(!snap.tripped);
        assert_eq!(snap.missed, 0);
        assert!(snap.last_beat_age_ms.is_none());
    }
}
