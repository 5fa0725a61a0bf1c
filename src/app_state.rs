// =============================================================================
// Central application state — wires the execution core together
// =============================================================================
//
// The single composition root shared across all async tasks via
// `Arc<AppState>`. Components do not hold references to each other; they
// share the event bus and this tiny context.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the prepared-intents map.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::Duration;

use crate::admission::idempotency::IdempotencyStore;
use crate::admission::replay::ReplayGuard;
use crate::api::console::ConsoleHub;
use crate::broker::gateway::{BrokerGateway, GatewayConfig};
use crate::broker::Adapter;
use crate::config::{Config, ConfigHandle};
use crate::events::EventBus;
use crate::market_data::OrderBookCache;
use crate::phase::{PhaseConfig, PhaseManager};
use crate::ratelimit::{RateLimiter, RateLimiterSnapshot};
use crate::reconcile::{Reconciler, ReconcilerConfig};
use crate::safety::drift::{DriftConfig, DriftGuard, DriftSnapshot};
use crate::safety::gates::{GatesConfig, SafetyGates, SafetySnapshot};
use crate::safety::heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatSnapshot};
use crate::safety::{Flattener, MasterArm};
use crate::shadow::{Intent, Position, ShadowState, TradeRecord};
use crate::storage::EventSink;
use crate::strategy::limit_chaser::{ChaserConfig, LimitChaser};
use crate::strategy::limit_or_kill::LimitOrKill;
use crate::strategy::pyramid::{PyramidMonitor, RegimeBook};
use crate::strategy::{ChaseRegistry, ExecutionStrategy};
use crate::validator::{L2Validator, ValidationVerdict, ValidatorConfig};

/// A PREPARE that passed admission: the tracked intent plus the sizing and
/// microstructure context computed ahead of the CONFIRM. The producer's size
/// is authoritative; `recommended_size` is the engine's risk-based view,
/// surfaced for the operator.
#[derive(Debug, Clone)]
pub struct PreparedIntent {
    pub intent: Intent,
    pub recommended_size: Decimal,
    pub prefetch: Option<ValidationVerdict>,
}

pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub events: EventBus,
    pub state_version: AtomicU64,

    pub cache: Arc<OrderBookCache>,
    pub replay: ReplayGuard,
    pub idempotency: IdempotencyStore,
    pub shadow: Arc<ShadowState>,
    pub validator: L2Validator,
    pub limiter: Arc<RateLimiter>,
    pub gateway: Arc<BrokerGateway>,
    pub phase: Arc<PhaseManager>,
    pub arm: Arc<MasterArm>,
    pub gates: Arc<SafetyGates>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub drift: Arc<DriftGuard>,
    pub flattener: Arc<Flattener>,
    pub reconciler: Arc<Reconciler>,
    pub chases: Arc<ChaseRegistry>,
    pub regimes: Arc<RegimeBook>,
    pub pyramid: Arc<PyramidMonitor>,

    pub maker_strategy: Arc<dyn ExecutionStrategy>,
    pub taker_strategy: Arc<dyn ExecutionStrategy>,

    pub prepared: RwLock<HashMap<String, PreparedIntent>>,
    pub console: Arc<ConsoleHub>,
    pub sink: Arc<dyn EventSink>,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build the full engine from a validated config and a broker adapter.
    pub fn new(config: Config, adapter: Arc<dyn Adapter>, sink: Arc<dyn EventSink>) -> Arc<Self> {
        let events = EventBus::new();
        let config = Arc::new(ConfigHandle::new(config, events.clone()));
        let cfg = config.current();

        let cache = Arc::new(OrderBookCache::new(cfg.ws_cache_max_age_ms));
        let replay = ReplayGuard::new(cfg.max_timestamp_drift_ms, cfg.signal_cache_ttl_ms, None);
        let idempotency = IdempotencyStore::new(cfg.signal_cache_ttl_ms, None);
        let shadow = Arc::new(ShadowState::new(cfg.intent_ttl_ms));
        let validator = L2Validator::new(
            cache.clone(),
            ValidatorConfig::from_limits(
                cfg.min_structure_threshold,
                cfg.max_spread_pct,
                cfg.max_slippage_pct,
            ),
        );
        let limiter = Arc::new(RateLimiter::new(cfg.rate_limit_per_sec, events.clone()));
        let gateway = Arc::new(BrokerGateway::new(
            adapter,
            limiter.clone(),
            events.clone(),
            GatewayConfig::default(),
        ));
        let phase = Arc::new(PhaseManager::new(
            cfg.starting_equity,
            cfg.phase_1_risk_pct,
            cfg.phase_2_risk_pct,
            events.clone(),
        ));
        let arm = Arc::new(MasterArm::new(true, events.clone()));
        let gates = Arc::new(SafetyGates::new(
            GatesConfig::from_limits(
                cfg.max_consecutive_losses,
                cfg.max_daily_drawdown_pct,
                cfg.max_weekly_drawdown_pct,
                cfg.circuit_breaker_cooldown_hours,
                cfg.asset_whitelist.clone(),
            ),
            arm.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            HeartbeatConfig::from_ms(
                cfg.heartbeat_expected_interval_ms,
                cfg.heartbeat_check_interval_ms,
                cfg.max_missed_heartbeats,
            ),
            events.clone(),
        ));
        let drift = Arc::new(DriftGuard::new(
            DriftConfig::from_limits(
                cfg.pnl_window_size,
                cfg.zscore_safety_threshold,
                cfg.drawdown_velocity_threshold,
                cfg.drawdown_time_window_ms,
            ),
            events.clone(),
        ));
        let chases = Arc::new(ChaseRegistry::new());
        let regimes = Arc::new(RegimeBook::new());

        let flattener = Arc::new(Flattener::new(
            shadow.clone(),
            gateway.clone(),
            cache.clone(),
            arm.clone(),
            phase.clone(),
            chases.clone(),
            events.clone(),
            sink.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            shadow.clone(),
            gateway.clone(),
            events.clone(),
            ReconcilerConfig::from_limits(
                cfg.reconcile_interval_ms,
                cfg.max_consecutive_mismatches,
                cfg.reconcile_size_epsilon,
            ),
        ));
        let pyramid = Arc::new(PyramidMonitor::new(
            shadow.clone(),
            gateway.clone(),
            cache.clone(),
            phase.clone(),
            regimes.clone(),
            gates.clone(),
            drift.clone(),
            events.clone(),
            Duration::from_secs(5),
        ));

        let maker_strategy: Arc<dyn ExecutionStrategy> = Arc::new(LimitOrKill::new(
            cache.clone(),
            gateway.clone(),
            events.clone(),
        ));
        let taker_strategy: Arc<dyn ExecutionStrategy> = Arc::new(LimitChaser::new(
            cache.clone(),
            gateway.clone(),
            events.clone(),
            ChaserConfig::from_ms(
                cfg.chase_interval_ms,
                cfg.max_chase_time_ms,
                cfg.max_chase_ticks,
                cfg.min_alpha_threshold,
            ),
        ));

        Arc::new(Self {
            config,
            events,
            state_version: AtomicU64::new(1),
            cache,
            replay,
            idempotency,
            shadow,
            validator,
            limiter,
            gateway,
            phase,
            arm,
            gates,
            heartbeat,
            drift,
            flattener,
            reconciler,
            chases,
            regimes,
            pyramid,
            maker_strategy,
            taker_strategy,
            prepared: RwLock::new(HashMap::new()),
            console: Arc::new(ConsoleHub::new(
                cfg.console_max_clients,
                cfg.console_compress_threshold_bytes,
            )),
            sink,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn console_hub(&self) -> Arc<ConsoleHub> {
        self.console.clone()
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Full serializable snapshot for the console feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let phase = self.phase.current();
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: crate::types::now_ms(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            master_arm: self.arm.is_armed(),
            equity: self.phase.equity(),
            phase,
            positions: self.shadow.open_positions(),
            pending_intents: self.shadow.pending_intent_count(),
            recent_trades: self.shadow.recent_trades(10),
            safety: self.gates.snapshot(),
            heartbeat: self.heartbeat.snapshot(),
            drift: self.drift.snapshot(),
            rate_limiter: self.limiter.snapshot(),
            reconcile_consecutive_mismatches: self.reconciler.consecutive_mismatches(),
            feed_connected: self.cache.feed_connected(),
            tracked_symbols: self.cache.symbols(),
            active_chases: self.chases.active_count(),
        }
    }
}

/// Full engine state snapshot pushed to operator consoles.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub master_arm: bool,
    pub equity: Decimal,
    pub phase: PhaseConfig,
    pub positions: Vec<Position>,
    pub pending_intents: usize,
    pub recent_trades: Vec<TradeRecord>,
    pub safety: SafetySnapshot,
    pub heartbeat: HeartbeatSnapshot,
    pub drift: DriftSnapshot,
    pub rate_limiter: RateLimiterSnapshot,
    pub reconcile_consecutive_mismatches: u32,
    pub feed_connected: bool,
    pub tracked_symbols: Vec<String>,
    pub active_chases: usize,
}
