// =============================================================================
// Configuration — environment-driven, validated fail-fast, hot-swappable
// =============================================================================
//
// The full config is read from the environment once at boot. Any invalid
// value is collected (not short-circuited) so the operator sees every problem
// in one pass, then the process exits with code 1.
//
// Snapshots are immutable: the active `Arc<Config>` lives in an ArcSwap and
// is replaced atomically on hot reload, so readers never observe a torn
// config. Subscribers learn about swaps through the engine event bus.
// =============================================================================

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::events::{EngineEvent, EventBus};

// ---------------------------------------------------------------------------
// Enumerated settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatabaseKind {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "sqlite")]
    Sqlite,
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Complete validated engine configuration. Cloned nowhere; shared as
/// `Arc<Config>` snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    // --- Credentials -------------------------------------------------------
    #[serde(skip_serializing)]
    pub broker_api_key: String,
    #[serde(skip_serializing)]
    pub broker_api_secret: String,
    #[serde(skip_serializing)]
    pub hmac_secret: String,

    // --- Risk --------------------------------------------------------------
    pub max_risk_pct: f64,
    pub phase_1_risk_pct: f64,
    pub phase_2_risk_pct: f64,

    // --- Execution ---------------------------------------------------------
    pub maker_fee_pct: f64,
    pub taker_fee_pct: f64,
    pub rate_limit_per_sec: u32,

    // --- Validation --------------------------------------------------------
    pub min_structure_threshold: f64,
    pub max_spread_pct: f64,
    pub max_slippage_pct: f64,
    pub ws_cache_max_age_ms: u64,

    // --- Safety ------------------------------------------------------------
    pub max_consecutive_losses: u32,
    pub max_daily_drawdown_pct: f64,
    pub max_weekly_drawdown_pct: f64,
    pub circuit_breaker_cooldown_hours: f64,
    pub zscore_safety_threshold: f64,
    pub drawdown_velocity_threshold: f64,

    // --- Replay ------------------------------------------------------------
    pub max_timestamp_drift_ms: u64,
    pub signal_cache_ttl_ms: u64,

    // --- Enums -------------------------------------------------------------
    pub database_type: DatabaseKind,
    pub log_level: String,

    // --- Surface -----------------------------------------------------------
    pub bind_addr: String,
    pub allowed_sources: HashSet<String>,
    /// Optional asset whitelist; empty = not enforced.
    pub asset_whitelist: HashSet<String>,
    pub symbols: Vec<String>,

    // --- Engine tunables -----------------------------------------------------
    pub intent_ttl_ms: u64,
    pub chase_interval_ms: u64,
    pub max_chase_time_ms: u64,
    pub max_chase_ticks: u32,
    pub min_alpha_threshold: f64,
    pub reconcile_interval_ms: u64,
    pub max_consecutive_mismatches: u32,
    /// Reconciliation size tolerance; zero means exact compare.
    pub reconcile_size_epsilon: Decimal,
    pub heartbeat_expected_interval_ms: u64,
    pub heartbeat_check_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub drawdown_time_window_ms: u64,
    pub pnl_window_size: usize,
    pub console_max_clients: usize,
    pub console_heartbeat_interval_ms: u64,
    pub console_snapshot_interval_ms: u64,
    pub console_batch_interval_ms: u64,
    pub console_max_batch_size: usize,
    pub console_compress_threshold_bytes: usize,
    pub starting_equity: Decimal,
}

const VALID_LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];

// ---------------------------------------------------------------------------
// Env readers — each pushes onto the problem list instead of bailing
// ---------------------------------------------------------------------------

fn env_str(key: &str, problems: &mut Vec<String>) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => {
            problems.push(format!("{key} is required"));
            String::new()
        }
    }
}

fn env_str_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_f64_in(key: &str, default: f64, min: f64, max: f64, problems: &mut Vec<String>) -> f64 {
    let raw = match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => return default,
    };
    match raw.parse::<f64>() {
        Ok(v) if v >= min && v <= max => v,
        Ok(v) => {
            problems.push(format!("{key}={v} outside [{min}, {max}]"));
            default
        }
        Err(_) => {
            problems.push(format!("{key}='{raw}' is not a number"));
            default
        }
    }
}

fn env_u64_in(key: &str, default: u64, min: u64, max: u64, problems: &mut Vec<String>) -> u64 {
    let raw = match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => return default,
    };
    match raw.parse::<u64>() {
        Ok(v) if v >= min && v <= max => v,
        Ok(v) => {
            problems.push(format!("{key}={v} outside [{min}, {max}]"));
            default
        }
        Err(_) => {
            problems.push(format!("{key}='{raw}' is not an integer"));
            default
        }
    }
}

impl Config {
    /// Read and validate the full configuration from the environment.
    ///
    /// Returns every problem found rather than the first one.
    pub fn from_env() -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();

        let broker_api_key = env_str("BROKER_API_KEY", &mut problems);
        let broker_api_secret = env_str("BROKER_API_SECRET", &mut problems);
        let hmac_secret = env_str("HMAC_SECRET", &mut problems);
        if !hmac_secret.is_empty() && hmac_secret.len() < 32 {
            problems.push(format!(
                "HMAC_SECRET must be at least 32 chars (got {})",
                hmac_secret.len()
            ));
        }

        let max_risk_pct = env_f64_in("MAX_RISK_PCT", 0.02, 0.01, 0.20, &mut problems);
        let phase_1_risk_pct = env_f64_in("PHASE_1_RISK_PCT", 0.05, 0.01, 0.50, &mut problems);
        let phase_2_risk_pct = env_f64_in("PHASE_2_RISK_PCT", 0.02, 0.01, 0.50, &mut problems);

        // Schema files in the source disagreed on the fee defaults; the
        // maker < taker ordering is the one carried here (see DESIGN.md).
        let maker_fee_pct = env_f64_in("MAKER_FEE_PCT", 0.0005, 0.0, 0.01, &mut problems);
        let taker_fee_pct = env_f64_in("TAKER_FEE_PCT", 0.0006, 0.0, 0.01, &mut problems);

        let rate_limit_per_sec =
            env_u64_in("RATE_LIMIT_PER_SEC", 10, 1, 50, &mut problems) as u32;

        let min_structure_threshold =
            env_f64_in("MIN_STRUCTURE_THRESHOLD", 60.0, 0.0, 100.0, &mut problems);
        let max_spread_pct = env_f64_in("MAX_SPREAD_PCT", 0.10, 0.0, 100.0, &mut problems);
        let max_slippage_pct = env_f64_in("MAX_SLIPPAGE_PCT", 0.15, 0.0, 100.0, &mut problems);
        let ws_cache_max_age_ms =
            env_u64_in("WS_CACHE_MAX_AGE_MS", 100, 10, 1000, &mut problems);

        let max_consecutive_losses =
            env_u64_in("MAX_CONSECUTIVE_LOSSES", 3, 1, 100, &mut problems) as u32;
        let max_daily_drawdown_pct =
            env_f64_in("MAX_DAILY_DRAWDOWN_PCT", 5.0, 0.0, 100.0, &mut problems);
        let max_weekly_drawdown_pct =
            env_f64_in("MAX_WEEKLY_DRAWDOWN_PCT", 10.0, 0.0, 100.0, &mut problems);
        let circuit_breaker_cooldown_hours =
            env_f64_in("CIRCUIT_BREAKER_COOLDOWN_HOURS", 4.0, 0.0, 168.0, &mut problems);
        let zscore_safety_threshold =
            env_f64_in("ZSCORE_SAFETY_THRESHOLD", -2.0, f64::NEG_INFINITY, 0.0, &mut problems);
        let drawdown_velocity_threshold =
            env_f64_in("DRAWDOWN_VELOCITY_THRESHOLD", 2.0, 0.0, 100.0, &mut problems);

        let max_timestamp_drift_ms =
            env_u64_in("MAX_TIMESTAMP_DRIFT_MS", 5000, 1000, 30_000, &mut problems);
        let signal_cache_ttl_ms =
            env_u64_in("SIGNAL_CACHE_TTL_MS", 300_000, 1000, 86_400_000, &mut problems);

        let database_type = match env_str_or("DATABASE_TYPE", "sqlite").as_str() {
            "postgres" => DatabaseKind::Postgres,
            "sqlite" => DatabaseKind::Sqlite,
            other => {
                problems.push(format!(
                    "DATABASE_TYPE='{other}' must be one of postgres, sqlite"
                ));
                DatabaseKind::Sqlite
            }
        };

        let log_level = env_str_or("LOG_LEVEL", "info");
        if !VALID_LOG_LEVELS.contains(&log_level.as_str()) {
            problems.push(format!(
                "LOG_LEVEL='{log_level}' must be one of {VALID_LOG_LEVELS:?}"
            ));
        }

        let bind_addr = env_str_or("TITAN_BIND_ADDR", "0.0.0.0:3001");

        let allowed_sources: HashSet<String> = env_str_or("ALLOWED_SOURCES", "titan-brain")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let asset_whitelist: HashSet<String> = env_str_or("ASSET_WHITELIST", "")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let symbols: Vec<String> = env_str_or("TITAN_SYMBOLS", "BTCUSDT,ETHUSDT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let starting_equity = env_str_or("STARTING_EQUITY", "500")
            .parse::<Decimal>()
            .unwrap_or_else(|_| {
                problems.push("STARTING_EQUITY is not a valid decimal".to_string());
                Decimal::new(500, 0)
            });

        let reconcile_size_epsilon = env_str_or("RECONCILE_SIZE_EPSILON", "0")
            .parse::<Decimal>()
            .unwrap_or_else(|_| {
                problems.push("RECONCILE_SIZE_EPSILON is not a valid decimal".to_string());
                Decimal::ZERO
            });

        let config = Self {
            broker_api_key,
            broker_api_secret,
            hmac_secret,
            max_risk_pct,
            phase_1_risk_pct,
            phase_2_risk_pct,
            maker_fee_pct,
            taker_fee_pct,
            rate_limit_per_sec,
            min_structure_threshold,
            max_spread_pct,
            max_slippage_pct,
            ws_cache_max_age_ms,
            max_consecutive_losses,
            max_daily_drawdown_pct,
            max_weekly_drawdown_pct,
            circuit_breaker_cooldown_hours,
            zscore_safety_threshold,
            drawdown_velocity_threshold,
            max_timestamp_drift_ms,
            signal_cache_ttl_ms,
            database_type,
            log_level,
            bind_addr,
            allowed_sources,
            asset_whitelist,
            symbols,
            intent_ttl_ms: env_u64_in("INTENT_TTL_MS", 300_000, 1000, 3_600_000, &mut problems),
            chase_interval_ms: env_u64_in("CHASE_INTERVAL_MS", 200, 10, 5000, &mut problems),
            max_chase_time_ms: env_u64_in("MAX_CHASE_TIME_MS", 1000, 100, 600_000, &mut problems),
            max_chase_ticks: env_u64_in("MAX_CHASE_TICKS", 5, 1, 100, &mut problems) as u32,
            min_alpha_threshold: env_f64_in("MIN_ALPHA_THRESHOLD", 0.3, 0.0, 1.0, &mut problems),
            reconcile_interval_ms: env_u64_in(
                "RECONCILE_INTERVAL_MS",
                5000,
                100,
                600_000,
                &mut problems,
            ),
            max_consecutive_mismatches: env_u64_in(
                "MAX_CONSECUTIVE_MISMATCHES",
                3,
                1,
                100,
                &mut problems,
            ) as u32,
            reconcile_size_epsilon,
            heartbeat_expected_interval_ms: env_u64_in(
                "HEARTBEAT_EXPECTED_INTERVAL_MS",
                60_000,
                1000,
                3_600_000,
                &mut problems,
            ),
            heartbeat_check_interval_ms: env_u64_in(
                "HEARTBEAT_CHECK_INTERVAL_MS",
                10_000,
                100,
                600_000,
                &mut problems,
            ),
            max_missed_heartbeats: env_u64_in("MAX_MISSED_HEARTBEATS", 3, 1, 100, &mut problems)
                as u32,
            drawdown_time_window_ms: env_u64_in(
                "DRAWDOWN_TIME_WINDOW_MS",
                300_000,
                1000,
                86_400_000,
                &mut problems,
            ),
            pnl_window_size: env_u64_in("PNL_WINDOW_SIZE", 20, 2, 1000, &mut problems) as usize,
            console_max_clients: env_u64_in("CONSOLE_MAX_CLIENTS", 8, 1, 1000, &mut problems)
                as usize,
            console_heartbeat_interval_ms: env_u64_in(
                "CONSOLE_HEARTBEAT_INTERVAL_MS",
                15_000,
                1000,
                600_000,
                &mut problems,
            ),
            console_snapshot_interval_ms: env_u64_in(
                "CONSOLE_SNAPSHOT_INTERVAL_MS",
                1000,
                100,
                60_000,
                &mut problems,
            ),
            console_batch_interval_ms: env_u64_in(
                "CONSOLE_BATCH_INTERVAL_MS",
                250,
                10,
                60_000,
                &mut problems,
            ),
            console_max_batch_size: env_u64_in("CONSOLE_MAX_BATCH_SIZE", 16, 1, 1000, &mut problems)
                as usize,
            console_compress_threshold_bytes: env_u64_in(
                "CONSOLE_COMPRESS_THRESHOLD_BYTES",
                2048,
                128,
                1_048_576,
                &mut problems,
            ) as usize,
            starting_equity,
        };

        if problems.is_empty() {
            Ok(config)
        } else {
            Err(problems)
        }
    }

    /// Load from the environment or terminate the process with exit code 1,
    /// logging every problem found.
    pub fn load_or_exit() -> Self {
        match Self::from_env() {
            Ok(cfg) => cfg,
            Err(problems) => {
                for p in &problems {
                    error!(problem = %p, "invalid configuration");
                }
                error!(count = problems.len(), "configuration invalid — refusing to start");
                std::process::exit(1);
            }
        }
    }

    /// One-line startup summary with secrets masked.
    pub fn masked_summary(&self) -> String {
        format!(
            "broker_key={} hmac_secret={} rate_limit={}/s min_structure={} \
             max_spread={}% max_slippage={}% cache_max_age={}ms drift_max={}ms \
             signal_ttl={}ms db={} log={} symbols={:?}",
            mask(&self.broker_api_key),
            mask(&self.hmac_secret),
            self.rate_limit_per_sec,
            self.min_structure_threshold,
            self.max_spread_pct,
            self.max_slippage_pct,
            self.ws_cache_max_age_ms,
            self.max_timestamp_drift_ms,
            self.signal_cache_ttl_ms,
            self.database_type,
            self.log_level,
            self.symbols,
        )
    }
}

/// Mask a secret for logging: first two chars + length.
fn mask(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}***({} chars)", &secret[..2], secret.len())
    }
}

// ---------------------------------------------------------------------------
// Hot reload
// ---------------------------------------------------------------------------

/// Holder of the active config snapshot. Readers call `current()` and get an
/// immutable Arc; reload validates and swaps atomically, keeping the old
/// snapshot on any validation failure.
pub struct ConfigHandle {
    current: ArcSwap<Config>,
    events: EventBus,
}

impl ConfigHandle {
    pub fn new(config: Config, events: EventBus) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            events,
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.load_full()
    }

    /// Re-read the environment. On success the snapshot is swapped and a
    /// CONFIG_CHANGE event is published; on failure the active snapshot is
    /// untouched.
    pub fn reload_from_env(&self) -> Result<Arc<Config>, Vec<String>> {
        match Config::from_env() {
            Ok(cfg) => {
                let arc = Arc::new(cfg);
                self.current.store(arc.clone());
                info!("configuration reloaded");
                self.events.publish(EngineEvent::ConfigChange {
                    summary: arc.masked_summary(),
                });
                Ok(arc)
            }
            Err(problems) => {
                for p in &problems {
                    warn!(problem = %p, "config reload rejected");
                }
                Err(problems)
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

    // Env-var tests mutate process state; the lock keeps cargo's parallel
    // test runner from interleaving them.
    #[test]
    fn from_env_validates_and_defaults() {
        let _env = test_env::lock_with_valid_credentials();
        let set = |k: &str, v: &str| std::env::set_var(k, v);

        set("BROKER_API_KEY", "key-abcdef");
        set("BROKER_API_SECRET", "secret-abcdef");
        set("HMAC_SECRET", "0123456789abcdef0123456789abcdef");
        std::env::remove_var("MAX_RISK_PCT");
        std::env::remove_var("RATE_LIMIT_PER_SEC");
        std::env::remove_var("LOG_LEVEL");

        let cfg = Config::from_env().expect("valid env should parse");
        assert_eq!(cfg.rate_limit_per_sec, 10);
        assert_eq!(cfg.min_structure_threshold, 60.0);
        assert_eq!(cfg.ws_cache_max_age_ms, 100);
        assert_eq!(cfg.max_timestamp_drift_ms, 5000);
        assert_eq!(cfg.signal_cache_ttl_ms, 300_000);
        assert_eq!(cfg.max_chase_ticks, 5);
        assert!((cfg.zscore_safety_threshold - (-2.0)).abs() < f64::EPSILON);
        assert!((cfg.maker_fee_pct - 0.0005).abs() < 1e-12);
        assert!((cfg.taker_fee_pct - 0.0006).abs() < 1e-12);

        // Out-of-range value is reported, not silently clamped.
        set("RATE_LIMIT_PER_SEC", "99");
        let errs = Config::from_env().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("RATE_LIMIT_PER_SEC")));
        std::env::remove_var("RATE_LIMIT_PER_SEC");

        // Short HMAC secret is rejected.
        set("HMAC_SECRET", "tooshort");
        let errs = Config::from_env().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("HMAC_SECRET")));
        set("HMAC_SECRET", "0123456789abcdef0123456789abcdef");

        // Bad enum.
        set("DATABASE_TYPE", "mongodb");
        let errs = Config::from_env().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("DATABASE_TYPE")));
        std::env::remove_var("DATABASE_TYPE");

        // Secrets are masked in the summary.
        let cfg = Config::from_env().unwrap();
        let summary = cfg.masked_summary();
        assert!(!summary.contains("0123456789abcdef0123456789abcdef"));
        assert!(!summary.contains("secret-abcdef"));
    }

    #[test]
    fn mask_never_reveals_short_secrets() {
        assert_eq!(mask("abc"), "****");
        assert!(mask("supersecretvalue").starts_with("su"));
        assert!(!mask("supersecretvalue").contains("persecret"));
    }
}
