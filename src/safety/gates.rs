// =============================================================================
// Safety gates — per-signal pre-trade checks
// =============================================================================
//
// Checked in order, short-circuiting on the first failure:
//   1. asset whitelist (when enforced)
//   2. master arm
//   3. circuit breaker: consecutive losses / daily / weekly drawdown,
//      with a cooldown measured in hours once tripped
//   4. funding greed/fear proxies — suppress new entries in the adverse
//      direction when the proxy leaves its configured band
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{codes, EngineError};
use crate::safety::MasterArm;
use crate::types::Direction;

#[derive(Debug, Clone)]
pub struct GatesConfig {
    pub max_consecutive_losses: u32,
    pub max_daily_drawdown_pct: f64,
    pub max_weekly_drawdown_pct: f64,
    pub cooldown_hours: f64,
    /// Funding-rate proxy band; outside it, same-direction entries are
    /// suppressed. Positive funding = longs pay (greed), negative = shorts
    /// pay (fear).
    pub funding_greed_threshold: f64,
    pub funding_fear_threshold: f64,
    /// Empty set = whitelist not enforced.
    pub asset_whitelist: HashSet<String>,
}

impl GatesConfig {
    pub fn from_limits(
        max_consecutive_losses: u32,
        max_daily_drawdown_pct: f64,
        max_weekly_drawdown_pct: f64,
        cooldown_hours: f64,
        asset_whitelist: HashSet<String>,
    ) -> Self {
        Self {
            max_consecutive_losses,
            max_daily_drawdown_pct,
            max_weekly_drawdown_pct,
            cooldown_hours,
            funding_greed_threshold: 0.10,
            funding_fear_threshold: -0.05,
            asset_whitelist,
        }
    }
}

/// Read-only snapshot for the console.
#[derive(Debug, Clone, Serialize)]
pub struct SafetySnapshot {
    pub consecutive_losses: u32,
    pub daily_pnl_pct: f64,
    pub weekly_pnl_pct: f64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub funding_proxy: f64,
    pub breaker_open: bool,
}

struct Inner {
    consecutive_losses: u32,
    daily_pnl_pct: f64,
    weekly_pnl_pct: f64,
    cooldown_until: Option<DateTime<Utc>>,
    funding_proxy: f64,
    day_stamp: String,
    week_stamp: String,
}

pub struct SafetyGates {
    state: RwLock<Inner>,
    config: GatesConfig,
    arm: Arc<MasterArm>,
}

impl SafetyGates {
    pub fn new(config: GatesConfig, arm: Arc<MasterArm>) -> Self {
        let now = Utc::now();
        Self {
            state: RwLock::new(Inner {
                consecutive_losses: 0,
                daily_pnl_pct: 0.0,
                weekly_pnl_pct: 0.0,
                cooldown_until: None,
                funding_proxy: 0.0,
                day_stamp: now.format("%Y-%m-%d").to_string(),
                week_stamp: now.format("%G-W%V").to_string(),
            }),
            config,
            arm,
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade check
    // -------------------------------------------------------------------------

    pub fn check(&self, symbol: &str, direction: Direction) -> Result<(), EngineError> {
        // 1. Whitelist.
        if !self.config.asset_whitelist.is_empty()
            && !self.config.asset_whitelist.contains(symbol)
        {
            return Err(EngineError::validation(
                codes::ASSET_DISABLED,
                format!("{symbol} is not whitelisted for execution"),
            ));
        }

        // 2. Master arm.
        if !self.arm.is_armed() {
            return Err(EngineError::business(
                codes::EXECUTION_DISABLED_BY_OPERATOR,
                "master arm is off",
            ));
        }

        self.roll_windows();
        let mut state = self.state.write();

        // 3. Circuit breaker — active cooldown first, then fresh trips.
        if let Some(until) = state.cooldown_until {
            if Utc::now() < until {
                return Err(EngineError::business(
                    codes::CIRCUIT_BREAKER_OPEN,
                    format!("circuit breaker open until {until}"),
                ));
            }
            state.cooldown_until = None;
            info!("circuit breaker cooldown elapsed");
        }

        let tripped = if state.consecutive_losses >= self.config.max_consecutive_losses {
            Some(format!(
                "{} consecutive losses (limit {})",
                state.consecutive_losses, self.config.max_consecutive_losses
            ))
        } else if -state.daily_pnl_pct >= self.config.max_daily_drawdown_pct {
            Some(format!(
                "daily drawdown {:.2}% (limit {:.2}%)",
                -state.daily_pnl_pct, self.config.max_daily_drawdown_pct
            ))
        } else if -state.weekly_pnl_pct >= self.config.max_weekly_drawdown_pct {
            Some(format!(
                "weekly drawdown {:.2}% (limit {:.2}%)",
                -state.weekly_pnl_pct, self.config.max_weekly_drawdown_pct
            ))
        } else {
            None
        };

        if let Some(why) = tripped {
            let until = Utc::now()
                + ChronoDuration::milliseconds(
                    (self.config.cooldown_hours * 3_600_000.0) as i64,
                );
            state.cooldown_until = Some(until);
            warn!(until = %until, reason = %why, "circuit breaker tripped");
            return Err(EngineError::business(
                codes::CIRCUIT_BREAKER_OPEN,
                format!("circuit breaker: {why}"),
            ));
        }

        // 4. Funding proxies — block the crowded side only.
        let proxy = state.funding_proxy;
        let adverse = match direction {
            Direction::Long => proxy >= self.config.funding_greed_threshold,
            Direction::Short => proxy <= self.config.funding_fear_threshold,
        };
        if adverse {
            return Err(EngineError::business(
                codes::FUNDING_PROXY_ADVERSE,
                format!("funding proxy {proxy:.4} suppresses new {direction} entries"),
            ));
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Feedback
    // -------------------------------------------------------------------------

    /// Record a realized trade result (percent of equity).
    pub fn record_trade(&self, pnl_pct: f64) {
        self.roll_windows();
        let mut state = self.state.write();
        state.daily_pnl_pct += pnl_pct;
        state.weekly_pnl_pct += pnl_pct;
        if pnl_pct < 0.0 {
            state.consecutive_losses += 1;
        } else {
            state.consecutive_losses = 0;
        }
    }

    pub fn update_funding_proxy(&self, value: f64) {
        self.state.write().funding_proxy = value;
    }

    /// Clear the breaker and loss counters (operator action).
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.consecutive_losses = 0;
        state.cooldown_until = None;
        info!("safety gates reset");
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        let state = self.state.read();
        let breaker_open = state
            .cooldown_until
            .map(|until| Utc::now() < until)
            .unwrap_or(false);
        SafetySnapshot {
            consecutive_losses: state.consecutive_losses,
            daily_pnl_pct: state.daily_pnl_pct,
            weekly_pnl_pct: state.weekly_pnl_pct,
            cooldown_until: state.cooldown_until,
            funding_proxy: state.funding_proxy,
            breaker_open,
        }
    }

    /// Reset the daily/weekly accumulators when the calendar rolls.
    fn roll_windows(&self) {
        let now = Utc::now();
        let day = now.format("%Y-%m-%d").to_string();
        let week = now.format("%G-W%V").to_string();
        let mut state = self.state.write();
        if state.day_stamp != day {
            state.day_stamp = day;
            state.daily_pnl_pct = 0.0;
        }
        if state.week_stamp != week {
            state.week_stamp = week;
            state.weekly_pnl_pct = 0.0;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn gates(whitelist: &[&str], max_losses: u32) -> (SafetyGates, Arc<MasterArm>) {
        let arm = Arc::new(MasterArm::new(true, EventBus::new()));
        let config = GatesConfig::from_limits(
            max_losses,
            5.0,
            10.0,
            4.0,
            whitelist.iter().map(|s| s.to_string()).collect(),
        );
        (SafetyGates::new(config, arm.clone()), arm)
    }

    #[test]
    fn whitelist_blocks_first() {
        let (g, arm) = gates(&["BTCUSDT"], 3);
        // Even with the arm off, the whitelist answer comes first.
        arm.set(false, "test");
        let err = g.check("DOGEUSDT", Direction::Long).unwrap_err();
        assert_eq!(err.code(), codes::ASSET_DISABLED);

        let err = g.check("BTCUSDT", Direction::Long).unwrap_err();
        assert_eq!(err.code(), codes::EXECUTION_DISABLED_BY_OPERATOR);
    }

    #[test]
    fn empty_whitelist_is_not_enforced() {
        let (g, _) = gates(&[], 3);
        assert!(g.check("ANYTHING", Direction::Long).is_ok());
    }

    #[test]
    fn consecutive_losses_trip_the_breaker_with_cooldown() {
        let (g, _) = gates(&[], 3);
        g.record_trade(-0.5);
        g.record_trade(-0.5);
        assert!(g.check("BTCUSDT", Direction::Long).is_ok());

        g.record_trade(-0.5);
        let err = g.check("BTCUSDT", Direction::Long).unwrap_err();
        assert_eq!(err.code(), codes::CIRCUIT_BREAKER_OPEN);

        // Still open on the next check (cooldown, not just the counter).
        let err = g.check("BTCUSDT", Direction::Long).unwrap_err();
        assert_eq!(err.code(), codes::CIRCUIT_BREAKER_OPEN);
        assert!(g.snapshot().breaker_open);

        // A win resets the loss streak; reset() clears the cooldown.
        g.record_trade(1.0);
        g.reset();
        assert!(g.check("BTCUSDT", Direction::Long).is_ok());
    }

    #[test]
    fn daily_drawdown_trips() {
        let (g, _) = gates(&[], 100);
        g.record_trade(-2.0);
        g.record_trade(1.0);
        g.record_trade(-4.5);
        // Net daily: -5.5% >= 5% limit.
        let err = g.check("BTCUSDT", Direction::Long).unwrap_err();
        assert_eq!(err.code(), codes::CIRCUIT_BREAKER_OPEN);
        assert!(err.message().contains("daily"));
    }

    #[test]
    fn funding_proxy_suppresses_only_the_adverse_direction() {
        let (g, _) = gates(&[], 100);

        g.update_funding_proxy(0.15); // greed: longs pay
        let err = g.check("BTCUSDT", Direction::Long).unwrap_err();
        assert_eq!(err.code(), codes::FUNDING_PROXY_ADVERSE);
        assert!(g.check("BTCUSDT", Direction::Short).is_ok());

        g.update_funding_proxy(-0.08); // fear: shorts pay
        let err = g.check("BTCUSDT", Direction::Short).unwrap_err();
        assert_eq!(err.code(), codes::FUNDING_PROXY_ADVERSE);
        assert!(g.check("BTCUSDT", Direction::Long).is_ok());

        g.update_funding_proxy(0.0);
        assert!(g.check("BTCUSDT", Direction::Long).is_ok());
        assert!(g.check("BTCUSDT", Direction::Short).is_ok());
    }

    #[test]
    fn wins_reset_the_loss_streak() {
        let (g, _) = gates(&[], 3);
        g.record_trade(-0.5);
        g.record_trade(-0.5);
        g.record_trade(0.2);
        g.record_trade(-0.5);
        assert!(g.check("BTCUSDT", Direction::Long).is_ok());
        assert_eq!(g.snapshot().consecutive_losses, 1);
    }
}
