// =============================================================================
// L2 validator — microstructure checks against the order-book cache
// =============================================================================
//
// Checks run in a fixed order and the first failure wins:
//   1. cache freshness
//   2. market structure score
//   3. (threshold selection + momentum widening)
//   4. depth sufficient to absorb the order
//   5. spread
//   6. expected slippage
//   7. OBI gating (advisory: picks LIMIT vs MARKET, flags hostile walls)
//
// Momentum widening: above 80 the spread/slippage ceilings widen by 25%,
// above 90 by 50% — fast tape is allowed to be messier.
// =============================================================================

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::error::codes;
use crate::market_data::{OrderBookCache, OrderBookSnapshot, DEFAULT_OBI_DEPTH};
use crate::types::OrderSide;

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// How the execution layer should act on a validated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecRecommendation {
    #[serde(rename = "ABORT")]
    Abort,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "MARKET")]
    Market,
}

/// Validator output. `reason` is set for failures and for advisory flags
/// (a heavy wall is valid-but-flagged).
#[derive(Debug, Clone, Serialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub recommendation: ExecRecommendation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_slippage_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obi: Option<f64>,
}

impl ValidationVerdict {
    fn abort(reason: &'static str) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            recommendation: ExecRecommendation::Abort,
            spread_pct: None,
            expected_slippage_pct: None,
            obi: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// Per-asset-class microstructure ceilings (percent values).
#[derive(Debug, Clone, Copy)]
pub struct AssetPreset {
    pub max_spread_pct: f64,
    pub max_slippage_pct: f64,
}

/// Validator configuration. The crypto/equity presets default from the
/// environment-level MAX_SPREAD_PCT / MAX_SLIPPAGE_PCT, with equity allowed
/// a tighter book.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub min_structure_threshold: f64,
    pub crypto: AssetPreset,
    pub equity: AssetPreset,
    pub obi_depth: usize,
}

impl ValidatorConfig {
    pub fn from_limits(min_structure_threshold: f64, max_spread_pct: f64, max_slippage_pct: f64) -> Self {
        Self {
            min_structure_threshold,
            crypto: AssetPreset {
                max_spread_pct,
                max_slippage_pct,
            },
            equity: AssetPreset {
                max_spread_pct: max_spread_pct / 2.0,
                max_slippage_pct: max_slippage_pct / 2.0,
            },
            obi_depth: DEFAULT_OBI_DEPTH,
        }
    }
}

/// Crude asset-class split: the upstream producer only emits crypto pairs and
/// listed equities, and crypto pairs carry a quote-currency suffix.
fn is_crypto_symbol(symbol: &str) -> bool {
    symbol.ends_with("USDT")
        || symbol.ends_with("USDC")
        || symbol.ends_with("USD")
        || symbol.ends_with("PERP")
        || symbol.ends_with("BTC")
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct L2Validator {
    cache: Arc<OrderBookCache>,
    config: ValidatorConfig,
}

impl L2Validator {
    pub fn new(cache: Arc<OrderBookCache>, config: ValidatorConfig) -> Self {
        Self { cache, config }
    }

    /// Validate an order of `size` against the cached book.
    pub fn validate(
        &self,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        market_structure_score: f64,
        momentum_score: f64,
    ) -> ValidationVerdict {
        // 1. Freshness.
        if let Err(code) = self.cache.freshness(symbol) {
            return ValidationVerdict::abort(code);
        }
        let snapshot = match self.cache.snapshot(symbol) {
            Some(s) => s,
            None => return ValidationVerdict::abort(codes::STALE_L2_CACHE),
        };

        // 2. Structure score.
        if market_structure_score < self.config.min_structure_threshold {
            debug!(
                symbol,
                market_structure_score,
                threshold = self.config.min_structure_threshold,
                "structure below threshold"
            );
            return ValidationVerdict::abort(codes::STRUCTURE_BELOW_THRESHOLD);
        }

        // 3. Preset + momentum widening.
        let preset = if is_crypto_symbol(symbol) {
            self.config.crypto
        } else {
            self.config.equity
        };
        let widen = if momentum_score > 90.0 {
            1.5
        } else if momentum_score > 80.0 {
            1.25
        } else {
            1.0
        };
        let max_spread = preset.max_spread_pct * widen;
        let max_slippage = preset.max_slippage_pct * widen;

        // 4 + 6. Walk the absorbing side once: depth check and size-weighted
        // slippage come from the same pass.
        let slippage_pct = match expected_slippage_pct(&snapshot, side, size) {
            Some(pct) => pct,
            None => {
                return ValidationVerdict::abort(codes::INSUFFICIENT_DEPTH);
            }
        };

        // 5. Spread.
        let spread_pct = snapshot.spread_pct();
        match spread_pct {
            Some(pct) if pct <= max_spread => {}
            _ => {
                return ValidationVerdict {
                    spread_pct,
                    ..ValidationVerdict::abort(codes::SPREAD_EXCEEDED)
                };
            }
        }

        // 6. Slippage ceiling.
        if slippage_pct > max_slippage {
            return ValidationVerdict {
                spread_pct,
                expected_slippage_pct: Some(slippage_pct),
                ..ValidationVerdict::abort(codes::SLIPPAGE_EXCEEDED)
            };
        }

        // 7. OBI gating. Hostile walls are advisory (valid, but LIMIT-only);
        // a book leaning our way upgrades the recommendation to MARKET.
        let obi = snapshot.obi(self.config.obi_depth);
        let (reason, recommendation) = match (side, obi) {
            (OrderSide::Buy, Some(x)) if x < 0.5 => {
                (Some(codes::HEAVY_SELL_WALL), ExecRecommendation::Limit)
            }
            (OrderSide::Buy, Some(x)) if x > 2.0 => (None, ExecRecommendation::Market),
            (OrderSide::Sell, Some(x)) if x > 2.0 => {
                (Some(codes::HEAVY_BUY_WALL), ExecRecommendation::Limit)
            }
            (OrderSide::Sell, Some(x)) if x < 0.5 => (None, ExecRecommendation::Market),
            _ => (None, ExecRecommendation::Limit),
        };

        ValidationVerdict {
            valid: true,
            reason,
            recommendation,
            spread_pct,
            expected_slippage_pct: Some(slippage_pct),
            obi,
        }
    }
}

/// Size-weighted average fill price across levels vs. the best level, as a
/// percentage. `None` when the visible depth cannot absorb the order.
fn expected_slippage_pct(
    snapshot: &OrderBookSnapshot,
    side: OrderSide,
    size: Decimal,
) -> Option<f64> {
    let levels = snapshot.absorbing_levels(side);
    let best = levels.first().map(|(p, _)| *p)?;
    if best <= Decimal::ZERO || size <= Decimal::ZERO {
        return None;
    }

    let mut remaining = size;
    let mut notional = Decimal::ZERO;
    for (price, level_size) in levels {
        let take = remaining.min(*level_size);
        notional += take * *price;
        remaining -= take;
        if remaining <= Decimal::ZERO {
            break;
        }
    }
    if remaining > Decimal::ZERO {
        // Depth exhausted — slippage is effectively unbounded.
        return None;
    }

    let avg = notional / size;
    let slip = ((avg - best) / best).abs() * Decimal::from(100);
    slip.to_f64()
}
