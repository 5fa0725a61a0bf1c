// =============================================================================
// Shared types used across the Titan execution core
// =============================================================================
//
// Prices and sizes are `rust_decimal::Decimal` so that pyramiding arithmetic
// and P&L accumulation stay exact; scores, OBI, and alpha tolerate f64.
// =============================================================================

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{codes, EngineError};

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Current UNIX wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}

/// Parse an ISO-8601 timestamp into UNIX milliseconds.
pub fn parse_timestamp_ms(ts: &str) -> Result<i64, EngineError> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| {
            EngineError::validation(
                codes::INVALID_TIMESTAMP,
                format!("unparseable timestamp '{ts}': {e}"),
            )
        })
}

// ---------------------------------------------------------------------------
// Signal identity
// ---------------------------------------------------------------------------

/// Structured signal identifier: `titan_<symbol>_<bar_index>_<timeframe>`.
///
/// Deterministic per (symbol, bar index, timeframe) — two emissions for the
/// same bar produce the same id, which is exactly what makes it usable as the
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalId {
    pub symbol: String,
    pub bar_index: u64,
    pub timeframe: String,
}

impl SignalId {
    pub fn new(symbol: impl Into<String>, bar_index: u64, timeframe: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bar_index,
            timeframe: timeframe.into(),
        }
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "titan_{}_{}_{}", self.symbol, self.bar_index, self.timeframe)
    }
}

impl FromStr for SignalId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("titan_").ok_or_else(|| {
            EngineError::validation(
                codes::INVALID_PAYLOAD,
                format!("signal id '{s}' missing 'titan_' prefix"),
            )
        })?;

        // Timeframe and bar index are the last two segments; the symbol may
        // itself contain underscores (e.g. perp listings), so split from the
        // right.
        let (head, timeframe) = rest.rsplit_once('_').ok_or_else(|| {
            EngineError::validation(codes::INVALID_PAYLOAD, format!("malformed signal id '{s}'"))
        })?;
        let (symbol, bar) = head.rsplit_once('_').ok_or_else(|| {
            EngineError::validation(codes::INVALID_PAYLOAD, format!("malformed signal id '{s}'"))
        })?;

        let bar_index: u64 = bar.parse().map_err(|_| {
            EngineError::validation(
                codes::INVALID_PAYLOAD,
                format!("signal id '{s}' has non-numeric bar index '{bar}'"),
            )
        })?;

        if symbol.is_empty() || timeframe.is_empty() {
            return Err(EngineError::validation(
                codes::INVALID_PAYLOAD,
                format!("signal id '{s}' has empty segments"),
            ));
        }

        Ok(Self {
            symbol: symbol.to_string(),
            bar_index,
            timeframe: timeframe.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Direction / side / class
// ---------------------------------------------------------------------------

/// Trade direction: +1 long, −1 short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Direction {
    pub fn from_i32(v: i32) -> Result<Self, EngineError> {
        match v {
            1 => Ok(Self::Long),
            -1 => Ok(Self::Short),
            other => Err(EngineError::validation(
                codes::INVALID_PAYLOAD,
                format!("direction must be +1 or -1, got {other}"),
            )),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    /// The taker side that opens a position in this direction.
    pub fn entry_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Buy,
            Self::Short => OrderSide::Sell,
        }
    }

    /// The taker side that closes a position in this direction.
    pub fn exit_side(self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Order side as sent to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Signal holding-period class. Governs alpha half-life defaults and which
/// phases will accept the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalClass {
    #[serde(rename = "SCALP")]
    Scalp,
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "SWING")]
    Swing,
}

impl SignalClass {
    /// Default alpha half-life for the class, in milliseconds.
    pub fn default_half_life_ms(self) -> u64 {
        match self {
            Self::Scalp => 10_000,
            Self::Day => 30_000,
            Self::Swing => 120_000,
        }
    }
}

impl fmt::Display for SignalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalp => write!(f, "SCALP"),
            Self::Day => write!(f, "DAY"),
            Self::Swing => write!(f, "SWING"),
        }
    }
}

// ---------------------------------------------------------------------------
// Regime vector
// ---------------------------------------------------------------------------

/// Model recommendation attached to a signal's regime vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRecommendation {
    #[serde(rename = "TREND_FOLLOW")]
    TrendFollow,
    #[serde(rename = "MEAN_REVERT")]
    MeanRevert,
    #[serde(rename = "NO_TRADE")]
    NoTrade,
}

/// Upstream regime snapshot carried on PREPARE/CONFIRM signals.
///
/// Tri-state fields use {-1, 0, +1}; scores are 0..100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeVector {
    #[serde(default)]
    pub trend_state: i8,
    #[serde(default)]
    pub vol_state: i8,
    #[serde(default)]
    pub regime_state: i8,
    #[serde(default)]
    pub market_structure_score: f64,
    #[serde(default)]
    pub momentum_score: f64,
    #[serde(default = "default_recommendation")]
    pub model_recommendation: ModelRecommendation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fdi: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_squeeze: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi_reset: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency_ratio: Option<f64>,
}

fn default_recommendation() -> ModelRecommendation {
    ModelRecommendation::NoTrade
}

impl RegimeVector {
    /// Risk-On = the regime state itself is positive. Pyramid layers are only
    /// added while Risk-On; a flip to Risk-Off closes all layers.
    pub fn is_risk_on(&self) -> bool {
        self.regime_state > 0
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Webhook message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    #[serde(rename = "PREPARE")]
    Prepare,
    #[serde(rename = "CONFIRM")]
    Confirm,
    #[serde(rename = "ABORT")]
    Abort,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

/// Raw webhook body. Everything beyond `type` is optional at parse time and
/// validated per message type by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,

    /// +1 long, −1 short.
    #[serde(default)]
    pub direction: Option<i32>,
    #[serde(default)]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub entry_zone: Vec<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profits: Vec<Decimal>,
    #[serde(default)]
    pub regime_vector: Option<RegimeVector>,
    #[serde(rename = "signal_type", default)]
    pub signal_class: Option<SignalClass>,
    #[serde(default)]
    pub alpha_half_life_ms: Option<u64>,
    #[serde(default)]
    pub urgency_score: Option<f64>,
}

/// Response envelope returned by the webhook endpoint and cached by the
/// idempotency store. Every response carries the signal id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub signal_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// HTTP status the envelope was first served with. Replays return the
    /// identical envelope and status.
    pub http_status: u16,
}

impl ResponseEnvelope {
    pub fn ok(signal_id: impl Into<String>) -> Self {
        Self {
            signal_id: signal_id.into(),
            timestamp: now_ms(),
            status: Some("ok".to_string()),
            error: None,
            message: None,
            detail: None,
            http_status: 200,
        }
    }

    pub fn ok_with_detail(signal_id: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            detail: Some(detail),
            ..Self::ok(signal_id)
        }
    }

    pub fn from_error(signal_id: impl Into<String>, err: &EngineError) -> Self {
        Self {
            signal_id: signal_id.into(),
            timestamp: now_ms(),
            status: None,
            error: Some(err.code().to_string()),
            message: Some(err.message().to_string()),
            detail: None,
            http_status: err.status().as_u16(),
        }
    }
}

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

/// Why a position (or part of one) was closed. Serialized into TradeRecords
/// as the flat string the operator console and storage expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Take-profit level `n` (1-based).
    TakeProfit(u8),
    Stop,
    RegimeKill,
    DeadMansSwitch,
    HardKill,
    Abort,
    ReconcileFlatten,
    Manual,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakeProfit(n) => write!(f, "TP{n}"),
            Self::Stop => write!(f, "STOP"),
            Self::RegimeKill => write!(f, "REGIME_KILL"),
            Self::DeadMansSwitch => write!(f, "DEAD_MANS_SWITCH"),
            Self::HardKill => write!(f, "HARD_KILL"),
            Self::Abort => write!(f, "ABORT"),
            Self::ReconcileFlatten => write!(f, "RECONCILE_FLATTEN"),
            Self::Manual => write!(f, "MANUAL"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_id_roundtrip() {
        let id = SignalId::new("BTCUSDT", 100, "15");
        let encoded = id.to_string();
        assert_eq!(encoded, "titan_BTCUSDT_100_15");
        let parsed: SignalId = encoded.parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.to_string(), encoded);
    }

    #[test]
    fn signal_id_with_underscored_symbol() {
        let parsed: SignalId = "titan_BTC_PERP_42_1h".parse().unwrap();
        assert_eq!(parsed.symbol, "BTC_PERP");
        assert_eq!(parsed.bar_index, 42);
        assert_eq!(parsed.timeframe, "1h");
    }

    #[test]
    fn signal_id_rejects_garbage() {
        assert!("BTCUSDT_100_15".parse::<SignalId>().is_err());
        assert!("titan_BTCUSDT".parse::<SignalId>().is_err());
        assert!("titan_BTCUSDT_abc_15".parse::<SignalId>().is_err());
    }

    #[test]
    fn direction_from_i32() {
        assert_eq!(Direction::from_i32(1).unwrap(), Direction::Long);
        assert_eq!(Direction::from_i32(-1).unwrap(), Direction::Short);
        assert!(Direction::from_i32(0).is_err());
        assert_eq!(Direction::Long.exit_side(), OrderSide::Sell);
        assert_eq!(Direction::Short.exit_side(), OrderSide::Buy);
    }

    #[test]
    fn class_half_lives() {
        assert_eq!(SignalClass::Scalp.default_half_life_ms(), 10_000);
        assert_eq!(SignalClass::Day.default_half_life_ms(), 30_000);
        assert_eq!(SignalClass::Swing.default_half_life_ms(), 120_000);
    }

    #[test]
    fn close_reason_strings() {
        assert_eq!(CloseReason::TakeProfit(1).to_string(), "TP1");
        assert_eq!(CloseReason::TakeProfit(3).to_string(), "TP3");
        assert_eq!(CloseReason::DeadMansSwitch.to_string(), "DEAD_MANS_SWITCH");
        assert_eq!(CloseReason::ReconcileFlatten.to_string(), "RECONCILE_FLATTEN");
    }

    #[test]
    fn payload_parses_prepare_body() {
        let json = r#"{
            "signal_id": "titan_BTCUSDT_100_15",
            "type": "PREPARE",
            "symbol": "BTCUSDT",
            "timestamp": "2024-06-01T12:00:00Z",
            "direction": 1,
            "size": "0.1",
            "stop_loss": "49500",
            "take_profits": ["50500", "51000", "52000"],
            "regime_vector": {
                "trend_state": 1,
                "vol_state": 0,
                "regime_state": 1,
                "market_structure_score": 85.0,
                "momentum_score": 75.0,
                "model_recommendation": "TREND_FOLLOW"
            },
            "signal_type": "SCALP"
        }"#;
        let payload: SignalPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.signal_type, SignalType::Prepare);
        assert_eq!(payload.signal_class, Some(SignalClass::Scalp));
        assert_eq!(payload.take_profits.len(), 3);
        assert!(payload.regime_vector.unwrap().is_risk_on());
    }

    #[test]
    fn timestamp_parsing() {
        let ms = parse_timestamp_ms("2024-06-01T12:00:00Z").unwrap();
        assert_eq!(ms, 1_717_243_200_000);
        assert!(parse_timestamp_ms("yesterday").is_err());
    }

    #[test]
    fn envelope_from_error_carries_code_and_status() {
        let err = EngineError::validation(codes::DUPLICATE_SIGNAL_ID, "already seen");
        let env = ResponseEnvelope::from_error("titan_BTCUSDT_1_15", &err);
        assert_eq!(env.error.as_deref(), Some("DUPLICATE_SIGNAL_ID"));
        assert_eq!(env.http_status, 409);
        assert!(env.status.is_none());
    }
}
