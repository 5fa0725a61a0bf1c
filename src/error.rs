// =============================================================================
// Error taxonomy — machine-readable reason codes at the admission boundary
// =============================================================================
//
// Five kinds, one propagation policy each:
//   Auth       — bad HMAC / unknown source. Surfaced as 401, never retried.
//   Validation — drift, duplicates, microstructure failures. Surfaced to the
//                caller with a reason code; Shadow State is never mutated.
//   Business   — phase/arm/circuit-breaker refusals. Same surfacing rule.
//   Transient  — broker timeouts, rate-limit saturation. Retried with bounded
//                back-off inside the broker gateway.
//   Fatal      — invalid config at boot (process exit) or irreconcilable
//                state (emergency flatten + disable).
// =============================================================================

use axum::http::StatusCode;
use thiserror::Error;

/// Reason codes shared between errors, response envelopes, and events.
pub mod codes {
    pub const INVALID_SIGNATURE: &str = "INVALID_SIGNATURE";
    pub const UNAUTHORIZED_SOURCE: &str = "UNAUTHORIZED_SOURCE";

    pub const MISSING_SIGNAL_ID: &str = "MISSING_SIGNAL_ID";
    pub const INVALID_TIMESTAMP: &str = "INVALID_TIMESTAMP";
    pub const TIMESTAMP_DRIFT_EXCEEDED: &str = "TIMESTAMP_DRIFT_EXCEEDED";
    pub const DUPLICATE_SIGNAL_ID: &str = "DUPLICATE_SIGNAL_ID";

    pub const STALE_L2_CACHE: &str = "STALE_L2_CACHE";
    pub const STALE_L2_CACHE_DISCONNECTED: &str = "STALE_L2_CACHE_DISCONNECTED";
    pub const STRUCTURE_BELOW_THRESHOLD: &str = "STRUCTURE_BELOW_THRESHOLD";
    pub const INSUFFICIENT_DEPTH: &str = "INSUFFICIENT_DEPTH";
    pub const SPREAD_EXCEEDED: &str = "SPREAD_EXCEEDED";
    pub const SLIPPAGE_EXCEEDED: &str = "SLIPPAGE_EXCEEDED";
    pub const HEAVY_SELL_WALL: &str = "HEAVY_SELL_WALL";
    pub const HEAVY_BUY_WALL: &str = "HEAVY_BUY_WALL";

    pub const ASSET_DISABLED: &str = "ASSET_DISABLED";
    pub const EXECUTION_DISABLED_BY_OPERATOR: &str = "EXECUTION_DISABLED_BY_OPERATOR";
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    pub const FUNDING_PROXY_ADVERSE: &str = "FUNDING_PROXY_ADVERSE";
    pub const PHASE_DISALLOWED_SIGNAL: &str = "PHASE_DISALLOWED_SIGNAL";

    pub const UNKNOWN_SIGNAL_ID: &str = "UNKNOWN_SIGNAL_ID";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const ZOMBIE_SIGNAL_IGNORED: &str = "ZOMBIE_SIGNAL_IGNORED";
    pub const NO_OPEN_POSITION: &str = "NO_OPEN_POSITION";
    pub const POSITION_SIDE_CONFLICT: &str = "POSITION_SIDE_CONFLICT";
    pub const INVALID_PARTIAL_CLOSE: &str = "INVALID_PARTIAL_CLOSE";
    pub const INTENT_ALREADY_TERMINAL: &str = "INTENT_ALREADY_TERMINAL";
    pub const MAX_PYRAMID_LAYERS: &str = "MAX_PYRAMID_LAYERS";

    pub const TIMEOUT: &str = "TIMEOUT";
    pub const RATE_LIMIT_SATURATED: &str = "RATE_LIMIT_SATURATED";
    pub const BROKER_ERROR: &str = "BROKER_ERROR";

    pub const CONSECUTIVE_MISMATCHES: &str = "CONSECUTIVE_MISMATCHES";
    pub const FLASH_CRASH_PROTECTION: &str = "FLASH_CRASH_PROTECTION";
}

/// Engine-wide error type. Each variant carries the machine-readable code
/// that ends up in the response envelope and a human message.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("auth failed [{code}]: {message}")]
    Auth { code: &'static str, message: String },

    #[error("validation failed [{code}]: {message}")]
    Validation { code: &'static str, message: String },

    #[error("rejected [{code}]: {message}")]
    Business { code: &'static str, message: String },

    #[error("transient [{code}]: {message}")]
    Transient { code: &'static str, message: String },

    #[error("fatal [{code}]: {message}")]
    Fatal { code: &'static str, message: String },
}

impl EngineError {
    pub fn auth(code: &'static str, message: impl Into<String>) -> Self {
        Self::Auth {
            code,
            message: message.into(),
        }
    }

    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn business(code: &'static str, message: impl Into<String>) -> Self {
        Self::Business {
            code,
            message: message.into(),
        }
    }

    pub fn transient(code: &'static str, message: impl Into<String>) -> Self {
        Self::Transient {
            code,
            message: message.into(),
        }
    }

    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Fatal {
            code,
            message: message.into(),
        }
    }

    /// The machine-readable reason code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth { code, .. }
            | Self::Validation { code, .. }
            | Self::Business { code, .. }
            | Self::Transient { code, .. }
            | Self::Fatal { code, .. } => code,
        }
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        match self {
            Self::Auth { message, .. }
            | Self::Validation { message, .. }
            | Self::Business { message, .. }
            | Self::Transient { message, .. }
            | Self::Fatal { message, .. } => message,
        }
    }

    /// Map onto the HTTP status surfaced by the webhook endpoint.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::Validation { code, .. } => match *code {
                codes::TIMESTAMP_DRIFT_EXCEEDED
                | codes::INVALID_TIMESTAMP
                | codes::MISSING_SIGNAL_ID
                | codes::INVALID_PAYLOAD => StatusCode::BAD_REQUEST,
                codes::DUPLICATE_SIGNAL_ID => StatusCode::CONFLICT,
                codes::ASSET_DISABLED => StatusCode::FORBIDDEN,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            Self::Business { code, .. } => match *code {
                codes::ASSET_DISABLED => StatusCode::FORBIDDEN,
                _ => StatusCode::FORBIDDEN,
            },
            Self::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Fatal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
