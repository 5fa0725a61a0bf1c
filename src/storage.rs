// =============================================================================
// Storage seam — system events and trade persistence live elsewhere
// =============================================================================
//
// Persistent storage (postgres/sqlite schemas, retention) is a collaborator
// service; the engine only needs a narrow sink it can hand records to. The
// default sink writes structured logs so a missing database never blocks a
// safety path — an emergency flatten must be recorded even if it is only in
// the log stream.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::shadow::TradeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
}

/// A system event destined for the events table.
#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub event_type: String,
    pub severity: Severity,
    pub service: String,
    pub message: String,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl SystemEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            severity,
            service: "titan-exec".to_string(),
            message: message.into(),
            context,
            at: Utc::now(),
        }
    }
}

/// Where records go. Implementations must never block safety paths: a failed
/// write is logged and dropped.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record_event(&self, event: SystemEvent) -> Result<()>;
    async fn record_trade(&self, trade: &TradeRecord) -> Result<()>;
}

/// Default sink: structured logs only.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn record_event(&self, event: SystemEvent) -> Result<()> {
        let context = serde_json::to_string(&event.context).unwrap_or_default();
        match event.severity {
            Severity::Critical => {
                error!(
                    event_type = %event.event_type,
                    context = %context,
                    "{}",
                    event.message
                );
            }
            Severity::Warning => {
                warn!(event_type = %event.event_type, context = %context, "{}", event.message);
            }
            Severity::Info => {
                info!(event_type = %event.event_type, context = %context, "{}", event.message);
            }
        }
        Ok(())
    }

    async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        info!(
            signal_id = %trade.signal_id,
            symbol = %trade.symbol,
            pnl = %trade.pnl,
            reason = %trade.reason,
            "trade recorded"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_sink_accepts_everything() {
        let sink = LogSink;
        let event = SystemEvent::new(
            "emergency_flatten",
            Severity::Critical,
            "flattened on missed heartbeats",
            serde_json::json!({
                "positions_closed": 2,
                "symbols": ["BTCUSDT", "ETHUSDT"],
                "trigger_reason": "DEAD_MANS_SWITCH",
            }),
        );
        sink.record_event(event).await.unwrap();
    }
}
