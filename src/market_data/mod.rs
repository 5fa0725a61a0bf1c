// =============================================================================
// Order-book cache — per-symbol L2 snapshots with age tracking
// =============================================================================
//
// Single writer (the depth WebSocket consumer), many readers. Readers clone
// immutable snapshots; validation queries check freshness first and fail with
// STALE_L2_CACHE / STALE_L2_CACHE_DISCONNECTED rather than operating on dead
// data.
//
// OBI = Σ bid_size / Σ ask_size over the top-N levels. OBI > 1 favours bids.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::error::codes;
use crate::types::{now_ms, OrderSide};

/// Depth used for weighted OBI unless the caller overrides it.
pub const DEFAULT_OBI_DEPTH: usize = 10;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Immutable per-symbol book snapshot handed to readers.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    /// Bids, best (highest) first.
    pub bids: Vec<(Decimal, Decimal)>,
    /// Asks, best (lowest) first.
    pub asks: Vec<(Decimal, Decimal)>,
    /// Wall-clock ms of the last upstream update.
    pub updated_at_ms: i64,
    pub fresh: bool,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    /// Spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / Decimal::from(2);
        if mid <= Decimal::ZERO {
            return None;
        }
        ((ask - bid) / mid * Decimal::from(100)).to_f64()
    }

    /// Order Book Imbalance over the top `depth` levels.
    pub fn obi(&self, depth: usize) -> Option<f64> {
        let bid_size: Decimal = self.bids.iter().take(depth).map(|(_, s)| *s).sum();
        let ask_size: Decimal = self.asks.iter().take(depth).map(|(_, s)| *s).sum();
        if ask_size <= Decimal::ZERO {
            return None;
        }
        (bid_size / ask_size).to_f64()
    }

    /// Levels on the side that would absorb an aggressive order of `side`.
    pub fn absorbing_levels(&self, side: OrderSide) -> &[(Decimal, Decimal)] {
        match side {
            OrderSide::Buy => &self.asks,
            OrderSide::Sell => &self.bids,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct BookEntry {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    updated_at: Instant,
    updated_at_ms: i64,
}

/// Shared L2 cache. The WS consumer is the only writer.
pub struct OrderBookCache {
    books: RwLock<HashMap<String, BookEntry>>,
    feed_connected: AtomicBool,
    max_age: Duration,
}

impl OrderBookCache {
    pub fn new(max_age_ms: u64) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            feed_connected: AtomicBool::new(false),
            max_age: Duration::from_millis(max_age_ms),
        }
    }

    /// Replace the book for `symbol` with a fresh upstream snapshot.
    pub fn apply_snapshot(
        &self,
        symbol: &str,
        bids: Vec<(Decimal, Decimal)>,
        asks: Vec<(Decimal, Decimal)>,
    ) {
        let entry = BookEntry {
            bids: bids.into_iter().filter(|(_, s)| *s > Decimal::ZERO).collect(),
            asks: asks.into_iter().filter(|(_, s)| *s > Decimal::ZERO).collect(),
            updated_at: Instant::now(),
            updated_at_ms: now_ms(),
        };
        self.books.write().insert(symbol.to_string(), entry);
    }

    pub fn set_feed_connected(&self, connected: bool) {
        let was = self.feed_connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            if connected {
                info!("depth feed connected");
            } else {
                warn!("depth feed disconnected — cache will report stale");
            }
        }
    }

    pub fn feed_connected(&self) -> bool {
        self.feed_connected.load(Ordering::SeqCst)
    }

    /// Freshness gate used by the validator and strategies. Returns the
    /// staleness reason code when the entry cannot be trusted.
    pub fn freshness(&self, symbol: &str) -> Result<(), &'static str> {
        if !self.feed_connected() {
            return Err(codes::STALE_L2_CACHE_DISCONNECTED);
        }
        let books = self.books.read();
        match books.get(symbol) {
            Some(entry) if entry.updated_at.elapsed() <= self.max_age => Ok(()),
            _ => Err(codes::STALE_L2_CACHE),
        }
    }

    /// Clone out an immutable snapshot. `fresh` reflects the same gate as
    /// [`freshness`].
    pub fn snapshot(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        let books = self.books.read();
        let entry = books.get(symbol)?;
        let fresh =
            self.feed_connected() && entry.updated_at.elapsed() <= self.max_age;
        Some(OrderBookSnapshot {
            symbol: symbol.to_string(),
            // BTreeMap iterates ascending; bids need best-first (descending).
            bids: entry.bids.iter().rev().map(|(p, s)| (*p, *s)).collect(),
            asks: entry.asks.iter().map(|(p, s)| (*p, *s)).collect(),
            updated_at_ms: entry.updated_at_ms,
            fresh,
        })
    }

    pub fn best_bid(&self, symbol: &str) -> Option<Decimal> {
        let books = self.books.read();
        books.get(symbol)?.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self, symbol: &str) -> Option<Decimal> {
        let books = self.books.read();
        books.get(symbol)?.asks.keys().next().copied()
    }

    /// Mid price; falls back to whichever side exists.
    pub fn mid_price(&self, symbol: &str) -> Option<Decimal> {
        match (self.best_bid(symbol), self.best_ask(symbol)) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::from(2)),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    pub fn obi(&self, symbol: &str, depth: usize) -> Option<f64> {
        self.snapshot(symbol)?.obi(depth)
    }

    pub fn spread_pct(&self, symbol: &str) -> Option<f64> {
        self.snapshot(symbol)?.spread_pct()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Depth WebSocket stream
// ---------------------------------------------------------------------------

/// Connect to the exchange partial-depth stream for one symbol and feed the
/// cache. Returns when the stream ends or errors so the caller can handle
/// reconnection; the feed-connected flag is cleared on the way out.
pub async fn run_depth_stream(
    ws_base: &str,
    symbol: &str,
    cache: &Arc<OrderBookCache>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{ws_base}/ws/{lower}@depth20@100ms");
    info!(url = %url, symbol = %symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol = %symbol, "depth WebSocket connected");
    cache.set_feed_connected(true);

    let (_write, mut read) = ws_stream.split();

    let result = loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_depth_message(&text) {
                        Ok((bids, asks)) => cache.apply_snapshot(symbol, bids, asks),
                        Err(e) => warn!(error = %e, "failed to parse depth message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "depth WebSocket read error");
                break Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "depth WebSocket stream ended");
                break Ok(());
            }
        }
    };

    cache.set_feed_connected(false);
    result
}

/// Parse a partial-depth message of the shape
/// `{"bids": [["50000.0", "1.5"], ...], "asks": [["50010.0", "1.2"], ...]}`.
fn parse_depth_message(text: &str) -> Result<(Vec<(Decimal, Decimal)>, Vec<(Decimal, Decimal)>)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let parse_side = |key: &str| -> Result<Vec<(Decimal, Decimal)>> {
        let arr = root[key]
            .as_array()
            .with_context(|| format!("missing field {key}"))?;
        Ok(arr
            .iter()
            .filter_map(|level| {
                let price = level.get(0)?.as_str()?.parse::<Decimal>().ok()?;
                let size = level.get(1)?.as_str()?.parse::<Decimal>().ok()?;
                Some((price, size))
            })
            .collect())
    };

    Ok((parse_side("bids")?, parse_side("asks")?))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seeded_cache() -> OrderBookCache {
        let cache = OrderBookCache::new(100);
        cache.set_feed_connected(true);
        cache.apply_snapshot(
            "BTCUSDT",
            vec![
                (dec!(50000), dec!(1.0)),
                (dec!(49990), dec!(2.0)),
                (dec!(49980), dec!(3.0)),
            ],
            vec![
                (dec!(50010), dec!(1.5)),
                (dec!(50020), dec!(2.5)),
                (dec!(50030), dec!(2.0)),
            ],
        );
        cache
    }

    #[test]
    fn best_levels_and_spread() {
        let cache = seeded_cache();
        assert_eq!(cache.best_bid("BTCUSDT"), Some(dec!(50000)));
        assert_eq!(cache.best_ask("BTCUSDT"), Some(dec!(50010)));

        let snap = cache.snapshot("BTCUSDT").unwrap();
        assert_eq!(snap.spread(), Some(dec!(10)));
        // Bids best-first, asks best-first.
        assert_eq!(snap.bids[0].0, dec!(50000));
        assert_eq!(snap.bids[2].0, dec!(49980));
        assert_eq!(snap.asks[0].0, dec!(50010));

        let spread_pct = snap.spread_pct().unwrap();
        assert!((spread_pct - 0.02).abs() < 1e-6, "spread was {spread_pct}");
    }

    #[test]
    fn obi_sums_depth_levels() {
        let cache = seeded_cache();
        // bids 6.0 / asks 6.0 = 1.0 over full depth
        let obi = cache.obi("BTCUSDT", 10).unwrap();
        assert!((obi - 1.0).abs() < 1e-9);

        // Top-1 only: 1.0 / 1.5
        let obi1 = cache.obi("BTCUSDT", 1).unwrap();
        assert!((obi1 - (1.0 / 1.5)).abs() < 1e-9);
    }

    #[test]
    fn freshness_reports_disconnect_over_age() {
        let cache = seeded_cache();
        assert!(cache.freshness("BTCUSDT").is_ok());

        cache.set_feed_connected(false);
        assert_eq!(
            cache.freshness("BTCUSDT"),
            Err(codes::STALE_L2_CACHE_DISCONNECTED)
        );
    }

    #[test]
    fn unknown_symbol_is_stale() {
        let cache = seeded_cache();
        assert_eq!(cache.freshness("ETHUSDT"), Err(codes::STALE_L2_CACHE));
        assert!(cache.snapshot("ETHUSDT").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_go_stale_after_max_age() {
        let cache = seeded_cache();
        assert!(cache.freshness("BTCUSDT").is_ok());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.freshness("BTCUSDT"), Err(codes::STALE_L2_CACHE));

        let snap = cache.snapshot("BTCUSDT").unwrap();
        assert!(!snap.fresh);
    }

    #[test]
    fn zero_size_levels_are_dropped() {
        let cache = OrderBookCache::new(100);
        cache.set_feed_connected(true);
        cache.apply_snapshot(
            "BTCUSDT",
            vec![(dec!(50000), dec!(0)), (dec!(49990), dec!(1))],
            vec![(dec!(50010), dec!(1))],
        );
        assert_eq!(cache.best_bid("BTCUSDT"), Some(dec!(49990)));
    }

    #[test]
    fn parse_depth_message_happy_path() {
        let text = r#"{
            "lastUpdateId": 7,
            "bids": [["50000.0", "1.5"], ["49990.0", "2.0"]],
            "asks": [["50010.0", "1.0"]]
        }"#;
        let (bids, asks) = parse_depth_message(text).unwrap();
        assert_eq!(bids.len(), 2);
        assert_eq!(asks.len(), 1);
        assert_eq!(bids[0], (dec!(50000.0), dec!(1.5)));
    }
}
