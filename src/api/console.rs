// =============================================================================
// Console fan-out — operator state broadcaster with batching/delta/compression
// =============================================================================
//
// Clients connect on `/ws/console`:
//   - over the client cap → closed immediately with code 1013.
//   - welcome frame (CONNECTED) carries the current full snapshot.
//   - `PING` text → `PONG`; `REQUEST_STATE` → full STATE_UPDATE.
//   - heartbeat pings on an interval; clients that stop answering are
//     dropped.
//
// The broadcast loop samples the snapshot provider every second, sends only
// the top-level fields that changed (delta), batches non-critical frames,
// and gzips any frame above the size threshold. Critical events
// (PHASE_CHANGE, MASTER_ARM_CHANGE, EMERGENCY_FLATTEN, CONFIG_CHANGE) skip
// the batch entirely. A dead or absent console never affects trading.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::events::EngineEvent;

/// WebSocket close code for "try again later" (capacity).
const CLOSE_CAPACITY: u16 = 1013;

struct ConsoleClient {
    tx: mpsc::UnboundedSender<Message>,
    last_pong: RwLock<Instant>,
}

/// Connected console clients.
pub struct ConsoleHub {
    clients: RwLock<HashMap<u64, Arc<ConsoleClient>>>,
    next_id: AtomicU64,
    max_clients: usize,
    compress_threshold: usize,
}

impl ConsoleHub {
    pub fn new(max_clients: usize, compress_threshold: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_clients,
            compress_threshold,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    fn register(&self, tx: mpsc::UnboundedSender<Message>) -> Option<u64> {
        let mut clients = self.clients.write();
        if clients.len() >= self.max_clients {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        clients.insert(
            id,
            Arc::new(ConsoleClient {
                tx,
                last_pong: RwLock::new(Instant::now()),
            }),
        );
        Some(id)
    }

    fn deregister(&self, id: u64) {
        self.clients.write().remove(&id);
    }

    fn touch_pong(&self, id: u64) {
        if let Some(client) = self.clients.read().get(&id) {
            *client.last_pong.write() = Instant::now();
        }
    }

    /// Encode a frame, compressing above the threshold.
    fn encode_frame(&self, frame: &serde_json::Value) -> Message {
        let json = frame.to_string();
        if json.len() > self.compress_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
            if encoder.write_all(json.as_bytes()).is_ok() {
                if let Ok(compressed) = encoder.finish() {
                    let wrapped = serde_json::json!({
                        "type": "COMPRESSED",
                        "encoding": "gzip+base64",
                        "payload": base64::engine::general_purpose::STANDARD.encode(compressed),
                    });
                    return Message::Text(wrapped.to_string());
                }
            }
        }
        Message::Text(json)
    }

    /// Fan a frame out to every connected client; dead senders are pruned.
    pub fn broadcast(&self, frame: &serde_json::Value) {
        let message = self.encode_frame(frame);
        let mut dead = Vec::new();
        {
            let clients = self.clients.read();
            for (id, client) in clients.iter() {
                if client.tx.send(message.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.deregister(id);
        }
    }

    fn send_to(&self, id: u64, frame: &serde_json::Value) {
        let message = self.encode_frame(frame);
        if let Some(client) = self.clients.read().get(&id) {
            let _ = client.tx.send(message);
        }
    }

    /// Ping every client; drop the ones that have not ponged within the
    /// grace period.
    fn ping_sweep(&self, grace: Duration) {
        let mut dead = Vec::new();
        {
            let clients = self.clients.read();
            for (id, client) in clients.iter() {
                if client.last_pong.read().elapsed() > grace {
                    dead.push(*id);
                    continue;
                }
                let _ = client.tx.send(Message::Ping(Vec::new()));
            }
        }
        for id in dead {
            warn!(client_id = id, "console client unresponsive — dropping");
            self.deregister(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

pub async fn console_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_console_connection(socket, state))
}

async fn handle_console_connection(socket: WebSocket, state: Arc<AppState>) {
    let hub = state.console_hub();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = match hub.register(tx) {
        Some(id) => id,
        None => {
            info!("console at capacity — closing with 1013");
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_CAPACITY,
                    reason: "console at capacity".into(),
                })))
                .await;
            return;
        }
    };
    info!(client_id, "console client connected");

    // Welcome frame with the current snapshot.
    hub.send_to(
        client_id,
        &serde_json::json!({
            "type": "CONNECTED",
            "snapshot": state.build_snapshot(),
        }),
    );

    // Forward task: queued frames → socket.
    let forward = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // Receive loop: client commands and liveness.
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match text.trim() {
                "PING" => hub.send_to(client_id, &serde_json::json!({ "type": "PONG" })),
                "REQUEST_STATE" => hub.send_to(
                    client_id,
                    &serde_json::json!({
                        "type": "STATE_UPDATE",
                        "full": true,
                        "snapshot": state.build_snapshot(),
                    }),
                ),
                other => debug!(client_id, msg = other, "unknown console command"),
            },
            Ok(Message::Pong(_)) => hub.touch_pong(client_id),
            Ok(Message::Ping(data)) => {
                hub.touch_pong(client_id);
                let clients = hub.clients.read();
                if let Some(client) = clients.get(&client_id) {
                    let _ = client.tx.send(Message::Pong(data));
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Binary(_)) => {}
        }
    }

    hub.deregister(client_id);
    forward.abort();
    info!(client_id, "console client disconnected");
}

// ---------------------------------------------------------------------------
// Broadcast loop
// ---------------------------------------------------------------------------

/// Top-level fields whose values changed between two snapshots.
fn snapshot_delta(
    previous: &serde_json::Value,
    current: &serde_json::Value,
) -> serde_json::Map<String, serde_json::Value> {
    let mut changed = serde_json::Map::new();
    let (Some(prev), Some(curr)) = (previous.as_object(), current.as_object()) else {
        return changed;
    };
    for (key, value) in curr {
        // server_time moves every sample; it rides along only when something
        // else changed.
        if key == "server_time" || key == "uptime_secs" || key == "state_version" {
            continue;
        }
        if prev.get(key) != Some(value) {
            changed.insert(key.clone(), value.clone());
        }
    }
    changed
}

/// Run the console broadcast loop: snapshot sampling, delta compression,
/// batching, and critical-event bypass. Spawn once at startup.
pub async fn run_console_broadcast(state: Arc<AppState>) {
    let cfg = state.config.current();
    let hub = state.console_hub();

    let mut snapshot_tick = interval(Duration::from_millis(cfg.console_snapshot_interval_ms));
    let mut batch_tick = interval(Duration::from_millis(cfg.console_batch_interval_ms));
    let mut ping_tick = interval(Duration::from_millis(cfg.console_heartbeat_interval_ms));
    let max_batch = cfg.console_max_batch_size;
    let ping_grace = Duration::from_millis(cfg.console_heartbeat_interval_ms * 2);

    let mut events = state.events.subscribe();
    let mut previous = serde_json::Value::Null;
    let mut batch: Vec<serde_json::Value> = Vec::new();

    info!(
        snapshot_ms = cfg.console_snapshot_interval_ms,
        batch_ms = cfg.console_batch_interval_ms,
        max_clients = cfg.console_max_clients,
        "console broadcast loop started"
    );

    loop {
        tokio::select! {
            _ = snapshot_tick.tick() => {
                let snapshot = match serde_json::to_value(state.build_snapshot()) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "snapshot serialization failed");
                        continue;
                    }
                };
                if previous.is_null() {
                    batch.push(serde_json::json!({
                        "type": "STATE_UPDATE",
                        "full": true,
                        "snapshot": snapshot,
                    }));
                } else {
                    let delta = snapshot_delta(&previous, &snapshot);
                    if !delta.is_empty() {
                        batch.push(serde_json::json!({
                            "type": "STATE_UPDATE",
                            "full": false,
                            "changed": delta,
                        }));
                    }
                }
                previous = snapshot;
                if batch.len() >= max_batch {
                    flush(&hub, &mut batch);
                }
            }

            _ = batch_tick.tick() => {
                flush(&hub, &mut batch);
            }

            _ = ping_tick.tick() => {
                hub.ping_sweep(ping_grace);
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if event.is_critical() {
                            // Straight through: flush anything pending first
                            // so ordering is preserved, then the event.
                            flush(&hub, &mut batch);
                            if let Ok(frame) = serde_json::to_value(&event) {
                                hub.broadcast(&frame);
                            }
                        } else if console_relevant(&event) {
                            if let Ok(frame) = serde_json::to_value(&event) {
                                batch.push(frame);
                                if batch.len() >= max_batch {
                                    flush(&hub, &mut batch);
                                }
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "console event subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

fn flush(hub: &ConsoleHub, batch: &mut Vec<serde_json::Value>) {
    match batch.len() {
        0 => {}
        1 => {
            hub.broadcast(&batch.pop().unwrap());
        }
        _ => {
            let frame = serde_json::json!({
                "type": "BATCH",
                "updates": std::mem::take(batch),
            });
            hub.broadcast(&frame);
        }
    }
}

/// Non-critical events the console still wants to see (batched).
fn console_relevant(event: &EngineEvent) -> bool {
    matches!(
        event,
        EngineEvent::EquityUpdate { .. }
            | EngineEvent::PositionUpdate { .. }
            | EngineEvent::RegimeChange { .. }
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_enforces_the_client_cap() {
        let hub = ConsoleHub::new(2, 2048);
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let (tx3, _rx3) = mpsc::unbounded_channel();

        assert!(hub.register(tx1).is_some());
        assert!(hub.register(tx2).is_some());
        // Third client over the cap is refused (handler answers 1013).
        assert!(hub.register(tx3).is_none());
        assert_eq!(hub.client_count(), 2);
    }

    #[test]
    fn small_frames_pass_uncompressed() {
        let hub = ConsoleHub::new(4, 2048);
        let frame = serde_json::json!({ "type": "PONG" });
        match hub.encode_frame(&frame) {
            Message::Text(text) => assert!(text.contains("PONG")),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn oversized_frames_are_gzipped_and_wrapped() {
        let hub = ConsoleHub::new(4, 256);
        let blob = "x".repeat(2000);
        let frame = serde_json::json!({ "type": "STATE_UPDATE", "blob": blob });
        match hub.encode_frame(&frame) {
            Message::Text(text) => {
                let wrapped: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(wrapped["type"], "COMPRESSED");
                assert_eq!(wrapped["encoding"], "gzip+base64");
                // Decompress and verify round trip.
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(wrapped["payload"].as_str().unwrap())
                    .unwrap();
                let mut decoder = flate2::read::GzDecoder::new(raw.as_slice());
                let mut out = String::new();
                std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
                let original: serde_json::Value = serde_json::from_str(&out).unwrap();
                assert_eq!(original["blob"].as_str().unwrap().len(), 2000);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn delta_tracks_only_changed_fields() {
        let previous = serde_json::json!({
            "state_version": 1,
            "server_time": 111,
            "uptime_secs": 5,
            "master_arm": true,
            "equity": "500",
            "pending_intents": 0,
        });
        let current = serde_json::json!({
            "state_version": 2,
            "server_time": 222,
            "uptime_secs": 6,
            "master_arm": false,
            "equity": "500",
            "pending_intents": 1,
        });
        let delta = snapshot_delta(&previous, &current);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["master_arm"], false);
        assert_eq!(delta["pending_intents"], 1);
        // Clock fields alone never produce a delta.
        let delta = snapshot_delta(&current, &current);
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_clients_and_prunes_dead_ones() {
        let hub = ConsoleHub::new(4, 2048);
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        hub.register(tx_live).unwrap();
        hub.register(tx_dead).unwrap();
        drop(rx_dead);

        hub.broadcast(&serde_json::json!({ "type": "STATE_UPDATE" }));
        assert!(rx_live.recv().await.is_some());
        assert_eq!(hub.client_count(), 1);
    }

    #[test]
    fn flush_batches_multiple_updates_into_one_frame() {
        let hub = ConsoleHub::new(4, 4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx).unwrap();

        let mut batch = vec![
            serde_json::json!({ "type": "EQUITY_UPDATE", "equity": "600" }),
            serde_json::json!({ "type": "POSITION_UPDATE", "symbol": "BTCUSDT" }),
        ];
        flush(&hub, &mut batch);
        assert!(batch.is_empty());

        match rx.try_recv().unwrap() {
            Message::Text(text) => {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame["type"], "BATCH");
                assert_eq!(frame["updates"].as_array().unwrap().len(), 2);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
