// =============================================================================
// Webhook dispatcher — authenticated signal ingress
// =============================================================================
//
// Request path for every signal:
//   HMAC + source check -> parse -> replay guard -> idempotency -> dispatch
//
// Routing by `type`:
//   PREPARE   — create the intent, pre-fetch microstructure, size the order.
//   CONFIRM   — arm / safety gates / L2 validation / phase policy, then the
//               phase's execution strategy; fills land in shadow state.
//   ABORT     — cancel the prepared intent and any active chase.
//   HEARTBEAT — feed the dead-man switch.
//
// Duplicates inside the TTL are served the cached envelope of the first
// submission; nothing re-executes.
// =============================================================================

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{info, warn};

use crate::app_state::{AppState, PreparedIntent};
use crate::error::{codes, EngineError};
use crate::events::EngineEvent;
use crate::phase::ExecutionMode;
use crate::shadow::{ConfirmResult, Fill, Intent, NewIntent};
use crate::strategy::{ExecOutcome, StrategyParams};
use crate::types::{
    Direction, ResponseEnvelope, SignalClass, SignalPayload, SignalType,
};

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Verify `X-Source` membership and the `X-Signature` HMAC over the raw
/// body. `Mac::verify_slice` is constant-time.
pub fn verify_request(
    secret: &str,
    allowed_sources: &std::collections::HashSet<String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), EngineError> {
    let source = headers
        .get("X-Source")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !allowed_sources.contains(source) {
        return Err(EngineError::auth(
            codes::UNAUTHORIZED_SOURCE,
            format!("source '{source}' is not allowed"),
        ));
    }

    let signature_hex = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let signature = hex::decode(signature_hex).map_err(|_| {
        EngineError::auth(codes::INVALID_SIGNATURE, "signature is not valid hex")
    })?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| EngineError::auth(codes::INVALID_SIGNATURE, "HMAC verification failed"))
}

/// Hex HMAC of a body — used by tests and operator tooling to build valid
/// requests.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

fn envelope_response(envelope: &ResponseEnvelope) -> Response {
    let status =
        StatusCode::from_u16(envelope.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(envelope.clone())).into_response()
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cfg = state.config.current();

    if let Err(e) = verify_request(&cfg.hmac_secret, &cfg.allowed_sources, &headers, &body) {
        warn!(code = e.code(), "webhook rejected at auth");
        return envelope_response(&ResponseEnvelope::from_error("", &e));
    }

    let payload: SignalPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            let err = EngineError::validation(
                codes::INVALID_PAYLOAD,
                format!("unparseable signal body: {e}"),
            );
            return envelope_response(&ResponseEnvelope::from_error("", &err));
        }
    };
    let signal_id = payload.signal_id.clone().unwrap_or_default();

    // Replay guard: drift first, duplicates second. Duplicates answer 409
    // and carry the first submission's cached envelope so the caller can
    // recover the original result without re-executing anything.
    if let Err(e) = state
        .replay
        .admit(payload.signal_id.as_deref(), payload.timestamp.as_deref())
        .await
    {
        let mut envelope = ResponseEnvelope::from_error(signal_id.clone(), &e);
        if e.code() == codes::DUPLICATE_SIGNAL_ID {
            if let Some(cached) = state.idempotency.lookup(&signal_id).await {
                info!(signal_id = %signal_id, "duplicate — attaching cached envelope");
                envelope.detail = serde_json::to_value(&cached).ok();
            }
        }
        return envelope_response(&envelope);
    }

    let outcome = state
        .idempotency
        .process(&signal_id, || dispatch_signal(state.clone(), payload))
        .await;
    envelope_response(&outcome.result)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn dispatch_signal(state: Arc<AppState>, payload: SignalPayload) -> ResponseEnvelope {
    let signal_id = payload.signal_id.clone().unwrap_or_default();
    let result = match payload.signal_type {
        SignalType::Prepare => handle_prepare(&state, &payload).await,
        SignalType::Confirm => handle_confirm(&state, &payload).await,
        SignalType::Abort => handle_abort(&state, &payload).await,
        SignalType::Heartbeat => {
            state.heartbeat.beat();
            Ok(ResponseEnvelope::ok_with_detail(
                &signal_id,
                serde_json::json!({ "heartbeat": "accepted" }),
            ))
        }
    };

    state.increment_version();
    match result {
        Ok(envelope) => envelope,
        Err(e) => {
            if !matches!(e, EngineError::Auth { .. }) {
                state.events.publish(EngineEvent::SignalRejected {
                    signal_id: signal_id.clone(),
                    code: e.code().to_string(),
                });
            }
            ResponseEnvelope::from_error(signal_id, &e)
        }
    }
}

/// Extract the execution-relevant fields of a PREPARE/CONFIRM body.
fn intent_from_payload(payload: &SignalPayload) -> Result<NewIntent, EngineError> {
    let signal_id = payload
        .signal_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EngineError::validation(codes::MISSING_SIGNAL_ID, "payload is missing signal_id")
        })?;
    // The id must be well-formed even when the rest of the body is trusted.
    let _ = signal_id.parse::<crate::types::SignalId>()?;

    let symbol = payload
        .symbol
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::validation(codes::INVALID_PAYLOAD, "missing symbol"))?;
    let direction = Direction::from_i32(payload.direction.ok_or_else(|| {
        EngineError::validation(codes::INVALID_PAYLOAD, "missing direction")
    })?)?;
    let size = payload
        .size
        .ok_or_else(|| EngineError::validation(codes::INVALID_PAYLOAD, "missing size"))?;
    let stop_loss = payload
        .stop_loss
        .ok_or_else(|| EngineError::validation(codes::INVALID_PAYLOAD, "missing stop_loss"))?;

    Ok(NewIntent {
        signal_id,
        symbol,
        direction,
        size,
        entry_zone: payload.entry_zone.clone(),
        stop_loss,
        take_profits: payload.take_profits.clone(),
        regime: payload.regime_vector.clone(),
        signal_class: payload.signal_class.unwrap_or(SignalClass::Scalp),
        alpha_half_life_ms: payload.alpha_half_life_ms,
    })
}

/// Risk-based size recommendation: risk % of equity over the stop distance,
/// capped by the requested size and the phase's leverage limit. The
/// producer's size stays authoritative for execution.
fn size_position(state: &AppState, intent: &Intent) -> Decimal {
    let phase = state.phase.current();
    let equity = state.phase.equity();

    let entry_ref = intent
        .entry_zone
        .first()
        .copied()
        .or_else(|| state.cache.mid_price(&intent.symbol))
        .unwrap_or(Decimal::ZERO);
    if entry_ref <= Decimal::ZERO {
        return intent.size;
    }

    let risk_fraction = Decimal::from_f64(phase.risk_pct).unwrap_or(Decimal::ZERO);
    let stop_distance = (entry_ref - intent.stop_loss).abs();
    let risk_sized = if stop_distance > Decimal::ZERO && risk_fraction > Decimal::ZERO {
        equity * risk_fraction / stop_distance
    } else {
        intent.size
    };

    let leverage = Decimal::from_f64(phase.max_leverage).unwrap_or(Decimal::ONE);
    let leverage_cap = equity * leverage / entry_ref;

    intent.size.min(risk_sized).min(leverage_cap)
}

async fn handle_prepare(
    state: &Arc<AppState>,
    payload: &SignalPayload,
) -> Result<ResponseEnvelope, EngineError> {
    let request = intent_from_payload(payload)?;
    let symbol = request.symbol.clone();

    if let Some(regime) = &request.regime {
        state.regimes.update(&symbol, regime.clone(), &state.events);
    }

    let intent = state.shadow.process_intent(request)?;
    let recommended_size = size_position(state, &intent);

    // Microstructure pre-fetch: advisory at PREPARE time, enforced at
    // CONFIRM.
    let (structure, momentum) = intent
        .regime
        .as_ref()
        .map(|r| (r.market_structure_score, r.momentum_score))
        .unwrap_or((100.0, 0.0));
    let prefetch = state
        .cache
        .freshness(&intent.symbol)
        .ok()
        .map(|_| {
            state.validator.validate(
                &intent.symbol,
                intent.direction.entry_side(),
                intent.size,
                structure,
                momentum,
            )
        });

    let detail = serde_json::json!({
        "status": "PENDING",
        "recommended_size": recommended_size,
        "prefetch": prefetch,
    });

    info!(
        signal_id = %intent.signal_id,
        symbol = %intent.symbol,
        size = %intent.size,
        recommended_size = %recommended_size,
        "PREPARE accepted"
    );

    state.prepared.write().insert(
        intent.signal_id.clone(),
        PreparedIntent {
            intent: intent.clone(),
            recommended_size,
            prefetch,
        },
    );

    Ok(ResponseEnvelope::ok_with_detail(&intent.signal_id, detail))
}

async fn handle_confirm(
    state: &Arc<AppState>,
    payload: &SignalPayload,
) -> Result<ResponseEnvelope, EngineError> {
    // A prior PREPARE is preferred; an inline CONFIRM is accepted.
    let signal_id = payload
        .signal_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EngineError::validation(codes::MISSING_SIGNAL_ID, "payload is missing signal_id")
        })?;

    let prepared = state.prepared.read().get(&signal_id).cloned();
    let intent = match prepared {
        Some(p) => p.intent,
        None => {
            let request = intent_from_payload(payload)?;
            state.shadow.process_intent(request)?
        }
    };

    if let Some(regime) = &payload.regime_vector {
        state
            .regimes
            .update(&intent.symbol, regime.clone(), &state.events);
    }

    // 1. Master arm + safety gates.
    if let Err(e) = state.gates.check(&intent.symbol, intent.direction) {
        state.shadow.reject_intent(&signal_id, e.code());
        return Err(e);
    }

    // 2. Phase policy.
    if !state.phase.validate_signal(&signal_id, intent.signal_class) {
        state
            .shadow
            .reject_intent(&signal_id, codes::PHASE_DISALLOWED_SIGNAL);
        return Err(EngineError::business(
            codes::PHASE_DISALLOWED_SIGNAL,
            format!(
                "{} signals are not allowed in phase {}",
                intent.signal_class,
                state.phase.current().phase
            ),
        ));
    }

    // 3. Microstructure validation.
    let (structure, momentum) = intent
        .regime
        .as_ref()
        .map(|r| (r.market_structure_score, r.momentum_score))
        .unwrap_or((100.0, 0.0));
    let verdict = state.validator.validate(
        &intent.symbol,
        intent.direction.entry_side(),
        intent.size,
        structure,
        momentum,
    );
    if !verdict.valid {
        let code = verdict.reason.unwrap_or(codes::INVALID_PAYLOAD);
        state.shadow.reject_intent(&signal_id, code);
        return Err(EngineError::validation(
            code,
            format!("microstructure validation failed for {}", intent.symbol),
        ));
    }

    state.shadow.validate_intent(&signal_id)?;

    // 4. Execute with the phase's strategy.
    let phase = state.phase.current();
    let strategy = match phase.execution_mode {
        ExecutionMode::Maker => state.maker_strategy.clone(),
        ExecutionMode::Taker => state.taker_strategy.clone(),
    };

    let params = StrategyParams {
        signal_id: signal_id.clone(),
        symbol: intent.symbol.clone(),
        side: intent.direction.entry_side(),
        size: intent.size,
        signal_class: intent.signal_class,
        alpha_half_life_ms: intent.alpha_half_life_ms,
        urgency_score: payload.urgency_score,
        post_only: true,
        tick_size: None,
    };

    info!(
        signal_id = %signal_id,
        strategy = strategy.name(),
        recommendation = ?verdict.recommendation,
        "CONFIRM executing"
    );

    let cancel = state.chases.register(&signal_id);
    let report = strategy.execute(params, &cancel).await;
    state.chases.deregister(&signal_id);
    state.prepared.write().remove(&signal_id);

    // 5. Settle shadow state by outcome.
    match report.outcome {
        ExecOutcome::Filled | ExecOutcome::PartiallyFilled => {
            let fill = report.fill.clone().unwrap_or(Fill::missed());
            match state.shadow.confirm_execution(&signal_id, fill, phase.phase)? {
                ConfirmResult::Executed(position) => {
                    state.events.publish(EngineEvent::PositionUpdate {
                        symbol: position.symbol.clone(),
                        open: true,
                    });
                    // Protective orders ride with the position; failures are
                    // surfaced but the fill already happened.
                    if let Err(e) = state
                        .gateway
                        .update_stop_loss(&position.symbol, position.stop_loss)
                        .await
                    {
                        warn!(symbol = %position.symbol, error = %e, "failed to place protective stop");
                    }
                    if !position.take_profits.is_empty() {
                        if let Err(e) = state
                            .gateway
                            .update_take_profit(&position.symbol, &position.take_profits)
                            .await
                        {
                            warn!(symbol = %position.symbol, error = %e, "failed to place take-profits");
                        }
                    }
                }
                ConfirmResult::Rejected => {}
            }
        }
        ExecOutcome::Error => {
            // Transient execution failure: the intent stays VALIDATED so a
            // retry CONFIRM (new signal id) can pick the setup up again.
            warn!(signal_id = %signal_id, reason = ?report.reason, "execution errored — intent left VALIDATED");
        }
        _ => {
            let _ = state
                .shadow
                .confirm_execution(&signal_id, Fill::missed(), phase.phase);
        }
    }

    Ok(ResponseEnvelope::ok_with_detail(
        &signal_id,
        serde_json::to_value(&report).unwrap_or_default(),
    ))
}

async fn handle_abort(
    state: &Arc<AppState>,
    payload: &SignalPayload,
) -> Result<ResponseEnvelope, EngineError> {
    let signal_id = payload.signal_id.clone().unwrap_or_default();
    let symbol = payload.symbol.clone().unwrap_or_default();

    let had_prepared = state.prepared.write().remove(&signal_id).is_some();
    let cancelled_chase = state.chases.cancel(&signal_id);
    state.shadow.reject_intent(&signal_id, "ABORT");

    if !had_prepared && !cancelled_chase && state.shadow.is_zombie_signal(&symbol, &signal_id) {
        // Nothing to abort anywhere: acknowledge and ignore.
        return Ok(ResponseEnvelope::ok_with_detail(
            &signal_id,
            serde_json::json!({ "result": codes::ZOMBIE_SIGNAL_IGNORED }),
        ));
    }

    info!(
        signal_id = %signal_id,
        had_prepared,
        cancelled_chase,
        "ABORT processed"
    );

    Ok(ResponseEnvelope::ok_with_detail(
        &signal_id,
        serde_json::json!({
            "aborted_prepared": had_prepared,
            "cancelled_chase": cancelled_chase,
        }),
    ))
}
