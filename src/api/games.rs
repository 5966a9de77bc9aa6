use super::error::ApiError;
use super::on_engine;
use crate::admission::{
    AdmissionEngine, CancelOutcome, ConfirmOutcome, HoldOutcome, JoinOutcome, LeaveOutcome,
    Promotion, RejectReason,
};
use crate::auth::IdentityResolver;
use crate::config::{capped_seconds, SharedRuntimeConfig};
use crate::event::{EventId, HoldId, Identity, NewEvent};
use crate::idempotency::{IdempotencyCache, IdempotencyKey};
use crate::rate_limit::{Action, RateDecision, RateGate};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared state for the games API
#[derive(Clone)]
pub struct GamesAppState {
    pub engine: Arc<AdmissionEngine>,
    pub identity_resolver: Arc<dyn IdentityResolver>,
    pub rate_gate: Arc<RateGate>,
    pub runtime_config: SharedRuntimeConfig,
    pub idempotency: IdempotencyCache,
}

#[derive(Deserialize)]
struct HoldQuery {
    /// Requested hold lifetime in seconds
    ttl: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    hold_id: Uuid,
}

pub fn create_games_router(state: GamesAppState) -> Router {
    Router::new()
        .route("/api/games", post(create_game))
        .route("/api/games/:id", get(get_game))
        .route("/api/games/:id/join", post(join_game))
        .route("/api/games/:id/leave", delete(leave_game))
        .route("/api/games/:id/hold", post(hold_slot))
        .route("/api/games/:id/confirm", post(confirm_hold))
        .route("/api/games/:id/holds/:hold_id", delete(cancel_hold))
        .route("/api/games/:id/participants", get(list_participants))
        .route("/api/games/:id/waitlist", get(list_waitlist))
        .with_state(Arc::new(state))
}

/// POST /api/games - Publish a game
async fn create_game(
    State(state): State<Arc<GamesAppState>>,
    headers: HeaderMap,
    Json(spec): Json<NewEvent>,
) -> Result<Response, ApiError> {
    let host = state.identity_resolver.resolve(&headers)?;
    let status = on_engine(&state.engine, move |engine| {
        let event = engine.create_game(spec)?;
        info!(event_id = %event.id, host = %host, "Game published");
        engine.status(&event.id)?.ok_or(ApiError::Internal)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(status)).into_response())
}

/// GET /api/games/:id - Capacity status
async fn get_game(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let status = on_engine(&state.engine, move |engine| {
        engine
            .status(&event_id)?
            .ok_or_else(|| game_not_found(&event_id))
    })
    .await?;
    Ok(Json(status).into_response())
}

/// POST /api/games/:id/join - RSVP
async fn join_game(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let identity = admit(&state, &headers, Action::Join)?;
    let (game, me) = (event_id.clone(), identity.clone());

    replay_or_run(&state, &headers, &identity, &event_id, Action::Join, move |engine| {
        let reply = match engine.join(&game, &me)? {
            JoinOutcome::Admitted {
                already_participant,
            } => (
                StatusCode::OK,
                json!({ "outcome": "admitted", "alreadyParticipant": already_participant }),
            ),
            JoinOutcome::Waitlisted { position } => (
                StatusCode::ACCEPTED,
                json!({ "outcome": "waitlisted", "position": position }),
            ),
            JoinOutcome::Rejected(RejectReason::AlreadyWaitlisted) => {
                // A retried overflow join reports the standing position
                let position = engine
                    .waitlist(&game, Some(&me))?
                    .and_then(|view| view.your_position);
                (
                    StatusCode::ACCEPTED,
                    json!({ "outcome": "waitlisted", "position": position }),
                )
            }
            JoinOutcome::Rejected(reason) => rejected(reason),
        };
        Ok(reply)
    })
    .await
}

/// DELETE /api/games/:id/leave - Withdraw from any state
async fn leave_game(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let identity = admit(&state, &headers, Action::Leave)?;
    let (game, me) = (event_id.clone(), identity.clone());

    replay_or_run(&state, &headers, &identity, &event_id, Action::Leave, move |engine| {
        let reply = match engine.leave(&game, &me)? {
            LeaveOutcome::Removed { from, promoted } => (
                StatusCode::OK,
                json!({
                    "outcome": "removed",
                    "from": from,
                    "promoted": promoted_identities(&promoted),
                }),
            ),
            LeaveOutcome::NotFound => (
                StatusCode::NOT_FOUND,
                json!({ "outcome": "not_found" }),
            ),
        };
        Ok(reply)
    })
    .await
}

/// POST /api/games/:id/hold?ttl=<seconds> - Reserve one slot provisionally
async fn hold_slot(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
    Query(query): Query<HoldQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let identity = admit(&state, &headers, Action::Hold)?;
    // Zero or negative means "use the default"; the engine caps the rest
    let ttl = query
        .ttl
        .filter(|seconds| *seconds > 0)
        .map(|seconds| capped_seconds(seconds as u64));
    let (game, me) = (event_id.clone(), identity.clone());

    replay_or_run(&state, &headers, &identity, &event_id, Action::Hold, move |engine| {
        let reply = match engine.issue_hold(&game, &me, ttl)? {
            HoldOutcome::Issued { hold, renewed } => (
                StatusCode::CREATED,
                json!({ "outcome": "held", "renewed": renewed, "hold": hold }),
            ),
            HoldOutcome::Rejected(reason) => rejected(reason),
        };
        Ok(reply)
    })
    .await
}

/// POST /api/games/:id/confirm - Turn a hold into a confirmed RSVP
async fn confirm_hold(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ConfirmRequest>,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let identity = admit(&state, &headers, Action::Confirm)?;
    let hold_id = HoldId::from_uuid(request.hold_id);
    let (game, me) = (event_id.clone(), identity.clone());

    replay_or_run(&state, &headers, &identity, &event_id, Action::Confirm, move |engine| {
        let reply = match engine.confirm_hold(&game, hold_id, &me)? {
            ConfirmOutcome::Confirmed => (StatusCode::OK, json!({ "outcome": "confirmed" })),
            ConfirmOutcome::IdentityMismatch => (
                StatusCode::FORBIDDEN,
                json!({ "outcome": "identity_mismatch" }),
            ),
            ConfirmOutcome::NotFound => (StatusCode::NOT_FOUND, json!({ "outcome": "not_found" })),
            ConfirmOutcome::Expired => (StatusCode::GONE, json!({ "outcome": "expired" })),
        };
        Ok(reply)
    })
    .await
}

/// DELETE /api/games/:id/holds/:hold_id - Release a hold
async fn cancel_hold(
    State(state): State<Arc<GamesAppState>>,
    Path((id, hold_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let identity = admit(&state, &headers, Action::Cancel)?;
    let hold_id = HoldId::from_uuid(hold_id);

    let (status, body) = on_engine(&state.engine, move |engine| {
        let Some(hold) = engine.hold(&event_id, hold_id)? else {
            return Ok((StatusCode::NOT_FOUND, json!({ "outcome": "not_found" })));
        };
        if hold.identity != identity {
            return Err(ApiError::Forbidden("hold belongs to another identity".to_string()));
        }

        let reply = match engine.cancel_hold(&event_id, hold_id)? {
            CancelOutcome::Cancelled { promoted } => (
                StatusCode::OK,
                json!({ "outcome": "cancelled", "promoted": promoted_identities(&promoted) }),
            ),
            CancelOutcome::NotFound => (StatusCode::NOT_FOUND, json!({ "outcome": "not_found" })),
            CancelOutcome::NotActive(status) => (
                StatusCode::CONFLICT,
                json!({ "outcome": "not_active", "status": status }),
            ),
        };
        Ok(reply)
    })
    .await?;
    Ok(reply(status, body))
}

/// GET /api/games/:id/participants - Confirmed participants in join order
async fn list_participants(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let participants = on_engine(&state.engine, move |engine| {
        engine
            .participants(&event_id)?
            .ok_or_else(|| game_not_found(&event_id))
    })
    .await?;
    Ok(Json(json!({ "participants": participants })).into_response())
}

/// GET /api/games/:id/waitlist - Queue in promotion order plus the caller's position
async fn list_waitlist(
    State(state): State<Arc<GamesAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let event_id = EventId::new(id);
    let caller = state.identity_resolver.resolve(&headers).ok();
    let view = on_engine(&state.engine, move |engine| {
        engine
            .waitlist(&event_id, caller.as_ref())?
            .ok_or_else(|| game_not_found(&event_id))
    })
    .await?;
    Ok(Json(view).into_response())
}

/// Resolves the caller and runs both throttles before any state is touched.
fn admit(state: &GamesAppState, headers: &HeaderMap, action: Action) -> Result<Identity, ApiError> {
    let identity = state.identity_resolver.resolve(headers)?;

    let config = state
        .runtime_config
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    match state.rate_gate.check(&identity, action, &config) {
        RateDecision::Allowed => Ok(identity),
        RateDecision::Limited { scope, retry_after } => {
            state.engine.metrics.record_rate_limited();
            debug!(identity = %identity, action = %action, scope = ?scope, "Rate limited");
            // Round up to whole seconds for the header
            let millis = retry_after.num_milliseconds().max(1) as u64;
            Err(ApiError::RateLimited {
                scope,
                retry_after_seconds: millis.div_ceil(1000),
            })
        }
    }
}

/// Replays the stored response for a repeated `Idempotency-Key`, otherwise
/// runs `handler` against the engine and stores its response.
async fn replay_or_run<F>(
    state: &GamesAppState,
    headers: &HeaderMap,
    identity: &Identity,
    event_id: &EventId,
    action: Action,
    handler: F,
) -> Result<Response, ApiError>
where
    F: FnOnce(&AdmissionEngine) -> Result<(StatusCode, Value), ApiError> + Send + 'static,
{
    let key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| IdempotencyKey {
            identity: identity.clone(),
            event_id: event_id.clone(),
            action,
            key: k.to_string(),
        });

    let Some(key) = key else {
        let (status, body) = on_engine(&state.engine, handler).await?;
        return Ok(reply(status, body));
    };

    if let Some(cached) = state.idempotency.lookup(&key) {
        debug!(event_id = %event_id, action = %action, "Replaying idempotent response");
        let status = StatusCode::from_u16(cached.status).map_err(|_| ApiError::Internal)?;
        let mut resp = reply(status, cached.body);
        resp.headers_mut()
            .insert("idempotent-replay", axum::http::HeaderValue::from_static("true"));
        return Ok(resp);
    }

    let (status, body) = on_engine(&state.engine, handler).await?;
    let stored = state.idempotency.store(key, status.as_u16(), body);
    let status = StatusCode::from_u16(stored.status).map_err(|_| ApiError::Internal)?;
    Ok(reply(status, stored.body))
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn rejected(reason: RejectReason) -> (StatusCode, Value) {
    let status = match reason {
        RejectReason::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::CONFLICT,
    };
    (status, json!({ "outcome": "rejected", "reason": reason }))
}

fn promoted_identities(promoted: &[Promotion]) -> Vec<&str> {
    promoted.iter().map(|p| p.identity.as_str()).collect()
}

fn game_not_found(event_id: &EventId) -> ApiError {
    ApiError::NotFound(format!("game {} not found", event_id))
}
