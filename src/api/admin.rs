use super::error::ApiError;
use super::on_engine;
use crate::admission::{AdmissionEngine, CapacityOutcome};
use crate::auth::validate_admin_token;
use crate::config::SharedRuntimeConfig;
use crate::event::EventId;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// State for the admin API.
#[derive(Clone)]
pub struct AdminAppState {
    pub engine: Arc<AdmissionEngine>,
    pub runtime_config: SharedRuntimeConfig,
    /// Bearer token required by every mutating admin route. None = unrestricted.
    pub admin_token: Option<String>,
}

/// Partial update body. Only fields present in the request are changed.
#[derive(Deserialize)]
pub struct RuntimeConfigUpdate {
    pub rate_limit_enabled: Option<bool>,
    pub rate_limit_per_identity: Option<u64>,
    pub rate_limit_identity_window_ms: Option<u64>,
    pub rate_limit_per_action: Option<u64>,
    pub rate_limit_action_window_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct PromoteRequest {
    count: Option<usize>,
}

#[derive(Deserialize)]
struct CapacityRequest {
    /// New capacity; null means unlimited
    capacity: Option<u32>,
}

pub fn create_admin_router(state: AdminAppState) -> Router {
    Router::new()
        .route("/api/admin/config", get(get_config).put(put_config))
        .route("/api/admin/games/:id/promote", post(promote))
        .route("/api/admin/games/:id/capacity", put(set_capacity))
        .route("/api/admin/sweep", post(sweep))
        .route("/api/admin/metrics", get(get_metrics))
        .with_state(Arc::new(state))
}

fn require_admin(state: &AdminAppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if validate_admin_token(headers, &state.admin_token) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("Unauthorized".to_string()))
    }
}

/// GET /api/admin/config - current RuntimeConfig.
async fn get_config(State(state): State<Arc<AdminAppState>>) -> Response {
    let cfg = state
        .runtime_config
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    Json(cfg).into_response()
}

/// PUT /api/admin/config - partial update. Requires HUDDLE_ADMIN_TOKEN bearer.
async fn put_config(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
    Json(update): Json<RuntimeConfigUpdate>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;

    let mut cfg = state
        .runtime_config
        .write()
        .unwrap_or_else(|e| e.into_inner());
    let mut next = cfg.clone();

    if let Some(v) = update.rate_limit_enabled {
        next.rate_limit_enabled = v;
    }
    if let Some(v) = update.rate_limit_per_identity {
        next.rate_limit_per_identity = v;
    }
    if let Some(v) = update.rate_limit_identity_window_ms {
        next.rate_limit_identity_window_ms = v;
    }
    if let Some(v) = update.rate_limit_per_action {
        next.rate_limit_per_action = v;
    }
    if let Some(v) = update.rate_limit_action_window_ms {
        next.rate_limit_action_window_ms = v;
    }
    // Nothing is applied unless the whole update is valid
    next.validate().map_err(ApiError::BadRequest)?;

    *cfg = next;
    info!(config = ?*cfg, "Runtime config updated");
    Ok(Json(cfg.clone()).into_response())
}

/// POST /api/admin/games/:id/promote - promote up to `count` (default 1) waitlisted identities
async fn promote(
    State(state): State<Arc<AdminAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<PromoteRequest>>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;

    let event_id = EventId::new(id);
    let count = body.map(|Json(b)| b).unwrap_or_default().count.unwrap_or(1);
    let promoted = on_engine(&state.engine, move |engine| {
        if engine.status(&event_id)?.is_none() {
            return Err(ApiError::NotFound(format!("game {} not found", event_id)));
        }
        Ok(engine.promote_up_to(&event_id, count)?)
    })
    .await?;
    Ok(Json(json!({ "promoted": promoted })).into_response())
}

/// PUT /api/admin/games/:id/capacity
async fn set_capacity(
    State(state): State<Arc<AdminAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CapacityRequest>,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;

    let event_id = EventId::new(id);
    let outcome = {
        let event_id = event_id.clone();
        on_engine(&state.engine, move |engine| {
            Ok(engine.set_capacity(&event_id, request.capacity)?)
        })
        .await?
    };
    let resp = match outcome {
        CapacityOutcome::Updated { capacity, promoted } => {
            Json(json!({ "capacity": capacity, "promoted": promoted })).into_response()
        }
        CapacityOutcome::BelowOccupancy { occupied } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "below_occupancy", "occupied": occupied })),
        )
            .into_response(),
        CapacityOutcome::NotFound => {
            return Err(ApiError::NotFound(format!("game {} not found", event_id)))
        }
    };
    Ok(resp)
}

/// POST /api/admin/sweep - run one sweep pass now
async fn sweep(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;

    let report = on_engine(&state.engine, |engine| Ok(engine.sweep()?)).await?;

    let resp = match report {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "already_running" })),
        )
            .into_response(),
    };
    Ok(resp)
}

/// GET /api/admin/metrics - admission counters
async fn get_metrics(
    State(state): State<Arc<AdminAppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.metrics.get_snapshot()).into_response())
}
