// Integration tests for the per-identity and per-action rate gate
//
// Games and admin routers share one SharedRuntimeConfig, so limits changed
// through PUT /api/admin/config apply to the very next join.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Duration;
use huddle::admission::{AdmissionEngine, AdmissionSettings};
use huddle::api::{create_admin_router, create_games_router, AdminAppState, GamesAppState};
use huddle::auth::BearerIdentityResolver;
use huddle::clock::{Clock, ManualClock};
use huddle::config::{new_runtime_config, SharedRuntimeConfig};
use huddle::event::{EventId, NewEvent};
use huddle::idempotency::IdempotencyCache;
use huddle::notify::BroadcastSink;
use huddle::rate_limit::RateGate;
use huddle::store::MemoryStore;
use std::sync::Arc;
use tower::ServiceExt;

// ── Test state & router ───────────────────────────────────────────────────────

struct Harness {
    app: Router,
    clock: ManualClock,
    runtime_config: SharedRuntimeConfig,
    game: EventId,
}

fn create_harness() -> Harness {
    let clock = ManualClock::starting_now();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let engine = Arc::new(AdmissionEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&shared),
        Arc::new(BroadcastSink::default()),
        AdmissionSettings::default(),
    ));
    let game = engine
        .create_game(NewEvent {
            capacity: Some(1000),
            ..NewEvent::default()
        })
        .unwrap()
        .id;

    let runtime_config = new_runtime_config();
    let games = create_games_router(GamesAppState {
        engine: Arc::clone(&engine),
        identity_resolver: Arc::new(BearerIdentityResolver),
        rate_gate: Arc::new(RateGate::new(Arc::clone(&shared))),
        runtime_config: runtime_config.clone(),
        idempotency: IdempotencyCache::new(600, shared),
    });
    let admin = create_admin_router(AdminAppState {
        engine,
        runtime_config: runtime_config.clone(),
        admin_token: None,
    });

    Harness {
        app: games.merge(admin),
        clock,
        runtime_config,
        game,
    }
}

fn set_limits(h: &Harness, per_identity: u64, per_action: u64) {
    let mut cfg = h.runtime_config.write().unwrap();
    cfg.rate_limit_per_identity = per_identity;
    cfg.rate_limit_per_action = per_action;
}

async fn join(h: &Harness, who: &str) -> Response {
    h.app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/games/{}/join", h.game))
                .header("Authorization", format!("Bearer {}", who))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Requests within the identity limit all succeed.
#[tokio::test]
async fn test_under_limit_passes() {
    let h = create_harness();
    set_limits(&h, 5, 100);

    for _ in 0..5 {
        assert_eq!(join(&h, "alice").await.status(), StatusCode::OK);
    }
}

/// One request over the identity limit is rejected with 429.
#[tokio::test]
async fn test_over_identity_limit_returns_429() {
    let h = create_harness();
    set_limits(&h, 3, 100);

    for _ in 0..3 {
        join(&h, "alice").await;
    }
    let resp = join(&h, "alice").await;

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
    assert_eq!(body_json(resp).await["scope"], "identity");
}

/// The action throttle spans identities.
#[tokio::test]
async fn test_action_limit_spans_identities() {
    let h = create_harness();
    set_limits(&h, 100, 3);

    for who in ["a", "b", "c"] {
        assert_eq!(join(&h, who).await.status(), StatusCode::OK);
    }
    let resp = join(&h, "d").await;

    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["retry-after"], "1");
    assert_eq!(body_json(resp).await["scope"], "action");
}

/// A fresh window accepts requests again.
#[tokio::test]
async fn test_window_resets() {
    let h = create_harness();
    set_limits(&h, 1, 100);

    assert_eq!(join(&h, "alice").await.status(), StatusCode::OK);
    assert_eq!(join(&h, "alice").await.status(), StatusCode::TOO_MANY_REQUESTS);

    h.clock.advance(Duration::seconds(61));

    assert_eq!(join(&h, "alice").await.status(), StatusCode::OK);
}

/// Disabling the gate lets everything through.
#[tokio::test]
async fn test_disabled_gate_never_limits() {
    let h = create_harness();
    set_limits(&h, 1, 1);
    h.runtime_config.write().unwrap().rate_limit_enabled = false;

    for _ in 0..10 {
        assert_eq!(join(&h, "alice").await.status(), StatusCode::OK);
    }
}

/// Limits changed through the admin API take effect on the next request.
#[tokio::test]
async fn test_admin_update_applies_immediately() {
    let h = create_harness();

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/api/admin/config")
                .header("Content-Type", "application/json")
                .body(Body::from(r#"{"rate_limit_per_identity": 1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(join(&h, "alice").await.status(), StatusCode::OK);
    assert_eq!(join(&h, "alice").await.status(), StatusCode::TOO_MANY_REQUESTS);
}
