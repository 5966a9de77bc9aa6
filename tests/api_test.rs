// Integration tests for the games API

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use chrono::Duration;
use huddle::admission::{AdmissionEngine, AdmissionSettings};
use huddle::api::{create_games_router, GamesAppState};
use huddle::auth::BearerIdentityResolver;
use huddle::clock::{Clock, ManualClock};
use huddle::config::{new_runtime_config, SharedRuntimeConfig};
use huddle::event::{EventId, Identity};
use huddle::idempotency::IdempotencyCache;
use huddle::notify::BroadcastSink;
use huddle::rate_limit::RateGate;
use huddle::store::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    engine: Arc<AdmissionEngine>,
    clock: ManualClock,
    runtime_config: SharedRuntimeConfig,
}

fn create_test_app() -> TestApp {
    let clock = ManualClock::starting_now();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let engine = Arc::new(AdmissionEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&shared),
        Arc::new(BroadcastSink::default()),
        AdmissionSettings::default(),
    ));
    let runtime_config = new_runtime_config();

    let state = GamesAppState {
        engine: Arc::clone(&engine),
        identity_resolver: Arc::new(BearerIdentityResolver),
        rate_gate: Arc::new(RateGate::new(Arc::clone(&shared))),
        runtime_config: runtime_config.clone(),
        idempotency: IdempotencyCache::new(600, shared),
    };

    TestApp {
        router: create_games_router(state),
        engine,
        clock,
        runtime_config,
    }
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn send(
    app: &TestApp,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
    idempotency_key: Option<&str>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    if let Some(key) = idempotency_key {
        builder = builder.header("Idempotency-Key", key);
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    Reply {
        status,
        headers,
        body,
    }
}

async fn create_game(app: &TestApp, spec: Value) -> String {
    let reply = send(app, "POST", "/api/games", Some("host"), Some(spec), None).await;
    assert_eq!(reply.status, StatusCode::CREATED);
    reply.body["eventId"].as_str().unwrap().to_string()
}

async fn join(app: &TestApp, game: &str, who: &str) -> Reply {
    send(app, "POST", &format!("/api/games/{}/join", game), Some(who), None, None).await
}

#[tokio::test]
async fn test_create_game_returns_capacity_status() {
    let app = create_test_app();

    let reply = send(
        &app,
        "POST",
        "/api/games",
        Some("host"),
        Some(json!({ "capacity": 4, "waitlistEnabled": true })),
        None,
    )
    .await;

    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body["capacity"], 4);
    assert_eq!(reply.body["remainingSlots"], 4);
    assert_eq!(reply.body["waitlistEnabled"], true);

    let id = reply.body["eventId"].as_str().unwrap();
    let status = send(&app, "GET", &format!("/api/games/{}", id), None, None, None).await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["participants"], 0);
}

#[tokio::test]
async fn test_create_game_with_zero_capacity_is_bad_request() {
    let app = create_test_app();

    let reply = send(
        &app,
        "POST",
        "/api/games",
        Some("host"),
        Some(json!({ "capacity": 0 })),
        None,
    )
    .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 2 })).await;

    let reply = send(&app, "POST", &format!("/api/games/{}/join", game), None, None, None).await;

    assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_game_is_not_found() {
    let app = create_test_app();

    let status = send(&app, "GET", "/api/games/nope", None, None, None).await;
    assert_eq!(status.status, StatusCode::NOT_FOUND);

    let reply = join(&app, "nope", "alice").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["reason"], "not_found");
}

#[tokio::test]
async fn test_join_until_full() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;

    let first = join(&app, &game, "alice").await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.body["outcome"], "admitted");
    assert_eq!(first.body["alreadyParticipant"], false);

    let again = join(&app, &game, "alice").await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["alreadyParticipant"], true);

    let full = join(&app, &game, "bob").await;
    assert_eq!(full.status, StatusCode::CONFLICT);
    assert_eq!(full.body["outcome"], "rejected");
    assert_eq!(full.body["reason"], "full");
}

#[tokio::test]
async fn test_overflow_join_is_waitlisted() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1, "waitlistEnabled": true })).await;

    join(&app, &game, "alice").await;

    let bob = join(&app, &game, "bob").await;
    assert_eq!(bob.status, StatusCode::ACCEPTED);
    assert_eq!(bob.body["outcome"], "waitlisted");
    assert_eq!(bob.body["position"], 1);

    let carol = join(&app, &game, "carol").await;
    assert_eq!(carol.body["position"], 2);

    // Retrying reports the standing position
    let bob_again = join(&app, &game, "bob").await;
    assert_eq!(bob_again.status, StatusCode::ACCEPTED);
    assert_eq!(bob_again.body["position"], 1);

    let view = send(
        &app,
        "GET",
        &format!("/api/games/{}/waitlist", game),
        Some("carol"),
        None,
        None,
    )
    .await;
    assert_eq!(view.status, StatusCode::OK);
    assert_eq!(view.body["entries"].as_array().unwrap().len(), 2);
    assert_eq!(view.body["entries"][0]["identity"], "bob");
    assert_eq!(view.body["yourPosition"], 2);
}

#[tokio::test]
async fn test_leave_promotes_and_promoted_identity_confirms() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1, "waitlistEnabled": true })).await;

    join(&app, &game, "alice").await;
    join(&app, &game, "bob").await;

    let leave = send(
        &app,
        "DELETE",
        &format!("/api/games/{}/leave", game),
        Some("alice"),
        None,
        None,
    )
    .await;
    assert_eq!(leave.status, StatusCode::OK);
    assert_eq!(leave.body["from"], "confirmed");
    assert_eq!(leave.body["promoted"], json!(["bob"]));

    // Bob already holds the freed unit; asking again renews it
    let hold = send(&app, "POST", &format!("/api/games/{}/hold", game), Some("bob"), None, None).await;
    assert_eq!(hold.status, StatusCode::CREATED);
    assert_eq!(hold.body["renewed"], true);
    let hold_id = hold.body["hold"]["holdId"].as_str().unwrap().to_string();

    let confirm = send(
        &app,
        "POST",
        &format!("/api/games/{}/confirm", game),
        Some("bob"),
        Some(json!({ "holdId": hold_id })),
        None,
    )
    .await;
    assert_eq!(confirm.status, StatusCode::OK);
    assert_eq!(confirm.body["outcome"], "confirmed");

    let participants = send(
        &app,
        "GET",
        &format!("/api/games/{}/participants", game),
        None,
        None,
        None,
    )
    .await;
    let list = participants.body["participants"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["identity"], "bob");
}

#[tokio::test]
async fn test_leave_without_participation_is_not_found() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;

    let leave = send(
        &app,
        "DELETE",
        &format!("/api/games/{}/leave", game),
        Some("ghost"),
        None,
        None,
    )
    .await;

    assert_eq!(leave.status, StatusCode::NOT_FOUND);
    assert_eq!(leave.body["outcome"], "not_found");
}

#[tokio::test]
async fn test_confirm_after_expiry_is_gone() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;

    let hold = send(
        &app,
        "POST",
        &format!("/api/games/{}/hold?ttl=30", game),
        Some("alice"),
        None,
        None,
    )
    .await;
    assert_eq!(hold.status, StatusCode::CREATED);
    assert_eq!(hold.body["renewed"], false);
    let hold_id = hold.body["hold"]["holdId"].as_str().unwrap().to_string();

    app.clock.advance(Duration::seconds(31));

    let confirm = send(
        &app,
        "POST",
        &format!("/api/games/{}/confirm", game),
        Some("alice"),
        Some(json!({ "holdId": hold_id })),
        None,
    )
    .await;
    assert_eq!(confirm.status, StatusCode::GONE);

    // The unit is free again
    let bob = join(&app, &game, "bob").await;
    assert_eq!(bob.status, StatusCode::OK);
}

/// Seconds between a hold's creation and its expiry.
fn hold_lifetime(hold: &Value) -> i64 {
    let at = |field: &str| {
        chrono::DateTime::parse_from_rfc3339(hold[field].as_str().unwrap()).unwrap()
    };
    (at("expiresAt") - at("createdAt")).num_seconds()
}

#[tokio::test]
async fn test_non_positive_ttl_gets_the_default_hold() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 3 })).await;

    for (who, ttl) in [("alice", "0"), ("bob", "-5")] {
        let hold = send(
            &app,
            "POST",
            &format!("/api/games/{}/hold?ttl={}", game, ttl),
            Some(who),
            None,
            None,
        )
        .await;
        assert_eq!(hold.status, StatusCode::CREATED);
        assert_eq!(hold_lifetime(&hold.body["hold"]), 120);
    }
}

#[tokio::test]
async fn test_huge_ttl_is_capped() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;

    let hold = send(
        &app,
        "POST",
        &format!("/api/games/{}/hold?ttl={}", game, i64::MAX),
        Some("alice"),
        None,
        None,
    )
    .await;

    assert_eq!(hold.status, StatusCode::CREATED);
    assert_eq!(hold_lifetime(&hold.body["hold"]), 600);
}

#[tokio::test]
async fn test_confirm_by_other_identity_is_forbidden() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;

    let hold = send(&app, "POST", &format!("/api/games/{}/hold", game), Some("alice"), None, None).await;
    let hold_id = hold.body["hold"]["holdId"].as_str().unwrap().to_string();

    let confirm = send(
        &app,
        "POST",
        &format!("/api/games/{}/confirm", game),
        Some("mallory"),
        Some(json!({ "holdId": hold_id })),
        None,
    )
    .await;

    assert_eq!(confirm.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_hold_on_full_game_conflicts() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;
    join(&app, &game, "alice").await;

    let hold = send(&app, "POST", &format!("/api/games/{}/hold", game), Some("bob"), None, None).await;

    assert_eq!(hold.status, StatusCode::CONFLICT);
    assert_eq!(hold.body["reason"], "full");
}

#[tokio::test]
async fn test_cancel_hold() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;

    let hold = send(&app, "POST", &format!("/api/games/{}/hold", game), Some("alice"), None, None).await;
    let hold_id = hold.body["hold"]["holdId"].as_str().unwrap().to_string();
    let uri = format!("/api/games/{}/holds/{}", game, hold_id);

    let stranger = send(&app, "DELETE", &uri, Some("mallory"), None, None).await;
    assert_eq!(stranger.status, StatusCode::FORBIDDEN);

    let cancel = send(&app, "DELETE", &uri, Some("alice"), None, None).await;
    assert_eq!(cancel.status, StatusCode::OK);
    assert_eq!(cancel.body["outcome"], "cancelled");

    let again = send(&app, "DELETE", &uri, Some("alice"), None, None).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.body["status"], "CANCELLED");

    let unknown = format!("/api/games/{}/holds/{}", game, uuid::Uuid::new_v4());
    let missing = send(&app, "DELETE", &unknown, Some("alice"), None, None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_idempotency_key_replays_first_response() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 1 })).await;
    let leave_uri = format!("/api/games/{}/leave", game);

    join(&app, &game, "alice").await;

    let first = send(&app, "DELETE", &leave_uri, Some("alice"), None, Some("leave-1")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert!(first.headers.get("idempotent-replay").is_none());

    let retry = send(&app, "DELETE", &leave_uri, Some("alice"), None, Some("leave-1")).await;
    assert_eq!(retry.status, StatusCode::OK);
    assert_eq!(retry.body, first.body);
    assert_eq!(retry.headers["idempotent-replay"], "true");

    // A fresh key runs the operation again
    let fresh = send(&app, "DELETE", &leave_uri, Some("alice"), None, Some("leave-2")).await;
    assert_eq!(fresh.status, StatusCode::NOT_FOUND);

    let event_id = EventId::new(game);
    let participation = app
        .engine
        .participation(&event_id, &Identity::from("alice"))
        .unwrap();
    assert_eq!(participation, Some(huddle::event::Participation::None));
}

#[tokio::test]
async fn test_rate_limited_requests_get_retry_after() {
    let app = create_test_app();
    let game = create_game(&app, json!({ "capacity": 10 })).await;
    {
        let mut cfg = app.runtime_config.write().unwrap();
        cfg.rate_limit_per_identity = 2;
    }

    join(&app, &game, "alice").await;
    join(&app, &game, "alice").await;
    let limited = join(&app, &game, "alice").await;

    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["scope"], "identity");
    let retry_after: u64 = limited.headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);

    // Other identities are unaffected
    let bob = join(&app, &game, "bob").await;
    assert_eq!(bob.status, StatusCode::OK);
    assert_eq!(app.engine.metrics.get_snapshot().rate_limited, 1);
}
