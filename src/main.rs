use anyhow::{Context, Result};
use huddle::admission::{AdmissionEngine, AdmissionSettings, HoldSweeper};
use huddle::api::{create_admin_router, create_games_router, AdminAppState, GamesAppState};
use huddle::auth::BearerIdentityResolver;
use huddle::clock::{Clock, SystemClock};
use huddle::config::{load_config, HuddleConfig, RuntimeConfig, StoreBackend};
use huddle::idempotency::{run_idempotency_cleanup, IdempotencyCache};
use huddle::notify::{run_notification_log, BroadcastSink};
use huddle::rate_limit::{run_rate_window_cleanup, RateGate};
use huddle::store::{AdmissionStore, MemoryStore, SqliteStore};
use std::sync::{Arc, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=info".into()),
        )
        .init();

    info!("Huddle starting...");

    let config = match std::env::var("HUDDLE_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => {
            info!("HUDDLE_CONFIG not set, using defaults");
            HuddleConfig::default()
        }
    };

    let store: Arc<dyn AdmissionStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; admission state is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Sqlite => {
            let path = config.store.path.to_string_lossy().to_string();
            info!(path = %path, "Opening SQLite store");
            Arc::new(SqliteStore::new(&path).context("Failed to open SQLite store")?)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sink = Arc::new(BroadcastSink::default());
    let notifications = sink.subscribe();

    let engine = Arc::new(AdmissionEngine::new(
        store,
        Arc::clone(&clock),
        sink,
        AdmissionSettings::from_config(&config),
    ));

    let runtime_config = Arc::new(RwLock::new(RuntimeConfig::from_env()));
    let rate_gate = Arc::new(RateGate::new(Arc::clone(&clock)));
    let idempotency = IdempotencyCache::new(config.idempotency.ttl_seconds, Arc::clone(&clock));

    // Background tasks
    let sweeper = HoldSweeper::new(Arc::clone(&engine), config.sweep.clone());
    tokio::spawn(async move {
        if let Err(e) = sweeper.run_sweep_loop().await {
            error!(error = %e, "Hold sweeper exited");
        }
    });
    tokio::spawn(run_rate_window_cleanup(
        Arc::clone(&rate_gate),
        Arc::clone(&runtime_config),
        config.rate_limit.cleanup_interval_seconds,
    ));
    tokio::spawn(run_idempotency_cleanup(
        idempotency.clone(),
        config.idempotency.cleanup_interval_seconds,
    ));
    tokio::spawn(run_notification_log(notifications));

    let admin_token = std::env::var("HUDDLE_ADMIN_TOKEN").ok();
    if admin_token.is_none() {
        warn!("HUDDLE_ADMIN_TOKEN not set, admin API is unrestricted");
    }

    let app = create_games_router(GamesAppState {
        engine: Arc::clone(&engine),
        identity_resolver: Arc::new(BearerIdentityResolver),
        rate_gate,
        runtime_config: Arc::clone(&runtime_config),
        idempotency,
    })
    .merge(create_admin_router(AdminAppState {
        engine,
        runtime_config,
        admin_token,
    }))
    .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}
