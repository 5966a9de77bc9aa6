// HTTP APIs

mod error;
pub mod admin;
pub mod games;

pub use admin::{create_admin_router, AdminAppState, RuntimeConfigUpdate};
pub use error::ApiError;
pub use games::{create_games_router, GamesAppState};

use crate::admission::AdmissionEngine;
use std::sync::Arc;
use tracing::error;

/// Runs synchronous engine work on the blocking thread pool.
///
/// The engine waits on per-game locks and store I/O, neither of which may
/// park an async worker.
pub(crate) async fn on_engine<T, F>(engine: &Arc<AdmissionEngine>, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AdmissionEngine) -> Result<T, ApiError> + Send + 'static,
{
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || work(&engine))
        .await
        .map_err(|e| {
            error!(error = %e, "Engine task did not complete");
            ApiError::Internal
        })?
}
