use super::{capped_millis, MAX_DURATION_SECONDS};
use crate::rate_limit::WindowLimit;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Runtime-configurable limits. Changes via PUT /api/admin/config take effect immediately
/// without restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub rate_limit_enabled: bool,
    /// Requests allowed per identity per identity window
    pub rate_limit_per_identity: u64,
    pub rate_limit_identity_window_ms: u64,
    /// Requests allowed per action class (all identities) per action window
    pub rate_limit_per_action: u64,
    pub rate_limit_action_window_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rate_limit_enabled: true,
            rate_limit_per_identity: 30,
            rate_limit_identity_window_ms: 60_000,
            rate_limit_per_action: 200,
            rate_limit_action_window_ms: 1_000,
        }
    }
}

impl RuntimeConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HUDDLE_RATE_LIMIT_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                cfg.rate_limit_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_RATE_LIMIT_PER_IDENTITY") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.rate_limit_per_identity = n;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_RATE_LIMIT_IDENTITY_WINDOW_MS") {
            match v.parse::<u64>() {
                Ok(n) if valid_window_ms(n) => cfg.rate_limit_identity_window_ms = n,
                _ => warn!(value = %v, "Ignoring invalid HUDDLE_RATE_LIMIT_IDENTITY_WINDOW_MS"),
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_RATE_LIMIT_PER_ACTION") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.rate_limit_per_action = n;
            }
        }
        if let Ok(v) = std::env::var("HUDDLE_RATE_LIMIT_ACTION_WINDOW_MS") {
            match v.parse::<u64>() {
                Ok(n) if valid_window_ms(n) => cfg.rate_limit_action_window_ms = n,
                _ => warn!(value = %v, "Ignoring invalid HUDDLE_RATE_LIMIT_ACTION_WINDOW_MS"),
            }
        }

        cfg
    }

    /// Rejects windows that are empty or longer than [`MAX_DURATION_SECONDS`].
    pub fn validate(&self) -> Result<(), String> {
        for (name, ms) in [
            ("rate_limit_identity_window_ms", self.rate_limit_identity_window_ms),
            ("rate_limit_action_window_ms", self.rate_limit_action_window_ms),
        ] {
            if !valid_window_ms(ms) {
                return Err(format!(
                    "{} must be between 1 and {}",
                    name,
                    MAX_DURATION_SECONDS * 1000
                ));
            }
        }
        Ok(())
    }

    pub fn identity_limit(&self) -> WindowLimit {
        WindowLimit {
            max_requests: self.rate_limit_per_identity,
            window: capped_millis(self.rate_limit_identity_window_ms),
        }
    }

    pub fn action_limit(&self) -> WindowLimit {
        WindowLimit {
            max_requests: self.rate_limit_per_action,
            window: capped_millis(self.rate_limit_action_window_ms),
        }
    }
}

fn valid_window_ms(ms: u64) -> bool {
    (1..=MAX_DURATION_SECONDS * 1000).contains(&ms)
}

pub type SharedRuntimeConfig = Arc<RwLock<RuntimeConfig>>;

pub fn new_runtime_config() -> SharedRuntimeConfig {
    Arc::new(RwLock::new(RuntimeConfig::from_env()))
}
