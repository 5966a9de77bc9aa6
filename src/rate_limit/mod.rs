// Rate gate for admission requests
//
// Two independent fixed-window throttles: one per action class across all
// identities, one per identity. Each key tracks (window_start, count) and
// resets once a full window has elapsed, so bursts straddling a window
// boundary are tolerated. Limits are read from SharedRuntimeConfig on each
// check, so admin API changes take effect immediately.

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::event::Identity;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Action classes throttled at the API boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Join,
    Leave,
    Hold,
    Confirm,
    Cancel,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Join => "join",
            Action::Leave => "leave",
            Action::Hold => "hold",
            Action::Confirm => "confirm",
            Action::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which throttle rejected a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    Identity,
    Action,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited {
        scope: RateScope,
        /// Time until the offending window resets
        retry_after: Duration,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// `max_requests` per `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLimit {
    pub max_requests: u64,
    pub window: Duration,
}

/// Counter for a single key.
struct Window {
    start: DateTime<Utc>,
    count: u64,
}

impl Window {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            start: now,
            count: 0,
        }
    }

    /// Counts one request. Returns the time until reset when over the limit.
    fn try_admit(&mut self, now: DateTime<Utc>, limit: WindowLimit) -> Result<(), Duration> {
        if now - self.start >= limit.window {
            self.start = now;
            self.count = 0;
        }

        self.count += 1;
        if self.count <= limit.max_requests {
            Ok(())
        } else {
            let until_reset = match self.start.checked_add_signed(limit.window) {
                Some(resets_at) => resets_at - now,
                None => limit.window,
            };
            Err(until_reset.max(Duration::milliseconds(1)))
        }
    }
}

/// Keyed fixed-window counters.
///
/// Windows are created lazily on first request. State is in-memory only
/// (resets on restart).
pub struct FixedWindowLimiter {
    windows: DashMap<String, Window>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Count one request for `key` at `now`.
    ///
    /// Returns `Err(retry_after)` if the key is over its limit.
    pub fn check_and_consume(
        &self,
        key: &str,
        limit: WindowLimit,
        now: DateTime<Utc>,
    ) -> Result<(), Duration> {
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window::new(now));
        window.try_admit(now, limit)
    }

    /// Drop windows idle for longer than `idle`. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| now - w.start < idle);
        before - self.windows.len()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Front-door throttle evaluated before any admission state is touched.
pub struct RateGate {
    identities: FixedWindowLimiter,
    actions: FixedWindowLimiter,
    clock: Arc<dyn Clock>,
}

impl RateGate {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            identities: FixedWindowLimiter::new(),
            actions: FixedWindowLimiter::new(),
            clock,
        }
    }

    /// Check both throttles for one request.
    ///
    /// Always `Allowed` when rate limiting is disabled in `config`.
    pub fn check(&self, identity: &Identity, action: Action, config: &RuntimeConfig) -> RateDecision {
        if !config.rate_limit_enabled {
            return RateDecision::Allowed;
        }
        let now = self.clock.now();

        if let Err(retry_after) =
            self.identities
                .check_and_consume(identity.as_str(), config.identity_limit(), now)
        {
            return RateDecision::Limited {
                scope: RateScope::Identity,
                retry_after,
            };
        }

        if let Err(retry_after) =
            self.actions
                .check_and_consume(action.as_str(), config.action_limit(), now)
        {
            return RateDecision::Limited {
                scope: RateScope::Action,
                retry_after,
            };
        }

        RateDecision::Allowed
    }

    /// Drop idle windows from both throttles.
    pub fn prune(&self, config: &RuntimeConfig) -> usize {
        let now = self.clock.now();
        let idle = config
            .identity_limit()
            .window
            .max(config.action_limit().window);
        self.identities.prune(now, idle) + self.actions.prune(now, idle)
    }

    pub fn tracked_keys(&self) -> usize {
        self.identities.len() + self.actions.len()
    }
}

/// Background task that periodically drops idle rate windows
pub async fn run_rate_window_cleanup(
    gate: Arc<RateGate>,
    runtime_config: crate::config::SharedRuntimeConfig,
    interval_seconds: u64,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        let config = match runtime_config.read() {
            Ok(cfg) => cfg.clone(),
            Err(_) => {
                tracing::error!("RuntimeConfig lock poisoned, skipping rate window cleanup");
                continue;
            }
        };
        let removed = gate.prune(&config);
        tracing::debug!(removed, remaining = gate.tracked_keys(), "Rate window cleanup complete");
    }
}
