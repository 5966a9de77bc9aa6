//! Idempotency-Key replay cache.
//!
//! The first response to a keyed request is stored per
//! (identity, game, action, key) and replayed verbatim to retries until it
//! ages out.

use crate::clock::Clock;
use crate::config::capped_seconds;
use crate::event::{EventId, Identity};
use crate::rate_limit::Action;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub identity: Identity,
    pub event_id: EventId,
    pub action: Action,
    pub key: String,
}

/// Response recorded for a keyed request
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Value,
    pub stored_at: DateTime<Utc>,
}

/// Replay cache with automatic expiration
#[derive(Clone)]
pub struct IdempotencyCache {
    entries: Arc<Mutex<HashMap<IdempotencyKey, CachedResponse>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl IdempotencyCache {
    pub fn new(ttl_seconds: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: capped_seconds(ttl_seconds.max(0) as u64),
            clock,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<IdempotencyKey, CachedResponse>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Previously stored response, if still fresh.
    pub fn lookup(&self, key: &IdempotencyKey) -> Option<CachedResponse> {
        let mut entries = self.entries();
        let cached = entries.get(key)?.clone();

        if self.clock.now() - cached.stored_at > self.ttl {
            entries.remove(key);
            return None;
        }
        Some(cached)
    }

    /// Record the response for `key`. An existing fresh entry wins.
    pub fn store(&self, key: IdempotencyKey, status: u16, body: Value) -> CachedResponse {
        let now = self.clock.now();
        let mut entries = self.entries();

        let fresh = |c: &CachedResponse| now - c.stored_at <= self.ttl;
        if let Some(existing) = entries.get(&key).filter(|c| fresh(c)) {
            return existing.clone();
        }

        let cached = CachedResponse {
            status,
            body,
            stored_at: now,
        };
        entries.insert(key, cached.clone());
        cached
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, cached| now - cached.stored_at <= self.ttl);
        before - entries.len()
    }

    pub fn count(&self) -> usize {
        self.entries().len()
    }
}

/// Background task to periodically drop expired replay entries
pub async fn run_idempotency_cleanup(cache: IdempotencyCache, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));

    loop {
        interval.tick().await;
        let removed = cache.cleanup_expired();
        tracing::debug!(removed, remaining = cache.count(), "Idempotency cleanup complete");
    }
}
