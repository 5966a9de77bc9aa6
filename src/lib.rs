// Game model, holds, waitlist entries and validation
pub mod event;

// Admission engine: capacity, holds, waitlist promotion, sweeping
pub mod admission;

// Persistence behind the admission engine
pub mod store;

// Time source
pub mod clock;

// HTTP APIs
pub mod api;

// Caller identity resolution
pub mod auth;

// Static and runtime configuration
pub mod config;

// Idempotency-Key replay cache
pub mod idempotency;

// Admission counters
pub mod metrics;

// Outbound notifications
pub mod notify;

// Per-identity and per-action throttling
pub mod rate_limit;
