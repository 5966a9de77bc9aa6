pub mod runtime;
pub use runtime::{new_runtime_config, RuntimeConfig, SharedRuntimeConfig};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Longest duration accepted for any TTL or window (one year)
pub const MAX_DURATION_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Whole seconds as a duration, capped at [`MAX_DURATION_SECONDS`].
pub fn capped_seconds(seconds: u64) -> chrono::Duration {
    chrono::Duration::seconds(seconds.min(MAX_DURATION_SECONDS) as i64)
}

/// Milliseconds as a duration, capped at [`MAX_DURATION_SECONDS`].
pub fn capped_millis(millis: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(millis.min(MAX_DURATION_SECONDS * 1000) as i64)
}

/// Complete huddle configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HuddleConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub holds: HoldConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Admission state persistence
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// SQLite database file (sqlite backend only)
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_store_path() -> PathBuf {
    PathBuf::from("huddle.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
        }
    }
}

/// Capacity manager tuning
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Load-decide-CAS attempts before a request fails as contended
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,
}

fn default_cas_max_attempts() -> u32 {
    3
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cas_max_attempts: default_cas_max_attempts(),
        }
    }
}

/// Hold lifetime configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HoldConfig {
    /// TTL applied when the caller does not ask for one
    #[serde(default = "default_hold_ttl")]
    pub default_ttl_seconds: u64,
    /// Upper bound for caller-requested TTLs
    #[serde(default = "default_max_hold_ttl")]
    pub max_ttl_seconds: u64,
    /// Holds closer than this to expiry get a one-time "expiring" notice
    #[serde(default = "default_expiring_notice")]
    pub expiring_notice_seconds: u64,
}

fn default_hold_ttl() -> u64 {
    120
}

fn default_max_hold_ttl() -> u64 {
    600
}

fn default_expiring_notice() -> u64 {
    30
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_hold_ttl(),
            max_ttl_seconds: default_max_hold_ttl(),
            expiring_notice_seconds: default_expiring_notice(),
        }
    }
}

/// Hold sweeper configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    5
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_seconds: default_sweep_interval(),
        }
    }
}

/// Idempotency-Key replay cache
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_seconds: i64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_idempotency_ttl() -> i64 {
    600
}

fn default_cleanup_interval() -> u64 {
    60
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_idempotency_ttl(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Rate window housekeeping (limits themselves live in RuntimeConfig)
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<HuddleConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: HuddleConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HuddleConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.admission.cas_max_attempts, 3);
        assert_eq!(config.holds.default_ttl_seconds, 120);
        assert_eq!(config.sweep.interval_seconds, 5);
        assert!(config.sweep.enabled);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind = "127.0.0.1"
            port = 8080

            [store]
            backend = "sqlite"
            path = "/tmp/huddle.db"

            [admission]
            cas_max_attempts = 5

            [holds]
            default_ttl_seconds = 300
            max_ttl_seconds = 900
            expiring_notice_seconds = 60

            [sweep]
            enabled = false
            interval_seconds = 2

            [idempotency]
            ttl_seconds = 120
        "#;

        let config: HuddleConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.path, PathBuf::from("/tmp/huddle.db"));
        assert_eq!(config.admission.cas_max_attempts, 5);
        assert_eq!(config.holds.max_ttl_seconds, 900);
        assert!(!config.sweep.enabled);
        assert_eq!(config.idempotency.ttl_seconds, 120);
        assert_eq!(config.idempotency.cleanup_interval_seconds, 60); // Default
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [holds]
            default_ttl_seconds = 45
        "#;

        let config: HuddleConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.holds.default_ttl_seconds, 45);
        assert_eq!(config.holds.max_ttl_seconds, 600); // Default
        assert_eq!(config.server.port, 3000); // Default
    }

    #[test]
    fn test_durations_are_capped() {
        assert_eq!(capped_seconds(45), chrono::Duration::seconds(45));
        assert_eq!(
            capped_seconds(u64::MAX),
            chrono::Duration::seconds(MAX_DURATION_SECONDS as i64)
        );
        assert_eq!(
            capped_millis(u64::MAX),
            chrono::Duration::seconds(MAX_DURATION_SECONDS as i64)
        );
    }

    #[test]
    fn test_huge_runtime_windows_are_capped() {
        let cfg = RuntimeConfig {
            rate_limit_identity_window_ms: u64::MAX,
            rate_limit_action_window_ms: u64::MAX,
            ..RuntimeConfig::default()
        };
        let cap = chrono::Duration::seconds(MAX_DURATION_SECONDS as i64);
        assert_eq!(cfg.identity_limit().window, cap);
        assert_eq!(cfg.action_limit().window, cap);
        assert!(cfg.validate().is_err());
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_runtime_limits_convert_to_windows() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.identity_limit().max_requests, 30);
        assert_eq!(cfg.identity_limit().window, chrono::Duration::seconds(60));
        assert_eq!(cfg.action_limit().window, chrono::Duration::seconds(1));
    }
}
