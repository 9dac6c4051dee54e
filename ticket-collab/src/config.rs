//! Tunables for sessions, the relay and the RocksDB cache.
//!
//! Every struct has production defaults and a `for_testing()` variant with
//! short timings. `SessionConfig` can be overridden from JSON; missing keys
//! keep their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub growth_factor: f64,
    pub max_delay_ms: u64,
    /// Consecutive failures before giving up and going `Offline`.
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            growth_factor: 2.0,
            max_delay_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1-based), clamped to the maximum.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let millis = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Per-room session tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub backoff: BackoffConfig,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Pending canonical writes are retried on this period.
    pub flush_interval_ms: u64,
    pub max_write_attempts: u32,
    pub pending_queue_capacity: usize,
    pub typing_idle_timeout_ms: u64,
    pub presence_idle_timeout_ms: u64,
    /// Buffer of the `SessionEvent` broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            health_check_interval_ms: 15_000,
            health_check_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
            flush_interval_ms: 5_000,
            max_write_attempts: 5,
            pending_queue_capacity: 1_000,
            typing_idle_timeout_ms: 5_000,
            presence_idle_timeout_ms: 60_000,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Short timings for tests (paired with tokio's paused clock).
    pub fn for_testing() -> Self {
        Self {
            backoff: BackoffConfig {
                base_delay_ms: 100,
                growth_factor: 2.0,
                max_delay_ms: 1_000,
                max_retries: 3,
            },
            health_check_interval_ms: 1_000,
            health_check_timeout_ms: 500,
            connect_timeout_ms: 1_000,
            flush_interval_ms: 200,
            max_write_attempts: 3,
            pending_queue_capacity: 64,
            typing_idle_timeout_ms: 300,
            presence_idle_timeout_ms: 5_000,
            event_capacity: 256,
        }
    }

    /// Parse overrides; absent keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn typing_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_idle_timeout_ms)
    }

    pub fn presence_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_idle_timeout_ms)
    }
}

/// Rendezvous relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per peer before it starts lagging.
    pub broadcast_capacity: usize,
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

impl RelayConfig {
    /// Defaults, with `TICKET_RELAY_ADDR` overriding the bind address.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TICKET_RELAY_ADDR") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr.trim().to_string();
            }
        }
        config
    }
}

/// RocksDB cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
    /// fsync every write
    pub sync_writes: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./ticket-collab-cache"),
            block_cache_size: 32 * 1024 * 1024,
            write_buffer_size: 8 * 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl CacheConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            write_buffer_size: 1024 * 1024,
            sync_writes: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays_grow_then_clamp() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(6), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(500), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_monotonic() {
        let backoff = SessionConfig::for_testing().backoff;
        let delays: Vec<Duration> = (1..20).map(|n| backoff.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= backoff.max_delay()));
    }

    #[test]
    fn test_session_config_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{ "flush_interval_ms": 50, "backoff": { "max_retries": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.flush_interval_ms, 50);
        assert_eq!(config.backoff.max_retries, 2);
        assert_eq!(config.backoff.base_delay_ms, 1_000);
        assert_eq!(config.max_write_attempts, 5);
    }

    #[test]
    fn test_session_config_from_json_rejects_bad_types() {
        assert!(SessionConfig::from_json(r#"{ "flush_interval_ms": "soon" }"#).is_err());
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }
}
