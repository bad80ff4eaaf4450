//! Configuration module for edgemux.

use crate::error::{EdgemuxError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration for an edgemux instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgemuxConfig {
    /// Upstream API server configuration.
    pub upstream: UpstreamConfig,
    /// Per-backend cache configuration.
    pub cache: CacheConfig,
    /// Reconnect backoff configuration.
    pub backoff: BackoffConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl EdgemuxConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EdgemuxError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EdgemuxError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.is_empty() {
            return Err(EdgemuxError::InvalidConfig {
                field: "upstream.base_url".to_string(),
                reason: "Upstream base URL must be set".to_string(),
            });
        }

        if self.cache.event_log_capacity == 0 {
            return Err(EdgemuxError::InvalidConfig {
                field: "cache.event_log_capacity".to_string(),
                reason: "Event log capacity must be non-zero".to_string(),
            });
        }

        if self.cache.sink_capacity == 0 {
            return Err(EdgemuxError::InvalidConfig {
                field: "cache.sink_capacity".to_string(),
                reason: "Subscriber sink capacity must be non-zero".to_string(),
            });
        }

        if self.backoff.multiplier < 1.0 {
            return Err(EdgemuxError::InvalidConfig {
                field: "backoff.multiplier".to_string(),
                reason: "Backoff multiplier must be at least 1.0".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration pointed at a local server.
    pub fn development(base_url: impl Into<String>) -> Self {
        Self {
            upstream: UpstreamConfig {
                base_url: base_url.into(),
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(10),
            },
            cache: CacheConfig::default(),
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
                multiplier: 2.0,
                max_failures: 3,
            },
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Upstream API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API server, e.g. `https://10.0.0.1:6443`.
    pub base_url: String,
    /// Connection timeout for upstream requests.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Request timeout for non-streaming upstream requests.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-backend cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of events retained in the versioned event log.
    pub event_log_capacity: usize,
    /// Capacity of the live fan-out channel; a subscriber that falls this far
    /// behind the reflecting worker is terminated.
    pub broadcast_capacity: usize,
    /// Capacity of each subscriber's delivery sink.
    pub sink_capacity: usize,
    /// How long delivery may block on a full sink before the session is
    /// terminated as overflowed.
    #[serde(with = "humantime_serde")]
    pub overflow_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: 1024,
            broadcast_capacity: 1024,
            sink_capacity: 128,
            overflow_wait: Duration::from_millis(100),
        }
    }
}

/// Reconnect backoff configuration for the reflecting worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound on the retry delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure.
    pub multiplier: f64,
    /// Consecutive failures after which the backend is surfaced as
    /// unavailable to new calls while reconnection continues in background.
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_failures: 5,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default log level filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit logs as JSON.
    pub json_logs: bool,
    /// Serve Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics server bind address.
    pub metrics_addr: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_addr: "127.0.0.1:9464".parse().expect("valid socket address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_is_valid() {
        let config = EdgemuxConfig::development("http://127.0.0.1:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_base_url_rejected() {
        let config = EdgemuxConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EdgemuxError::InvalidConfig { field, .. } if field == "upstream.base_url"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = EdgemuxConfig::development("http://127.0.0.1:8080");
        config.cache.event_log_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trip() {
        let config = EdgemuxConfig::development("http://127.0.0.1:8080");
        let json = serde_json::to_string(&config).unwrap();
        let restored: EdgemuxConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.upstream.base_url, config.upstream.base_url);
        assert_eq!(restored.cache.sink_capacity, config.cache.sink_capacity);
    }
}
