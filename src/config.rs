//! Configuration management for the media relay

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Configuration for the relay server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address the browser-facing server binds to (default: 127.0.0.1:13337)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Base URL of the backend service (default: http://api:8000)
    #[serde(default = "default_upstream_base")]
    pub upstream_base: String,

    /// Cache-Control max-age for continuous media streams (default: 3600)
    #[serde(default = "default_stream_max_age")]
    pub stream_max_age_secs: u64,

    /// Cache-Control max-age for thumbnails (default: 300)
    #[serde(default = "default_thumbnail_max_age")]
    pub thumbnail_max_age_secs: u64,

    /// Cache-Control max-age for full-size archive entries (default: 60)
    #[serde(default = "default_archive_image_max_age")]
    pub archive_image_max_age_secs: u64,

    /// Upstream connect timeout in milliseconds (default: 5000)
    ///
    /// Only the connection phase is bounded; bodies may take as long as
    /// the transport allows.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Thumbnail prefetch tuning
    #[serde(default)]
    pub prefetch: PrefetchConfig,

    /// Metrics endpoint configuration (optional)
    #[serde(default)]
    pub metrics_endpoint: Option<MetricsEndpointConfig>,

    /// Log level: trace, debug, info, warn or error (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Tuning constants for background thumbnail prefetching
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefetchConfig {
    /// Number of prefetch requests issued per batch (default: 24)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between batches when no idle signal is available (default: 50)
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,

    /// Thumbnail size requested for performers (default: 480)
    #[serde(default = "default_performer_thumb_size")]
    pub performer_thumb_size: u32,

    /// Thumbnail size requested for archive entries (default: 360)
    #[serde(default = "default_archive_thumb_size")]
    pub archive_thumb_size: u32,
}

/// Configuration for the metrics HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsEndpointConfig {
    /// Whether to enable the metrics endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the metrics endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            fallback_delay_ms: default_fallback_delay_ms(),
            performer_thumb_size: default_performer_thumb_size(),
            archive_thumb_size: default_archive_thumb_size(),
        }
    }
}

impl PrefetchConfig {
    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }
}

impl Default for MetricsEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:13337".to_string()
}

fn default_upstream_base() -> String {
    "http://api:8000".to_string()
}

fn default_stream_max_age() -> u64 {
    3600 // 1 hour
}

fn default_thumbnail_max_age() -> u64 {
    300 // 5 minutes
}

fn default_archive_image_max_age() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_batch_size() -> usize {
    24
}

fn default_fallback_delay_ms() -> u64 {
    50
}

fn default_performer_thumb_size() -> u32 {
    480
}

fn default_archive_thumb_size() -> u32 {
    360
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_address: default_listen_address(),
            upstream_base: default_upstream_base(),
            stream_max_age_secs: default_stream_max_age(),
            thumbnail_max_age_secs: default_thumbnail_max_age(),
            archive_image_max_age_secs: default_archive_image_max_age(),
            connect_timeout_ms: default_connect_timeout_ms(),
            prefetch: PrefetchConfig::default(),
            metrics_endpoint: None,
            log_level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - upstream_base must be an absolute http(s) URL
    /// - listen_address must be a socket address
    /// - all max-age values must be > 0
    /// - prefetch batch_size must be > 0
    /// - log_level must be a known tracing level
    /// - an enabled metrics endpoint must have a socket address
    pub fn validate(&self) -> Result<()> {
        let upstream = reqwest::Url::parse(&self.upstream_base).map_err(|e| {
            RelayError::ConfigError(format!(
                "upstream_base '{}' is not a valid URL: {}",
                self.upstream_base, e
            ))
        })?;
        if upstream.scheme() != "http" && upstream.scheme() != "https" {
            return Err(RelayError::ConfigError(format!(
                "upstream_base must use http or https, got '{}'",
                upstream.scheme()
            )));
        }

        self.listen_socket_addr()?;

        for (name, value) in [
            ("stream_max_age_secs", self.stream_max_age_secs),
            ("thumbnail_max_age_secs", self.thumbnail_max_age_secs),
            ("archive_image_max_age_secs", self.archive_image_max_age_secs),
        ] {
            if value == 0 {
                return Err(RelayError::ConfigError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.prefetch.batch_size == 0 {
            return Err(RelayError::ConfigError(
                "prefetch.batch_size must be greater than 0".to_string(),
            ));
        }

        self.tracing_level()?;

        if let Some(ref metrics) = self.metrics_endpoint {
            if metrics.enabled && metrics.address.parse::<SocketAddr>().is_err() {
                return Err(RelayError::ConfigError(format!(
                    "metrics_endpoint.address '{}' is not a socket address",
                    metrics.address
                )));
            }
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn listen_socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            RelayError::ConfigError(format!(
                "listen_address '{}' is not a socket address: {}",
                self.listen_address, e
            ))
        })
    }

    /// Parsed tracing level
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.log_level.parse().map_err(|_| {
            RelayError::ConfigError(format!("Invalid log_level '{}'", self.log_level))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
