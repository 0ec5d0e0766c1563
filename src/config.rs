use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::gauge::Thresholds;

/// Top-level configuration for the exporter.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Redis statsdb connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Prometheus endpoint configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Rate distribution bucket boundaries.
    #[serde(default)]
    pub buckets: BucketsConfig,

    /// Capacity of the queue between the event source and the dispatcher.
    /// Default: 4096.
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
}

/// Redis statsdb connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Server URL. Default: "redis://127.0.0.1:6379".
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Pattern subscribed to for allocation events.
    #[serde(default = "default_channel_pattern")]
    pub channel_pattern: String,

    /// Pattern matching the status key of every live allocation.
    #[serde(default = "default_status_key_pattern")]
    pub status_key_pattern: String,

    /// Delay before resubscribing after the connection drops. Default: 1s.
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Count already-existing allocations at startup. Default: true.
    #[serde(default = "default_true")]
    pub reconcile_on_start: bool,
}

/// Prometheus endpoint configuration.
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    /// Listen address. Default: ":8080".
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

/// Bucket boundaries of the rate distribution gauges.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketsConfig {
    /// Byte rate boundaries. Default: exponential, 16KiB/s doubling to 2MiB/s.
    #[serde(default = "default_byte_rate_buckets")]
    pub byte_rate: BucketLayout,

    /// Packet rate boundaries. Default: linear, 50pps to 400pps.
    #[serde(default = "default_packet_rate_buckets")]
    pub packet_rate: BucketLayout,
}

/// How a set of bucket boundaries is described.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BucketLayout {
    /// Boundaries listed one by one.
    Explicit { bounds: Vec<f64> },
    /// `count` boundaries starting at `start`, `width` apart.
    Linear { start: f64, width: f64, count: usize },
    /// `count` boundaries starting at `start`, each `factor` times the last.
    Exponential { start: f64, factor: f64, count: usize },
}

impl BucketLayout {
    /// Expands the layout into validated thresholds.
    pub fn thresholds(&self) -> Result<Thresholds> {
        let bounds = match *self {
            Self::Explicit { ref bounds } => bounds.clone(),
            Self::Linear {
                start,
                width,
                count,
            } => prometheus::linear_buckets(start, width, count)
                .context("invalid linear bucket layout")?,
            Self::Exponential {
                start,
                factor,
                count,
            } => prometheus::exponential_buckets(start, factor, count)
                .context("invalid exponential bucket layout")?,
        };

        Ok(Thresholds::new(bounds)?)
    }
}

// --- Default value functions ---

fn default_event_queue_size() -> usize {
    4096
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_channel_pattern() -> String {
    "turn/realm/*/user/*/allocation/*/*".to_string()
}

fn default_status_key_pattern() -> String {
    "turn/realm/*/user/*/allocation/*/status".to_string()
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_metrics_addr() -> String {
    ":8080".to_string()
}

fn default_byte_rate_buckets() -> BucketLayout {
    // 16K, 32K, 64K, 128K, 256K, 512K, 1M, 2M
    BucketLayout::Exponential {
        start: 16384.0,
        factor: 2.0,
        count: 8,
    }
}

fn default_packet_rate_buckets() -> BucketLayout {
    // 50, 100, 150, 200, 250, 300, 350, 400
    BucketLayout::Linear {
        start: 50.0,
        width: 50.0,
        count: 8,
    }
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: RedisConfig::default(),
            metrics: MetricsConfig::default(),
            buckets: BucketsConfig::default(),
            event_queue_size: default_event_queue_size(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            channel_pattern: default_channel_pattern(),
            status_key_pattern: default_status_key_pattern(),
            reconnect_backoff: default_reconnect_backoff(),
            reconcile_on_start: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            addr: default_metrics_addr(),
        }
    }
}

impl Default for BucketsConfig {
    fn default() -> Self {
        Self {
            byte_rate: default_byte_rate_buckets(),
            packet_rate: default_packet_rate_buckets(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.redis.url.is_empty() {
            bail!("redis.url is required");
        }

        if self.redis.channel_pattern.is_empty() {
            bail!("redis.channel_pattern is required");
        }

        if self.redis.reconcile_on_start && self.redis.status_key_pattern.is_empty() {
            bail!("redis.status_key_pattern is required when reconcile_on_start is enabled");
        }

        if self.redis.reconnect_backoff.is_zero() {
            bail!("redis.reconnect_backoff must be positive");
        }

        if self.event_queue_size == 0 {
            bail!("event_queue_size must be positive");
        }

        self.buckets
            .byte_rate
            .thresholds()
            .context("invalid buckets.byte_rate")?;
        self.buckets
            .packet_rate
            .thresholds()
            .context("invalid buckets.packet_rate")?;

        Ok(())
    }
}
