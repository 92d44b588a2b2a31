use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    pub kafka: KafkaConsumerConfig,

    pub postgres: PostgresConfig,

    #[serde(default)]
    pub partition: PartitionConfig,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Kafka subscription and batching. Offsets are always committed manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConsumerConfig {
    pub bootstrap_servers: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default)]
    pub topics: Vec<String>,

    /// Buffered records needed before a flush is attempted
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Upper bound on records taken from a single poll
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
}

impl KafkaConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for KafkaConsumerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: default_group_id(),
            topics: Vec::new(),
            min_batch_size: default_min_batch_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_poll_records: default_max_poll_records(),
            session_timeout_ms: default_session_timeout_ms(),
            auto_offset_reset: default_auto_offset_reset(),
        }
    }
}

fn default_group_id() -> String { "log-service-tracer".to_string() }
fn default_min_batch_size() -> usize { 2 }
fn default_poll_timeout_ms() -> u64 { 100 }
fn default_max_poll_records() -> usize { 500 }
fn default_session_timeout_ms() -> u64 { 30000 }
fn default_auto_offset_reset() -> String { "earliest".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl PostgresConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn default_max_connections() -> u32 { 10 }
fn default_acquire_timeout_secs() -> u64 { 30 }

/// Day boundaries for table partitioning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Offset from UTC, in minutes, in which a timestamp's day is taken
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl PartitionConfig {
    /// `None` when the offset is outside ±24h.
    pub fn fixed_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
    }
}

/// Rolling pre-creation of day tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl BootstrapConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_window_days() -> u32 { 7 }
fn default_interval_secs() -> u64 { 3600 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String { "info".to_string() }
