//! Configuration schema definitions
//!
//! Defines the structure of configuration files using serde for serialization.

use crate::gc::{CollectorOptions, GroupResource, RateLimiterConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Workers per queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Interval between discovery resyncs
    #[serde(default = "default_sync_period_seconds")]
    pub sync_period_seconds: u64,

    /// How long to wait for caches before collecting anyway
    #[serde(default = "default_initial_sync_timeout_seconds")]
    pub initial_sync_timeout_seconds: u64,

    /// Resource types never watched
    #[serde(default = "default_ignored_resources")]
    pub ignored_resources: Vec<GroupResource>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub absent_owner_cache: AbsentOwnerCacheConfig,

    #[serde(default)]
    pub debug: DebugConfig,

    #[serde(default)]
    pub logger: LoggerConfig,

    /// Project partitions registered at startup, besides root
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<PartitionConfig>,
}

/// Work queue backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_base_delay_millis")]
    pub base_delay_millis: u64,

    #[serde(default = "default_max_delay_seconds")]
    pub max_delay_seconds: u64,

    #[serde(default = "default_qps")]
    pub qps: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

/// Absent-owner cache sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbsentOwnerCacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,

    #[serde(default = "default_cache_ttl_seconds")]
    pub ttl_seconds: u64,
}

/// Debug graph endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_debug_address")]
    pub address: String,
}

/// Logger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggerConfig {
    /// Default filter; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

/// A project partition and the kubeconfig context that reaches it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartitionConfig {
    pub id: String,
    pub context: String,
}

fn default_workers() -> usize {
    20
}

fn default_sync_period_seconds() -> u64 {
    30
}

fn default_initial_sync_timeout_seconds() -> u64 {
    30
}

fn default_ignored_resources() -> Vec<GroupResource> {
    vec![
        GroupResource::new("", "events"),
        GroupResource::new("events.k8s.io", "events"),
    ]
}

fn default_base_delay_millis() -> u64 {
    5
}

fn default_max_delay_seconds() -> u64 {
    1000
}

fn default_qps() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    100
}

fn default_cache_capacity() -> u64 {
    500
}

fn default_cache_ttl_seconds() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_debug_address() -> String {
    "127.0.0.1:8099".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sync_period_seconds: default_sync_period_seconds(),
            initial_sync_timeout_seconds: default_initial_sync_timeout_seconds(),
            ignored_resources: default_ignored_resources(),
            queue: QueueConfig::default(),
            absent_owner_cache: AbsentOwnerCacheConfig::default(),
            debug: DebugConfig::default(),
            logger: LoggerConfig::default(),
            partitions: Vec::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay_millis: default_base_delay_millis(),
            max_delay_seconds: default_max_delay_seconds(),
            qps: default_qps(),
            burst: default_burst(),
        }
    }
}

impl Default for AbsentOwnerCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_debug_address(),
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_seconds)
    }

    pub fn initial_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_sync_timeout_seconds)
    }

    pub fn ignored_resources(&self) -> HashSet<GroupResource> {
        self.ignored_resources.iter().cloned().collect()
    }

    pub fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            queue: RateLimiterConfig {
                base_delay: Duration::from_millis(self.queue.base_delay_millis),
                max_delay: Duration::from_secs(self.queue.max_delay_seconds),
                qps: self.queue.qps,
                burst: self.queue.burst,
            },
            absent_owner_capacity: self.absent_owner_cache.capacity,
            absent_owner_ttl: Duration::from_secs(self.absent_owner_cache.ttl_seconds),
            initial_sync_timeout: self.initial_sync_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.workers, 20);
        assert_eq!(config.sync_period(), Duration::from_secs(30));
        assert_eq!(config.ignored_resources.len(), 2);
        assert!(config.debug.enabled);
        assert_eq!(config.logger.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("syncPeriodSeconds"));
        assert!(yaml.contains("absentOwnerCache"));
        assert!(!yaml.contains("partitions"));
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
workers: 4
queue:
  qps: 2.5
partitions:
  - id: project-a
    context: kind-project-a
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue.qps, 2.5);
        assert_eq!(config.queue.burst, 100);
        assert_eq!(config.partitions[0].id, "project-a");
        assert_eq!(config.sync_period_seconds, 30);
    }

    #[test]
    fn test_collector_options() {
        let mut config = Config::default();
        config.absent_owner_cache.ttl_seconds = 60;
        config.queue.base_delay_millis = 10;
        let options = config.collector_options();
        assert_eq!(options.absent_owner_ttl, Duration::from_secs(60));
        assert_eq!(options.queue.base_delay, Duration::from_millis(10));
        assert_eq!(options.absent_owner_capacity, 500);
    }
}
