//! Configuration system for projectgc
//!
//! Layered YAML configuration: built-in defaults, the root config file, an
//! explicit `--config` file and environment overrides.

pub mod loader;
pub mod paths;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{Config, LoggerConfig, PartitionConfig};

use anyhow::Context;

/// Get a configuration value by key (dot notation)
pub fn get_config_value(config: &Config, key: &str) -> anyhow::Result<String> {
    match key {
        "workers" => Ok(config.workers.to_string()),
        "syncPeriodSeconds" => Ok(config.sync_period_seconds.to_string()),
        "initialSyncTimeoutSeconds" => Ok(config.initial_sync_timeout_seconds.to_string()),
        "queue.baseDelayMillis" => Ok(config.queue.base_delay_millis.to_string()),
        "queue.maxDelaySeconds" => Ok(config.queue.max_delay_seconds.to_string()),
        "queue.qps" => Ok(config.queue.qps.to_string()),
        "queue.burst" => Ok(config.queue.burst.to_string()),
        "absentOwnerCache.capacity" => Ok(config.absent_owner_cache.capacity.to_string()),
        "absentOwnerCache.ttlSeconds" => Ok(config.absent_owner_cache.ttl_seconds.to_string()),
        "debug.enabled" => Ok(config.debug.enabled.to_string()),
        "debug.address" => Ok(config.debug.address.clone()),
        "logger.level" => Ok(config.logger.level.clone()),
        "logger.json" => Ok(config.logger.json.to_string()),
        "ignoredResources" => serde_yaml::to_string(&config.ignored_resources)
            .context("Failed to serialize ignoredResources"),
        "partitions" => {
            serde_yaml::to_string(&config.partitions).context("Failed to serialize partitions")
        }
        _ => Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }
}

/// Set a configuration value by key (dot notation)
pub fn set_config_value(config: &mut Config, key: &str, value: &str) -> anyhow::Result<()> {
    match key {
        "workers" => {
            config.workers = value.parse().context("workers must be a number")?;
        }
        "syncPeriodSeconds" => {
            config.sync_period_seconds = value
                .parse()
                .context("syncPeriodSeconds must be a number")?;
        }
        "initialSyncTimeoutSeconds" => {
            config.initial_sync_timeout_seconds = value
                .parse()
                .context("initialSyncTimeoutSeconds must be a number")?;
        }
        "queue.baseDelayMillis" => {
            config.queue.base_delay_millis = value
                .parse()
                .context("queue.baseDelayMillis must be a number")?;
        }
        "queue.maxDelaySeconds" => {
            config.queue.max_delay_seconds = value
                .parse()
                .context("queue.maxDelaySeconds must be a number")?;
        }
        "queue.qps" => {
            config.queue.qps = value.parse().context("queue.qps must be a number")?;
        }
        "queue.burst" => {
            config.queue.burst = value.parse().context("queue.burst must be a number")?;
        }
        "absentOwnerCache.capacity" => {
            config.absent_owner_cache.capacity = value
                .parse()
                .context("absentOwnerCache.capacity must be a number")?;
        }
        "absentOwnerCache.ttlSeconds" => {
            config.absent_owner_cache.ttl_seconds = value
                .parse()
                .context("absentOwnerCache.ttlSeconds must be a number")?;
        }
        "debug.enabled" => {
            config.debug.enabled = value
                .parse()
                .context("debug.enabled must be 'true' or 'false'")?;
        }
        "debug.address" => {
            config.debug.address = value.to_string();
        }
        "logger.level" => {
            config.logger.level = value.to_string();
        }
        "logger.json" => {
            config.logger.json = value
                .parse()
                .context("logger.json must be 'true' or 'false'")?;
        }
        "ignoredResources" => {
            config.ignored_resources = serde_yaml::from_str(value).context(
                "ignoredResources must be a YAML list (e.g., [{group: '', resource: events}])",
            )?;
        }
        "partitions" => {
            config.partitions = serde_yaml::from_str(value).context(
                "partitions must be a YAML list (e.g., [{id: project-a, context: kind-a}])",
            )?;
        }
        _ => return Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }
    Ok(())
}
