//! Configuration loading and merging logic
//!
//! Handles loading configuration from multiple sources and merging them
//! according to precedence rules.

use super::{paths, schema::Config};
use anyhow::{Context, Result, bail};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with all layers merged
    ///
    /// Precedence order (highest to lowest):
    /// 1. Environment variable overrides
    /// 2. File given with `--config`
    /// 3. Root config
    /// 4. Built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        Self::load_from(&paths::root_config_path(), explicit)
    }

    /// Same as [`ConfigLoader::load`] with an explicit root config path
    pub fn load_from(root: &Path, explicit: Option<&Path>) -> Result<Config> {
        let mut config = Config::default();

        if root.exists() {
            config = Self::merge_config(config, Self::load_file(root)?);
        }

        if let Some(path) = explicit {
            config = Self::merge_config(config, Self::load_file(path)?);
        }

        Ok(Self::apply_env_overrides(config))
    }

    /// Load configuration from a file
    pub fn load_file(path: &Path) -> Result<Config> {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check values that parse but cannot run
    pub fn validate(config: &Config) -> Result<()> {
        if config.workers == 0 {
            bail!("workers must be greater than zero");
        }
        if config.sync_period_seconds == 0 {
            bail!("syncPeriodSeconds must be greater than zero");
        }
        if config.initial_sync_timeout_seconds == 0 {
            bail!("initialSyncTimeoutSeconds must be greater than zero");
        }
        if !config.queue.qps.is_finite() || config.queue.qps <= 0.0 || config.queue.burst == 0 {
            bail!("queue.qps must be a positive finite number and queue.burst greater than zero");
        }
        if config.absent_owner_cache.capacity == 0 || config.absent_owner_cache.ttl_seconds == 0 {
            bail!("absentOwnerCache.capacity and absentOwnerCache.ttlSeconds must be greater than zero");
        }
        if config.debug.enabled {
            config
                .debug
                .address
                .parse::<SocketAddr>()
                .with_context(|| format!("debug.address '{}' is not a socket address", config.debug.address))?;
        }

        let mut seen = HashSet::new();
        for partition in &config.partitions {
            if partition.id.is_empty() || partition.id == "root" {
                bail!("partition id '{}' is reserved", partition.id);
            }
            if partition.context.is_empty() {
                bail!("partition '{}' has no context", partition.id);
            }
            if !seen.insert(partition.id.as_str()) {
                bail!("partition '{}' is listed more than once", partition.id);
            }
        }
        Ok(())
    }

    /// Merge two configurations, with `other` taking precedence
    ///
    /// Every field of a parsed file is defaulted, so the later layer wins
    /// wholesale.
    fn merge_config(_base: Config, other: Config) -> Config {
        other
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: Config) -> Config {
        if let Ok(workers) = std::env::var("PROJECTGC_WORKERS") {
            if let Ok(val) = workers.parse::<usize>() {
                config.workers = val;
            }
        }

        if let Ok(level) = std::env::var("PROJECTGC_LOG_LEVEL") {
            config.logger.level = level;
        }

        if let Ok(address) = std::env::var("PROJECTGC_DEBUG_ADDRESS") {
            config.debug.address = address;
        }

        config
    }

    /// Save configuration to a file
    pub fn save(config: &Config, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            paths::ensure_dir(parent)?;
        }

        let yaml =
            serde_yaml::to_string(config).context("Failed to serialize configuration to YAML")?;

        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Save root configuration
    pub fn save_root(config: &Config) -> Result<()> {
        Self::save(config, &paths::root_config_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::PartitionConfig;

    fn partition(id: &str) -> PartitionConfig {
        PartitionConfig {
            id: id.to_string(),
            context: format!("kind-{id}"),
        }
    }

    #[test]
    fn test_merge_config() {
        let base = Config::default();
        let other = Config {
            workers: 3,
            ..Default::default()
        };

        let merged = ConfigLoader::merge_config(base, other);
        assert_eq!(merged.workers, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ConfigLoader::validate(&Config::default()).is_ok());

        let config = Config {
            workers: 0,
            ..Default::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());

        let config = Config {
            sync_period_seconds: 0,
            ..Default::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());

        let config = Config {
            partitions: vec![partition("root")],
            ..Default::default()
        };
        assert!(ConfigLoader::validate(&config).is_err());

        let config = Config {
            partitions: vec![partition("a"), partition("a")],
            ..Default::default()
        };
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_validate_rejects_unusable_qps() {
        for qps in [f64::NAN, f64::INFINITY, -1.0, 0.0] {
            let mut config = Config::default();
            config.queue.qps = qps;
            assert!(ConfigLoader::validate(&config).is_err(), "qps {qps} accepted");
        }
    }

    #[test]
    fn test_validate_debug_address() {
        let mut config = Config::default();
        config.debug.address = "not-an-address".into();
        assert!(ConfigLoader::validate(&config).is_err());

        config.debug.enabled = false;
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_env_overrides() {
        // SAFETY: set_var is unsafe in Rust 2024 due to potential data races.
        // No other test in this binary reads these variables.
        unsafe {
            std::env::set_var("PROJECTGC_WORKERS", "7");
            std::env::set_var("PROJECTGC_LOG_LEVEL", "debug");
        }

        let config = ConfigLoader::apply_env_overrides(Config::default());

        assert_eq!(config.workers, 7);
        assert_eq!(config.logger.level, "debug");

        // SAFETY: same as above.
        unsafe {
            std::env::remove_var("PROJECTGC_WORKERS");
            std::env::remove_var("PROJECTGC_LOG_LEVEL");
        }
    }
}
