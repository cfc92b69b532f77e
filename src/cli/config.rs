use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub store: StoreSettings,
    /// Written to `modifiedBy` on every mutation this process makes
    pub crawler_name: String,
    pub gc: GcSettings,
    pub monitor: MonitorSettings,
}

/// Which document store backs the queue
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    MongoDb,
    Memory,
}

/// Store connection settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    pub url: String,
    pub database_name: String,
    pub collection_name: String,
}

/// Garbage collector settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GcSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Age after which an unresolved item counts as abandoned, the interval when unset
    pub stale_after_ms: Option<u64>,
}

/// Statistics monitor settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub statistic_collection_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            crawler_name: "crawler".to_string(),
            gc: GcSettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::MongoDb,
            url: "mongodb://localhost:27017".to_string(),
            database_name: "crawler".to_string(),
            collection_name: "queue".to_string(),
        }
    }
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 120_000,
            stale_after_ms: None,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 60_000,
            statistic_collection_name: "statistic".to_string(),
        }
    }
}

impl QueueConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "crawler-queue", "crawler-queue") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }
        path
    }

    /// Load the default configuration, writing one out if there is none yet
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load configuration from a file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Render as YAML, as written by `save_to_file`
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.crawler_name, "crawler");
        assert_eq!(config.store.backend, StoreBackend::MongoDb);
        assert_eq!(config.gc.interval_ms, 120_000);
        assert!(!config.gc.enabled);
        assert_eq!(config.gc.stale_after_ms, None);
        assert_eq!(config.monitor.interval_ms, 60_000);
        assert_eq!(config.monitor.statistic_collection_name, "statistic");
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: QueueConfig = serde_yaml::from_str(
            "crawler_name: worker-7\nstore:\n  backend: memory\ngc:\n  enabled: true\n  stale_after_ms: 600000\n",
        )
        .unwrap();

        assert_eq!(config.crawler_name, "worker-7");
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.collection_name, "queue");
        assert!(config.gc.enabled);
        assert_eq!(config.gc.interval_ms, 120_000);
        assert_eq!(config.gc.stale_after_ms, Some(600_000));
        assert!(!config.monitor.enabled);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.yaml");

        let mut config = QueueConfig::default();
        config.store.database_name = "crawl_test".to_string();
        config.monitor.enabled = true;
        config.save_to_file(&path).unwrap();

        let loaded = QueueConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.yaml");
        fs::write(&path, "store:\n  backend: redis\n").unwrap();

        let err = QueueConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
