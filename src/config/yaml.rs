//! YAML configuration parsing.
//!
//! Parses the node configuration (`slicer.yaml`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::trigger::parse_duration;
use crate::scheduler::Scheduler;
use crate::storage::{Consistency, Storage};

use super::error::ConfigError;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lock owner identity. A random id is used when absent.
    pub node_id: Option<String>,
    /// Width of a time slice in seconds.
    pub slice_width_secs: u64,
    /// Period of the internal clock in seconds. Defaults to the slice width.
    pub tick_interval_secs: Option<u64>,
    /// Maximum executors running at once on this node.
    pub max_concurrent_jobs: usize,
    /// Maximum slices walked per tick when catching up.
    pub max_catch_up_slices: usize,
    /// Seconds to wait for in-flight jobs on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Requested consistency level for storage operations.
    pub consistency: Consistency,
    /// Storage backend.
    pub storage: StorageConfig,
    /// Recurring compression job.
    pub compression: CompressionConfig,
    /// HTTP management API.
    pub api: ApiConfig,
    /// Values served to jobs through the configuration service, by
    /// configuration id then key.
    pub settings: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            slice_width_secs: 60,
            tick_interval_secs: None,
            max_concurrent_jobs: 16,
            max_catch_up_slices: 60,
            shutdown_timeout_secs: 30,
            consistency: Consistency::default(),
            storage: StorageConfig::default(),
            compression: CompressionConfig::default(),
            api: ApiConfig::default(),
            settings: BTreeMap::new(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Compression job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Block size as a duration expression, e.g. `2h`.
    pub block_size: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            block_size: "2h".to_string(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ApiConfig {
    /// Get the socket address.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidConfig(format!("invalid api address: {}", self.host)))
    }
}

impl SchedulerConfig {
    /// Width of a time slice.
    pub fn slice_width(&self) -> Duration {
        Duration::from_secs(self.slice_width_secs)
    }

    /// Period of the internal clock.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.slice_width())
    }

    /// Graceful shutdown timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Block size of the recurring compression job, if enabled.
    pub fn compression_block_size(&self) -> Result<Option<Duration>, ConfigError> {
        if !self.compression.enabled {
            return Ok(None);
        }
        parse_duration(&self.compression.block_size)
            .map(Some)
            .map_err(|e| ConfigError::InvalidConfig(format!("compression.block_size: {}", e)))
    }

    /// Apply the engine settings to a scheduler builder.
    pub fn configure<S: Storage + 'static>(&self, scheduler: Scheduler<S>) -> Scheduler<S> {
        let mut scheduler = scheduler
            .with_slice_width(self.slice_width())
            .with_tick_interval(self.tick_interval())
            .with_max_concurrent_jobs(self.max_concurrent_jobs)
            .with_max_catch_up_slices(self.max_catch_up_slices)
            .with_shutdown_timeout(self.shutdown_timeout());
        if let Some(node_id) = &self.node_id {
            scheduler = scheduler.with_node_id(node_id.as_str());
        }
        scheduler
    }

    /// Open the SQLite backend when it is the configured one.
    #[cfg(feature = "sqlite")]
    pub async fn open_sqlite(&self) -> Result<Option<crate::storage::SqliteStorage>, ConfigError> {
        match &self.storage {
            StorageConfig::Memory => Ok(None),
            StorageConfig::Sqlite { path } => crate::storage::SqliteStorage::new(path)
                .await
                .map(|s| Some(s.with_consistency(self.consistency)))
                .map_err(|e| ConfigError::InvalidConfig(format!("storage: {}", e))),
        }
    }

    /// Validate value ranges.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.slice_width_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "slice_width_secs cannot be zero".into(),
            ));
        }
        if self.tick_interval_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_secs cannot be zero".into(),
            ));
        }
        if self.tick_interval() > self.slice_width() {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_secs cannot exceed slice_width_secs".into(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_jobs cannot be zero".into(),
            ));
        }
        if self.max_catch_up_slices == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_catch_up_slices cannot be zero".into(),
            ));
        }
        if self.node_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ConfigError::MissingField("node_id".into()));
        }
        if let StorageConfig::Sqlite { path } = &self.storage {
            if path.trim().is_empty() {
                return Err(ConfigError::MissingField("storage.path".into()));
            }
        }
        if self.api.enabled {
            self.api.socket_addr()?;
        }
        if let Some(block) = self.compression_block_size()? {
            if block.as_secs() % self.slice_width_secs != 0 {
                return Err(ConfigError::InvalidConfig(
                    "compression.block_size must be a multiple of the slice width".into(),
                ));
            }
        }
        Ok(())
    }
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load node configuration from a file.
    pub fn load_config(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: SchedulerConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse node configuration from a YAML string.
    pub fn parse_config(yaml: &str) -> Result<SchedulerConfig, ConfigError> {
        let config: SchedulerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration service serving the `settings` section.
    pub fn configuration_service(
        config: &SchedulerConfig,
    ) -> Arc<super::StaticConfigurationService> {
        Arc::new(super::StaticConfigurationService::from_settings(
            config.settings.clone(),
        ))
    }
}
