//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for a scheduler node.

mod error;
mod settings;
mod yaml;

pub use error::ConfigError;
pub use settings::StaticConfigurationService;
pub use yaml::{ApiConfig, CompressionConfig, SchedulerConfig, StorageConfig, YamlLoader};
