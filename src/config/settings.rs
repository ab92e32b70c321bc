//! Configuration service backed by a fixed map.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::core::executor::BoxError;
use crate::jobs::ConfigurationService;

/// Serves values loaded from the `settings` section of the node
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigurationService {
    values: BTreeMap<String, BTreeMap<String, String>>,
}

impl StaticConfigurationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(values: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self { values }
    }

    /// Builder: add a value.
    pub fn with_value(
        mut self,
        config_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.values
            .entry(config_id.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl ConfigurationService for StaticConfigurationService {
    async fn get(&self, config_id: &str, key: &str) -> Result<Option<String>, BoxError> {
        Ok(self
            .values
            .get(config_id)
            .and_then(|entries| entries.get(key))
            .cloned())
    }
}
