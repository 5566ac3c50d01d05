//! Environment and store configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Where asynchronous transactions run relative to the synchronous
/// operations of the same batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncTxnOrder {
    /// After every synchronous operation of the batch
    #[default]
    After,
    /// Before every synchronous operation of the batch
    Before,
    /// At the exact position they were queued
    Strict,
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub name: String,
    pub map_size: usize,
    pub max_dbs: usize,
    /// Size of one addressable region of the map
    pub region_span: u64,
    /// Preferred size of a zero-copy window
    pub window_span: u64,
    pub async_txn_order: AsyncTxnOrder,
    pub commit_delay_ms: u64,
    /// Idle time before the shared read snapshot is reset
    pub read_idle_ms: u64,
    pub max_retries: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            map_size: 1024 * 1024,
            max_dbs: 12,
            region_span: 1 << 30,
            window_span: 1 << 20,
            async_txn_order: AsyncTxnOrder::After,
            commit_delay_ms: 0,
            read_idle_ms: 0,
            max_retries: 16,
        }
    }
}

impl EnvConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EnvConfig =
            serde_json::from_str(&text).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.map_size == 0 {
            return Err(StoreError::Config("map_size must be non-zero".into()));
        }
        if self.region_span == 0 || self.window_span == 0 {
            return Err(StoreError::Config(
                "region_span and window_span must be non-zero".into(),
            ));
        }
        // offsets inside a region are recorded as 32 bits
        if self.region_span > 1 << 32 {
            return Err(StoreError::Config(format!(
                "region_span ({}) cannot exceed 4 GiB",
                self.region_span
            )));
        }
        if self.window_span > self.region_span {
            return Err(StoreError::Config(format!(
                "window_span ({}) cannot exceed region_span ({})",
                self.window_span, self.region_span
            )));
        }
        if self.max_retries == 0 {
            return Err(StoreError::Config("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    pub fn commit_delay(&self) -> Duration {
        Duration::from_millis(self.commit_delay_ms)
    }

    pub fn read_idle(&self) -> Duration {
        Duration::from_millis(self.read_idle_ms)
    }
}

/// Options for opening one store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// `None` opens the root database
    pub name: Option<String>,
    pub use_versions: bool,
    pub dup_sort: bool,
    /// Overrides the environment's commit delay
    pub commit_delay_ms: Option<u64>,
}

impl StoreOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_versions(mut self) -> Self {
        self.use_versions = true;
        self
    }

    pub fn with_dup_sort(mut self) -> Self {
        self.dup_sort = true;
        self
    }

    pub fn with_commit_delay(mut self, ms: u64) -> Self {
        self.commit_delay_ms = Some(ms);
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.dup_sort && self.use_versions {
            return Err(StoreError::Config(
                "The dupSort flag can not be combined with versions".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EnvConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.async_txn_order, AsyncTxnOrder::After);
        assert_eq!(config.commit_delay(), Duration::ZERO);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "name": "test", "async_txn_order": "strict", "commit_delay_ms": 5 }}"#
        )
        .unwrap();

        let config = EnvConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "test");
        assert_eq!(config.async_txn_order, AsyncTxnOrder::Strict);
        assert_eq!(config.commit_delay(), Duration::from_millis(5));
        assert_eq!(config.max_dbs, 12);
    }

    #[test]
    fn test_invalid_config() {
        let config = EnvConfig {
            window_span: 4096,
            region_span: 1024,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));

        let config = EnvConfig {
            region_span: 1 << 33,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            EnvConfig::from_file(file.path()),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_dup_sort_with_versions_rejected() {
        let options = StoreOptions::named("dups").with_dup_sort().with_versions();
        assert!(options.validate().is_err());
        assert!(StoreOptions::named("dups").with_dup_sort().validate().is_ok());
    }
}
