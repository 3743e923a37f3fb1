//! Aggregator configuration.
//!
//! Loaded from RON:
//!
//! ```ron
//! (
//!     changes_capacity: 1024,
//!     tombstone_grace_ms: 60000,
//!     gc_interval_ms: 5000,
//! )
//! ```
//!
//! Missing fields take their defaults from [`crate::constants`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    DEFAULT_CHANGES_CAPACITY, DEFAULT_GC_INTERVAL_MS, DEFAULT_TOMBSTONE_GRACE_MS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for one aggregator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Broadcast capacity of the raw change pass-through.
    pub changes_capacity: usize,
    /// Minimum age of a removed entry before garbage collection.
    pub tombstone_grace_ms: u64,
    /// Period of the garbage-collection tick.
    pub gc_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            changes_capacity: DEFAULT_CHANGES_CAPACITY,
            tombstone_grace_ms: DEFAULT_TOMBSTONE_GRACE_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl WatcherConfig {
    /// Parse and validate a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.changes_capacity == 0 {
            return Err(ConfigError::Invalid("changes_capacity must be positive".into()));
        }
        if self.gc_interval_ms == 0 {
            return Err(ConfigError::Invalid("gc_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn tombstone_grace(&self) -> Duration {
        Duration::from_millis(self.tombstone_grace_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Config that collects tombstones as soon as no pending session needs
    /// them. Handy for tests.
    pub fn eager_gc() -> Self {
        Self {
            tombstone_grace_ms: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = WatcherConfig::from_ron("(tombstone_grace_ms: 10)").unwrap();
        assert_eq!(config.tombstone_grace(), Duration::from_millis(10));
        assert_eq!(config.changes_capacity, DEFAULT_CHANGES_CAPACITY);
        assert_eq!(config.gc_interval(), Duration::from_millis(DEFAULT_GC_INTERVAL_MS));
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(matches!(
            WatcherConfig::from_ron("(gc_interval_ms: 0)"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            WatcherConfig::from_ron("(changes_capacity: 0)"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            WatcherConfig::from_ron("(gc_interval_ms: \"soon\")"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(changes_capacity: 16, gc_interval_ms: 250)").unwrap();

        let config = WatcherConfig::load(file.path()).unwrap();
        assert_eq!(config.changes_capacity, 16);
        assert_eq!(config.gc_interval(), Duration::from_millis(250));

        assert!(matches!(
            WatcherConfig::load("/nonexistent/statewatch.ron"),
            Err(ConfigError::Io { .. })
        ));
    }
}
