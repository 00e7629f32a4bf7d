//! Mount-time configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Period of the background flush task
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 60_000;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LfsConfig {
    /// Milliseconds between two background flushes
    pub flush_interval_ms: u64,
    /// Number of committed blocks kept in the read cache
    pub block_cache_capacity: usize,
    /// Format the volume on mount when its superblock magic does not match
    pub format_if_unformatted: bool,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            block_cache_capacity: 1024,
            format_if_unformatted: false,
        }
    }
}

impl LfsConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Background flush period
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LfsConfig::default();
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert!(!config.format_if_unformatted);
    }

    #[test]
    fn test_partial_json() {
        let config = LfsConfig::from_json(r#"{ "format_if_unformatted": true }"#).unwrap();
        assert!(config.format_if_unformatted);
        assert_eq!(config.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);
        assert_eq!(config.block_cache_capacity, 1024);
    }

    #[test]
    fn test_malformed_json() {
        assert!(LfsConfig::from_json("{ flush_interval_ms: ").is_err());
    }
}
