use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::sync::{MAX_RETRIES, RetryPolicy};

/// Sync layer settings, read from TOML. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retries: u32,
    /// Base delay between replays of a failing item; 0 disables backoff.
    pub retry_backoff_ms: u64,
    pub database_path: PathBuf,
    pub prefetch_collections: Vec<String>,
    /// Collections that must be cached before the app counts as offline-ready.
    /// Empty means "all of `prefetch_collections`".
    pub required_collections: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_backoff_ms: 0,
            database_path: PathBuf::from("paddock.db"),
            prefetch_collections: [
                "animals",
                "breeding_records",
                "health_records",
                "feed_records",
                "inventory_items",
                "financial_transactions",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            required_collections: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn required(&self) -> &[String] {
        if self.required_collections.is_empty() {
            &self.prefetch_collections
        } else {
            &self.required_collections
        }
    }
}
