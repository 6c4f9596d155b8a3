use crate::retry::RetryConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub retry: RetryConfig,

    /// How long a transport query may wait for its reply
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Write retry records through to storage and restore them on startup
    #[serde(default = "default_true")]
    pub persist_retry_queue: bool,

    /// Retry receipts per (message, device) before we stop answering
    #[serde(default = "default_max_retry_receipts")]
    pub max_retry_receipts: u32,

    #[serde(default = "default_recent_message_ttl_ms")]
    pub recent_message_ttl_ms: u64,

    #[serde(default = "default_retry_receipt_ttl_ms")]
    pub retry_receipt_ttl_ms: u64,

    #[serde(default = "default_presence_ttl_ms")]
    pub presence_ttl_ms: u64,

    #[serde(default = "default_mutation_ttl_ms")]
    pub mutation_ttl_ms: u64,
}

fn default_query_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_max_retry_receipts() -> u32 {
    5
}

fn default_recent_message_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_retry_receipt_ttl_ms() -> u64 {
    60 * 60 * 1000
}

fn default_presence_ttl_ms() -> u64 {
    5 * 60 * 1000
}

fn default_mutation_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            query_timeout_ms: default_query_timeout_ms(),
            persist_retry_queue: true,
            max_retry_receipts: default_max_retry_receipts(),
            recent_message_ttl_ms: default_recent_message_ttl_ms(),
            retry_receipt_ttl_ms: default_retry_receipt_ttl_ms(),
            presence_ttl_ms: default_presence_ttl_ms(),
            mutation_ttl_ms: default_mutation_ttl_ms(),
        }
    }
}

impl RelayConfig {
    /// Load config from `path`, or defaults if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: RelayConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("failed to write {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.query_timeout_ms == 0 {
            return Err(Error::Config("query_timeout_ms must be positive".to_string()));
        }
        if self.max_retry_receipts == 0 {
            return Err(Error::Config("max_retry_receipts must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.tick_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        let config = RelayConfig::load(&temp.path().join("relay.json")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("relay.json");
        let mut config = RelayConfig::default();
        config.retry.base_delay_ms = 1_000;
        config.persist_retry_queue = false;
        config.save(&path).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("relay.json");
        std::fs::write(&path, r#"{"retry":{"maxAttempts":3}}"#).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded.retry.max_attempts, 3);
        assert_eq!(loaded.retry.base_delay_ms, 5_000);
        assert_eq!(loaded.query_timeout_ms, 60_000);
    }

    #[test]
    fn test_config_invalid_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("relay.json");
        std::fs::write(&path, r#"{"queryTimeoutMs":0}"#).unwrap();
        assert!(matches!(RelayConfig::load(&path), Err(Error::Config(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(RelayConfig::load(&path), Err(Error::Config(_))));
    }
}
