//! Ingest Configuration
//!
//! ## IngestConfig
//!
//! Four sections, each with serde defaults so a TOML file only needs the
//! values that differ:
//!
//! - **log**: topic, consumer group, partition count and commit cadence
//! - **store**: target table, flush thresholds, row key modulus and the
//!   connection properties that identify the store cluster
//! - **keys**: hex encoded MAC and cipher keys (all optional)
//! - **lifecycle**: timings of generation teardown and respawn
//!
//! ## Usage
//!
//! ```ignore
//! use tidestore_storage::IngestConfig;
//!
//! let config = IngestConfig::from_toml_str(r#"
//!     [log]
//!     topic = "metrics"
//!     partitions = 8
//!
//!     [store]
//!     table = "continuum"
//!     modulus = 1
//! "#)?;
//! config.validate()?;
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidestore_core::{KeyKind, StaticKeyProvider};

use crate::error::{Result, StorageError};
use crate::log::OffsetReset;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub keys: KeysConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Topic carrying datapoint and delete messages
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Consumer group whose offsets are committed
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Number of partition streams (one consumer and one synchronizer each)
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Period between barrier syncs and offset commits (default: 1s)
    #[serde(default = "default_commit_period_ms")]
    pub commit_period_ms: u64,

    /// Commits further apart than this abort the generation (default: 10s)
    #[serde(default = "default_max_time_between_commits_ms")]
    pub max_time_between_commits_ms: u64,

    /// Upper bound of a single log poll (default: 100ms)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Start position for partitions without a committed offset
    #[serde(default = "default_offset_reset")]
    pub offset_reset: OffsetReset,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            group_id: default_group_id(),
            partitions: default_partitions(),
            commit_period_ms: default_commit_period_ms(),
            max_time_between_commits_ms: default_max_time_between_commits_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            offset_reset: default_offset_reset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_table")]
    pub table: String,

    #[serde(default = "default_column_family")]
    pub column_family: String,

    /// Flush a partition buffer early once it holds this many value bytes (default: 1MB)
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,

    /// Flush a partition buffer early when its last write is this old (default: 500ms)
    #[serde(default = "default_eager_flush_age_ms")]
    pub eager_flush_age_ms: u64,

    /// Row key time bucket; 1 means one row per timestamp
    #[serde(default = "default_modulus")]
    pub modulus: i64,

    /// Count flushed batches without sending them to the store
    #[serde(default)]
    pub skip_write: bool,

    /// Store client properties; also the identity of the shared connection
    #[serde(default)]
    pub connection: BTreeMap<String, String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            column_family: default_column_family(),
            max_pending_bytes: default_max_pending_bytes(),
            eager_flush_age_ms: default_eager_flush_age_ms(),
            modulus: default_modulus(),
            skip_write: false,
            connection: BTreeMap::new(),
        }
    }
}

/// Hex encoded keys. Absent or empty values disable the feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub log_mac: Option<String>,

    #[serde(default)]
    pub log_cipher: Option<String>,

    #[serde(default)]
    pub storage_cipher: Option<String>,
}

impl KeysConfig {
    pub fn provider(&self) -> Result<StaticKeyProvider> {
        let mut provider = StaticKeyProvider::new();
        for (kind, value) in [
            (KeyKind::LogMac, &self.log_mac),
            (KeyKind::LogCipher, &self.log_cipher),
            (KeyKind::StorageCipher, &self.storage_cipher),
        ] {
            if let Some(hex_key) = value {
                provider = provider.with_hex(kind, hex_key)?;
            }
        }
        Ok(provider)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Pause between teardown and the next generation (default: 100ms)
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,

    /// How long to wait for a worker before forcing it to stop (default: 100ms)
    #[serde(default = "default_join_retry_interval_ms")]
    pub join_retry_interval_ms: u64,

    #[serde(default = "default_join_max_attempts")]
    pub join_max_attempts: u32,

    /// Coordinator barrier check interval (default: 10ms)
    #[serde(default = "default_coordinator_poll_ms")]
    pub coordinator_poll_ms: u64,

    /// Synchronizer tick (default: 1ms)
    #[serde(default = "default_sync_poll_ms")]
    pub sync_poll_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            respawn_delay_ms: default_respawn_delay_ms(),
            join_retry_interval_ms: default_join_retry_interval_ms(),
            join_max_attempts: default_join_max_attempts(),
            coordinator_poll_ms: default_coordinator_poll_ms(),
            sync_poll_ms: default_sync_poll_ms(),
        }
    }
}

impl IngestConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| StorageError::Config(e.to_string()))
    }

    /// Check cross-field constraints and key material.
    pub fn validate(&self) -> Result<()> {
        if self.log.topic.is_empty() {
            return Err(StorageError::Config("log.topic must not be empty".into()));
        }
        if self.log.partitions == 0 {
            return Err(StorageError::Config("log.partitions must be >= 1".into()));
        }
        if self.log.commit_period_ms == 0 {
            return Err(StorageError::Config("log.commit_period_ms must be > 0".into()));
        }
        if self.log.max_time_between_commits_ms <= self.log.commit_period_ms {
            return Err(StorageError::Config(format!(
                "log.max_time_between_commits_ms ({}) must exceed log.commit_period_ms ({})",
                self.log.max_time_between_commits_ms, self.log.commit_period_ms
            )));
        }
        if self.store.modulus < 1 {
            return Err(StorageError::Config(format!(
                "store.modulus must be >= 1, got {}",
                self.store.modulus
            )));
        }
        if self.store.table.is_empty() {
            return Err(StorageError::Config("store.table must not be empty".into()));
        }
        if self.lifecycle.join_max_attempts == 0 {
            return Err(StorageError::Config(
                "lifecycle.join_max_attempts must be >= 1".into(),
            ));
        }
        self.keys.provider()?;
        Ok(())
    }

    pub fn commit_period(&self) -> Duration {
        Duration::from_millis(self.log.commit_period_ms)
    }

    pub fn max_time_between_commits(&self) -> Duration {
        Duration::from_millis(self.log.max_time_between_commits_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.log.poll_timeout_ms)
    }

    pub fn eager_flush_age(&self) -> Duration {
        Duration::from_millis(self.store.eager_flush_age_ms)
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.lifecycle.respawn_delay_ms)
    }

    pub fn join_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lifecycle.join_retry_interval_ms)
    }

    pub fn coordinator_poll(&self) -> Duration {
        Duration::from_millis(self.lifecycle.coordinator_poll_ms)
    }

    pub fn sync_poll(&self) -> Duration {
        Duration::from_millis(self.lifecycle.sync_poll_ms.max(1))
    }
}

fn default_topic() -> String {
    "tidestore-data".to_string()
}

fn default_group_id() -> String {
    "tidestore-ingest".to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_commit_period_ms() -> u64 {
    1000
}

fn default_max_time_between_commits_ms() -> u64 {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_offset_reset() -> OffsetReset {
    OffsetReset::Earliest
}

fn default_table() -> String {
    "continuum".to_string()
}

fn default_column_family() -> String {
    "v".to_string()
}

fn default_max_pending_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_eager_flush_age_ms() -> u64 {
    500
}

fn default_modulus() -> i64 {
    1
}

fn default_respawn_delay_ms() -> u64 {
    100
}

fn default_join_retry_interval_ms() -> u64 {
    100
}

fn default_join_max_attempts() -> u32 {
    10
}

fn default_coordinator_poll_ms() -> u64 {
    10
}

fn default_sync_poll_ms() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.eager_flush_age(), Duration::from_millis(500));
        assert_eq!(config.store.modulus, 1);
        assert!(!config.store.skip_write);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = IngestConfig::from_toml_str(
            r#"
            [log]
            topic = "metrics"
            partitions = 8
            offset_reset = "latest"

            [store.connection]
            "zookeeper.quorum" = "zk1,zk2"
            "#,
        )
        .unwrap();

        assert_eq!(config.log.topic, "metrics");
        assert_eq!(config.log.partitions, 8);
        assert_eq!(config.log.commit_period_ms, 1000);
        assert_eq!(config.log.offset_reset, OffsetReset::Latest);
        assert_eq!(config.store.table, "continuum");
        assert_eq!(
            config.store.connection.get("zookeeper.quorum").map(String::as_str),
            Some("zk1,zk2")
        );
    }

    #[test]
    fn test_commit_window_must_exceed_period() {
        let mut config = IngestConfig::default();
        config.log.max_time_between_commits_ms = config.log.commit_period_ms;
        assert!(matches!(config.validate(), Err(StorageError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_modulus_and_partitions() {
        let mut config = IngestConfig::default();
        config.store.modulus = 0;
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        config.log.partitions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_lengths_checked() {
        let mut config = IngestConfig::default();
        config.keys.log_mac = Some("00112233".to_string());
        assert!(config.validate().is_err());

        config.keys.log_mac = Some("000102030405060708090a0b0c0d0e0f".to_string());
        config.keys.log_cipher = Some(String::new());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(IngestConfig::from_toml_str("[log\ntopic = 1").is_err());
    }
}
