//! Pipeline configuration.
//!
//! Deserialized from TOML by the outer daemon; every knob has the
//! defaults the deployment tooling has always assumed. Unknown
//! `data_storage` values and malformed rules are fatal at startup.

use crate::error::Result;
use crate::rule::Rule;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_server_id() -> u32 {
    1001
}

fn default_bulk_size() -> usize {
    256
}

fn default_flush_bulk_time_ms() -> u64 {
    200
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./estuary-data")
}

fn default_unsynced_threshold() -> u32 {
    1000
}

fn default_seconds_threshold() -> u64 {
    30
}

fn default_verificator_interval_secs() -> u64 {
    10
}

fn default_bulks_to_track() -> usize {
    100
}

/// Backend selector for the position tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStorage {
    /// Two fields of one hash key in an external store
    #[default]
    Keyed,
    /// A small local file, written atomically
    File,
}

/// Replication pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Pseudo-replica server id, unique within the cluster
    #[serde(default = "default_server_id")]
    pub server_id: u32,

    /// Size trigger for batch flush
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Time trigger for batch flush, in milliseconds
    #[serde(default = "default_flush_bulk_time_ms")]
    pub flush_bulk_time_ms: u64,

    /// Position tracker backend
    #[serde(default)]
    pub data_storage: DataStorage,

    /// Per-installation namespace appended to durable keys
    #[serde(default)]
    pub key_suffix: String,

    /// Data directory for the file position store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Byte drift above which a supervisor tick counts as out of sync
    #[serde(default = "default_unsynced_threshold")]
    pub unsynced_threshold: u32,

    /// Consecutive unsynced seconds before the supervisor escalates
    #[serde(default = "default_seconds_threshold")]
    pub seconds_threshold: u64,

    /// Supervisor tick cadence, in seconds
    #[serde(default = "default_verificator_interval_secs")]
    pub verificator_interval_secs: u64,

    /// Bulk latencies kept in the stats ring
    #[serde(default = "default_bulks_to_track")]
    pub bulks_to_track: usize,

    /// Take the streaming start coordinate from the master before the
    /// dump instead of from the dump tool's own output
    #[serde(default)]
    pub skip_master_data: bool,

    /// Per-table replication rules
    #[serde(default, rename = "rule")]
    pub rules: Vec<Rule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            bulk_size: default_bulk_size(),
            flush_bulk_time_ms: default_flush_bulk_time_ms(),
            data_storage: DataStorage::default(),
            key_suffix: String::new(),
            data_dir: default_data_dir(),
            unsynced_threshold: default_unsynced_threshold(),
            seconds_threshold: default_seconds_threshold(),
            verificator_interval_secs: default_verificator_interval_secs(),
            bulks_to_track: default_bulks_to_track(),
            skip_master_data: false,
            rules: Vec::new(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let config: Config = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Fatal at startup when it fails.
    pub fn validate(&self) -> Result<()> {
        use crate::error::EstuaryError;

        if self.server_id == 0 {
            return Err(EstuaryError::config("server_id must be non-zero"));
        }
        if self.bulk_size == 0 {
            return Err(EstuaryError::config("bulk_size must be at least 1"));
        }
        if self.bulks_to_track == 0 {
            return Err(EstuaryError::config("bulks_to_track must be at least 1"));
        }
        if self.verificator_interval_secs == 0 {
            return Err(EstuaryError::config(
                "verificator_interval_secs must be at least 1",
            ));
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// The time trigger as a [`Duration`].
    pub fn flush_bulk_time(&self) -> Duration {
        Duration::from_millis(self.flush_bulk_time_ms)
    }

    /// The supervisor cadence as a [`Duration`].
    pub fn verificator_interval(&self) -> Duration {
        Duration::from_secs(self.verificator_interval_secs)
    }
}
