//! # config
//!
//! why: timing and sizing knobs for a raft node, loadable from json
//! relations: read by node.rs and the roles, validated before a node starts
//! what: RaftConfig with defaults, validation, ConfigError

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunable parameters of a raft node. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound (inclusive) of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound (exclusive) of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// Maximum number of entries carried by one AppendEntries
    pub max_entries_per_append: usize,
    /// Number of applied entries retained before the log is compacted into a snapshot
    pub snapshot_threshold: u64,
    /// How long a submitted transaction may stay unresolved before it fails
    pub transaction_timeout: u64,
    /// Seed for the election timeout generator; random when absent
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
            snapshot_threshold: 1000,
            transaction_timeout: 5000,
            rng_seed: None,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout range is empty: min {min} >= max {max}")]
    EmptyElectionRange { min: u64, max: u64 },

    #[error("heartbeat interval {heartbeat} must be shorter than the minimum election timeout {election_min}")]
    HeartbeatTooSlow { heartbeat: u64, election_min: u64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid config json: {0}")]
    Json(String),
}

impl RaftConfig {
    /// Check the relationships between the timing values.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::EmptyElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election_min: self.election_timeout_min,
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::Zero("max_entries_per_append"));
        }
        if self.snapshot_threshold == 0 {
            return Err(ConfigError::Zero("snapshot_threshold"));
        }
        if self.transaction_timeout == 0 {
            return Err(ConfigError::Zero("transaction_timeout"));
        }
        Ok(self)
    }

    /// Parse and validate a json document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RaftConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))?;
        config.validate()
    }
}
