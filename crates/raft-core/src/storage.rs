//! # storage
//!
//! why: the node's only view of durable state and of the replicated key-value engine
//! relations: implemented by raft-storage (FileStorage, InMemoryStorage, KvStateMachine)
//! what: Storage trait, StateMachine trait, Snapshot

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::error::ApplyError;
use crate::log::LogEntry;
use crate::NodeId;

/// Covering point of a snapshot plus the membership in force at that point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub config: ClusterConfig,
    /// Highest request seq applied per origin node, for dropping late duplicates
    #[serde(default)]
    pub applied_requests: BTreeMap<NodeId, u64>,
}

/// A point-in-time image of the state machine replacing a log prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Durable storage of raft state.
///
/// Every method must be durable when it returns `Ok`; the node releases
/// votes and acknowledgements only after that.
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(u64, Option<NodeId>)>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all retained log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// drop entries up to and including `index` once a snapshot covers them
    fn purge_log_through(&mut self, index: u64) -> io::Result<()>;

    /// persist the latest committed membership and the index that produced it
    fn save_config(&mut self, index: u64, config: &ClusterConfig) -> io::Result<()>;

    /// load the persisted membership, if any
    fn load_config(&self) -> io::Result<Option<(u64, ClusterConfig)>>;

    /// replace the stored snapshot
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()>;

    /// load the stored snapshot, if any
    fn load_snapshot(&self) -> io::Result<Option<Snapshot>>;
}

/// The replicated key-value engine committed entries are applied to.
pub trait StateMachine: Send {
    /// Apply a committed command. Called once per index, in index order.
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<Vec<u8>, ApplyError>;

    /// Highest index whose command this state machine has applied.
    fn applied_index(&self) -> u64;

    /// Serialize the full state.
    fn snapshot(&self) -> Vec<u8>;

    /// Replace the full state with a snapshot covering `index`.
    fn restore(&mut self, index: u64, data: &[u8]) -> Result<(), ApplyError>;
}
