//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs and the roles for replication, persisted via the Storage trait
//! what: LogEntry and its payloads, RaftLog with truncation and snapshot compaction

use serde::{Deserialize, Serialize};

use crate::cluster::ConfigChange;
use crate::NodeId;

/// Identifies a client transaction across nodes.
///
/// `node` is the node the caller submitted to, `seq` is that node's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub node: NodeId,
    pub seq: u64,
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.node, self.seq)
    }
}

/// Where an entry sits in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub term: u64,
    pub index: u64,
}

/// What a log entry asks the node to do once committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader so earlier-term entries can commit
    Noop,
    /// Opaque client command for the state machine
    Command { request_id: RequestId, data: Vec<u8> },
    /// Membership change, effective once applied
    ConfigChange { request_id: RequestId, change: ConfigChange },
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The payload to be applied once committed
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, payload: EntryPayload) -> Self {
        Self { term, index, payload }
    }

    /// Shorthand for a client command entry
    pub fn command(term: u64, index: u64, request_id: RequestId, data: Vec<u8>) -> Self {
        Self::new(term, index, EntryPayload::Command { request_id, data })
    }

    /// Request id of the transaction that produced this entry, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.payload {
            EntryPayload::Noop => None,
            EntryPayload::Command { request_id, .. } => Some(*request_id),
            EntryPayload::ConfigChange { request_id, .. } => Some(*request_id),
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition { term: self.term, index: self.index }
    }

    pub fn is_config_change(&self) -> bool {
        matches!(self.payload, EntryPayload::ConfigChange { .. })
    }
}

/// In-memory view of the retained log.
///
/// Entries at or below `snapshot_index` have been compacted into a snapshot;
/// only their covering `(snapshot_index, snapshot_term)` is remembered.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the log from persisted state after a restart.
    ///
    /// Entries already covered by the snapshot are dropped.
    pub fn restore(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        let entries: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        debug_assert!(entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == snapshot_index + 1 + i as u64));
        Self { entries, snapshot_index, snapshot_term }
    }

    /// Index of the oldest retained entry
    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the entry at `index`; index 0 has term 0.
    ///
    /// Returns `None` for compacted (other than the snapshot point) or missing indexes.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Clone up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        if start <= self.snapshot_index || start > self.last_index() {
            return Vec::new();
        }
        let offset = (start - self.snapshot_index - 1) as usize;
        self.entries[offset..].iter().take(max).cloned().collect()
    }

    /// All retained entries with index greater than `index`.
    pub fn entries_after(&self, index: u64) -> &[LogEntry] {
        let offset = index.saturating_sub(self.snapshot_index) as usize;
        self.entries.get(offset..).unwrap_or(&[])
    }

    /// Append at the tail. The entry must carry the next index.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log append must be contiguous");
        self.entries.push(entry);
    }

    /// Discard `index` and everything after it, returning the removed entries.
    pub fn truncate_from(&mut self, index: u64) -> Vec<LogEntry> {
        if index > self.last_index() {
            return Vec::new();
        }
        let offset = index.saturating_sub(self.snapshot_index + 1) as usize;
        self.entries.split_off(offset)
    }

    /// Drop everything up to and including `index`, which becomes the snapshot point.
    pub fn compact_through(&mut self, index: u64) {
        if index <= self.snapshot_index {
            return;
        }
        let Some(term) = self.term_at(index) else {
            return;
        };
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Replace the whole log by a snapshot point.
    pub fn install_snapshot(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_index = index;
        self.snapshot_term = term;
    }

    /// Position of the retained entry carrying `request_id`, newest first.
    pub fn position_of(&self, request_id: RequestId) -> Option<LogPosition> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.request_id() == Some(request_id))
            .map(LogEntry::position)
    }

    /// Whether a candidate whose log ends at `(last_term, last_index)` is at
    /// least as up to date as this log.
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        (last_term, last_index) >= (self.last_term(), self.last_index())
    }
}
