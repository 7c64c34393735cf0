//! # shared
//!
//! why: the state every role reads and writes, with persistence wired into each mutation
//! relations: owned by node.rs, borrowed mutably by the role handlers one task at a time
//! what: Core (term, vote, log, indexes, membership, outbox, pending), apply and snapshot steps

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info};

use crate::cluster::ClusterConfig;
use crate::config::RaftConfig;
use crate::error::{ClientError, RaftError};
use crate::log::{EntryPayload, LogEntry, LogPosition, RaftLog, RequestId};
use crate::message::{Envelope, RaftMessage};
use crate::pending::PendingTransactions;
use crate::storage::{Snapshot, SnapshotMeta, StateMachine, Storage};
use crate::timer::{Timer, TimerKind};
use crate::NodeId;

pub(crate) struct Core {
    pub id: NodeId,
    pub config: RaftConfig,
    pub cluster: ClusterConfig,
    /// Index of the entry (or snapshot) that produced `cluster`
    pub config_index: u64,
    pub storage: Box<dyn Storage>,
    pub state_machine: Box<dyn StateMachine>,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<NodeId>,
    /// Highest applied request seq per origin node
    pub applied_requests: BTreeMap<NodeId, u64>,
    pub pending: PendingTransactions,
    pub sweep_timer: Timer,
    pub outbox: Vec<Envelope>,
    pub now: u64,
    pub offline: bool,
    /// Set when an applied entry changed membership; consumed by the node
    pub membership_changed: bool,
    rng: StdRng,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        cluster: ClusterConfig,
        config_index: u64,
        storage: Box<dyn Storage>,
        state_machine: Box<dyn StateMachine>,
        term: u64,
        voted_for: Option<NodeId>,
        log: RaftLog,
        now: u64,
    ) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // request ids must not collide with entries submitted by an earlier incarnation
        let seq_base = u64::from(rng.gen::<u32>()) << 32;
        Self {
            id,
            config,
            cluster,
            config_index,
            storage,
            state_machine,
            term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            applied_requests: BTreeMap::new(),
            pending: PendingTransactions::starting_at(seq_base),
            sweep_timer: Timer::new(TimerKind::TransactionSweep),
            outbox: Vec::new(),
            now,
            offline: false,
            membership_changed: false,
            rng,
        }
    }

    pub fn is_member(&self) -> bool {
        self.cluster.contains(self.id)
    }

    pub fn send(&mut self, to: NodeId, message: RaftMessage) {
        self.outbox.push(Envelope::new(self.id, to, message));
    }

    pub fn random_election_deadline(&mut self) -> u64 {
        let timeout = self
            .rng
            .gen_range(self.config.election_timeout_min..self.config.election_timeout_max);
        self.now + timeout
    }

    /// Adopt a newer term and forget any vote cast in the old one.
    pub fn update_term(&mut self, term: u64) -> Result<(), RaftError> {
        debug_assert!(term > self.term, "term must never decrease");
        self.storage.save_term_and_vote(term, None)?;
        self.term = term;
        self.voted_for = None;
        self.leader_id = None;
        Ok(())
    }

    pub fn vote_for(&mut self, candidate: NodeId) -> Result<(), RaftError> {
        self.storage.save_term_and_vote(self.term, Some(candidate))?;
        self.voted_for = Some(candidate);
        Ok(())
    }

    /// Start a new election term voting for ourselves.
    pub fn start_term_as_candidate(&mut self) -> Result<(), RaftError> {
        let term = self.term + 1;
        self.storage.save_term_and_vote(term, Some(self.id))?;
        self.term = term;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        Ok(())
    }

    /// Append a new entry of the current term at the tail.
    pub fn append_new(&mut self, payload: EntryPayload) -> Result<LogPosition, RaftError> {
        let entry = LogEntry::new(self.term, self.log.last_index() + 1, payload);
        let position = entry.position();
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        self.log.append(entry);
        Ok(position)
    }

    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> Result<(), RaftError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.storage.append_entries(&entries)?;
        for entry in entries {
            self.log.append(entry);
        }
        Ok(())
    }

    /// Discard a conflicting tail; committed entries are never touched.
    pub fn truncate_log_from(&mut self, index: u64) -> Result<(), RaftError> {
        if index <= self.commit_index {
            error!(node = self.id, index, commit = self.commit_index, "refusing to truncate committed entries");
            return Err(RaftError::LogMismatch { index });
        }
        self.storage.truncate_log_from(index)?;
        let removed = self.log.truncate_from(index);
        info!(node = self.id, from = index, removed = removed.len(), "truncated conflicting log tail");
        self.pending.on_truncated(index);
        Ok(())
    }

    pub fn note_applied(&mut self, request_id: RequestId) {
        let seq = self.applied_requests.entry(request_id.node).or_insert(0);
        *seq = (*seq).max(request_id.seq);
    }

    /// A request no longer in the retained log whose origin already had a
    /// later or equal request applied.
    pub fn is_compacted_duplicate(&self, request_id: RequestId) -> bool {
        self.log.position_of(request_id).is_none()
            && self
                .applied_requests
                .get(&request_id.node)
                .is_some_and(|seq| request_id.seq <= *seq)
    }

    /// Whether a membership change is appended but not yet committed.
    pub fn config_change_pending(&self) -> bool {
        self.log
            .entries_after(self.commit_index)
            .iter()
            .any(LogEntry::is_config_change)
    }

    /// Raise the commit index (never lowers it) and apply the backlog.
    pub fn commit_through(&mut self, index: u64) -> Result<(), RaftError> {
        if index > self.commit_index {
            debug!(node = self.id, from = self.commit_index, to = index, "commit index advanced");
            self.commit_index = index;
            self.apply_committed()?;
        }
        Ok(())
    }

    /// Deliver every committed but unapplied entry, strictly in index order.
    pub fn apply_committed(&mut self) -> Result<(), RaftError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index) else {
                error!(node = self.id, index, "committed entry missing from log");
                break;
            };
            let request_id = entry.request_id();
            let result = match &entry.payload {
                EntryPayload::Noop => Ok(Vec::new()),
                EntryPayload::Command { data, .. } => {
                    if index <= self.state_machine.applied_index() {
                        // applied before a restart
                        Ok(Vec::new())
                    } else {
                        self.state_machine.apply(index, data).map_err(ClientError::from)
                    }
                }
                EntryPayload::ConfigChange { change, .. } => {
                    if index > self.config_index {
                        let change = change.clone();
                        self.cluster.apply(&change);
                        self.config_index = index;
                        self.storage.save_config(index, &self.cluster)?;
                        self.membership_changed = true;
                        info!(
                            node = self.id,
                            index,
                            member = change.node,
                            removed = change.address.is_none(),
                            "cluster membership changed"
                        );
                    }
                    Ok(Vec::new())
                }
            };
            self.last_applied = index;
            if let Some(request_id) = request_id {
                self.note_applied(request_id);
            }
            self.pending.on_applied(index, request_id, result);
        }
        self.maybe_snapshot()
    }

    /// Compact the log once enough applied entries are retained.
    pub fn maybe_snapshot(&mut self) -> Result<(), RaftError> {
        let retained = self.last_applied.saturating_sub(self.log.snapshot_index());
        if retained < self.config.snapshot_threshold {
            return Ok(());
        }
        let index = self.last_applied;
        let Some(term) = self.log.term_at(index) else {
            return Ok(());
        };
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                config: self.cluster.clone(),
                applied_requests: self.applied_requests.clone(),
            },
            data: self.state_machine.snapshot(),
        };
        self.storage.save_snapshot(&snapshot)?;
        self.storage.purge_log_through(index)?;
        self.log.compact_through(index);
        info!(node = self.id, index, term, "log compacted into snapshot");
        Ok(())
    }

    /// Replace log and state machine with a snapshot received from the leader.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<(), RaftError> {
        let index = snapshot.meta.last_included_index;
        let term = snapshot.meta.last_included_term;
        self.state_machine
            .restore(index, &snapshot.data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.storage.save_snapshot(&snapshot)?;
        self.storage.truncate_log_from(0)?;
        self.storage.save_config(index, &snapshot.meta.config)?;
        self.log.install_snapshot(index, term);
        self.pending.on_snapshot_installed(index);
        self.applied_requests = snapshot.meta.applied_requests;
        if self.cluster != snapshot.meta.config {
            self.membership_changed = true;
        }
        self.cluster = snapshot.meta.config;
        self.config_index = index;
        self.commit_index = index;
        self.last_applied = index;
        info!(node = self.id, index, term, "installed snapshot from leader");
        Ok(())
    }

    /// Keep the transaction sweep timer aligned with the earliest pending deadline.
    pub fn rearm_sweep(&mut self) {
        match self.pending.earliest_deadline() {
            Some(deadline) => self.sweep_timer.timeout_at(deadline),
            None => self.sweep_timer.cancel(),
        }
    }
}
