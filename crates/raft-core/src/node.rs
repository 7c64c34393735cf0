//! # node
//!
//! why: serialize every input of a raft node through one task queue and one active role
//! relations: owns Core and Role, drives role.rs handlers, driven by raft-runtime or a test clock
//! what: RaftNode (recover, tick, handle_message, submit, admin), Task, NodeStatus

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterConfig, ConfigChange};
use crate::config::RaftConfig;
use crate::error::{AdminError, ClientError, RaftError};
use crate::log::{EntryPayload, LogEntry, LogPosition, RaftLog, RequestId};
use crate::message::{Envelope, Proposal, RaftMessage};
use crate::pending::TransactionFuture;
use crate::role::{non_leader, NodeState, Role, RoleId, Transition};
use crate::shared::Core;
use crate::storage::{SnapshotMeta, StateMachine, Storage};
use crate::timer::TimerKind;
use crate::NodeId;

/// One unit of work for the node's executor
#[derive(Debug)]
enum Task {
    Message(Envelope),
    /// `owner` is the role that armed the timer; `None` for node-level timers
    Timer { owner: Option<RoleId>, kind: TimerKind },
    Submit { request_id: RequestId, proposal: Proposal },
}

/// Point-in-time view of a node for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub state: NodeState,
    pub role_id: RoleId,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub first_index: u64,
    pub last_index: u64,
    pub election_deadline: Option<u64>,
    pub members: Vec<NodeId>,
    pub configured: bool,
    pub pending_transactions: usize,
    pub offline: bool,
}

/// A single Raft node in the cluster
///
/// The node never blocks and never touches the network: inputs arrive via
/// [`tick`](Self::tick), [`handle_message`](Self::handle_message) and
/// [`submit`](Self::submit); outbound messages are collected with
/// [`take_messages`](Self::take_messages) after each call.
pub struct RaftNode {
    core: Core,
    role: Role,
    queue: VecDeque<Task>,
    next_role_id: u64,
}

impl RaftNode {
    /// Restart a node from whatever its storage holds.
    ///
    /// An empty storage yields an unconfigured follower waiting to be added
    /// to a cluster or bootstrapped.
    pub fn recover(
        id: NodeId,
        config: RaftConfig,
        storage: Box<dyn Storage>,
        mut state_machine: Box<dyn StateMachine>,
        now: u64,
    ) -> Result<Self, RaftError> {
        let config = config.validate()?;
        let (term, voted_for) = storage.load_term_and_vote()?;
        let snapshot = storage.load_snapshot()?;
        let meta = snapshot.as_ref().map(|s| s.meta.clone()).unwrap_or_default();
        if let Some(snapshot) = &snapshot {
            if state_machine.applied_index() < meta.last_included_index {
                state_machine
                    .restore(meta.last_included_index, &snapshot.data)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            }
        }

        let log = RaftLog::restore(meta.last_included_index, meta.last_included_term, storage.load_log()?);
        let (config_index, cluster) = match storage.load_config()? {
            Some((index, cluster)) if index >= meta.last_included_index => (index, cluster),
            _ => (meta.last_included_index, meta.config.clone()),
        };
        let last_applied = meta
            .last_included_index
            .max(state_machine.applied_index().min(log.last_index()));
        let commit_index = last_applied.max(config_index.min(log.last_index()));

        let mut core = Core::new(
            id,
            config,
            cluster,
            config_index,
            storage,
            state_machine,
            term,
            voted_for,
            log,
            now,
        );
        core.applied_requests = meta.applied_requests;
        for index in meta.last_included_index + 1..=last_applied {
            if let Some(request_id) = core.log.get(index).and_then(LogEntry::request_id) {
                core.note_applied(request_id);
            }
        }
        core.last_applied = last_applied;
        core.commit_index = last_applied;
        core.commit_through(commit_index)?;
        core.membership_changed = false;

        let (role, _) = Role::setup(&mut core, RoleId(1), Transition::Follower { leader: None })?;
        info!(
            node = id,
            term,
            last_index = core.log.last_index(),
            commit = core.commit_index,
            configured = core.is_member(),
            "node recovered"
        );
        Ok(Self { core, role, queue: VecDeque::new(), next_role_id: 2 })
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    pub fn state(&self) -> NodeState {
        self.role.state()
    }

    pub fn term(&self) -> u64 {
        self.core.term
    }

    pub fn commit_index(&self) -> u64 {
        self.core.commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.core.last_applied
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.core.leader_id
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.core.cluster
    }

    pub fn log(&self) -> &RaftLog {
        &self.core.log
    }

    pub fn state_machine(&self) -> &dyn StateMachine {
        self.core.state_machine.as_ref()
    }

    pub fn is_offline(&self) -> bool {
        self.core.offline
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.core.id,
            state: self.role.state(),
            role_id: self.role.id(),
            term: self.core.term,
            voted_for: self.core.voted_for,
            leader: self.core.leader_id,
            commit_index: self.core.commit_index,
            last_applied: self.core.last_applied,
            first_index: self.core.log.first_index(),
            last_index: self.core.log.last_index(),
            election_deadline: self.role.election_timer().and_then(|t| t.deadline()),
            members: self.core.cluster.ids().collect(),
            configured: self.core.is_member(),
            pending_transactions: self.core.pending.len(),
            offline: self.core.offline,
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        if self.core.offline {
            return None;
        }
        [self.role.timer().deadline(), self.core.sweep_timer.deadline()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Drain the messages produced since the last call.
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.core.outbox)
    }

    /// Advance the clock, turning due timers into tasks.
    pub fn tick(&mut self, now: u64) {
        self.core.now = self.core.now.max(now);
        let now = self.core.now;
        if self.role.timer_mut().poll(now) {
            let kind = self.role.timer().kind();
            self.queue.push_back(Task::Timer { owner: Some(self.role.id()), kind });
        }
        if self.core.sweep_timer.poll(now) {
            self.queue.push_back(Task::Timer { owner: None, kind: TimerKind::TransactionSweep });
        }
        self.run_tasks();
    }

    pub fn handle_message(&mut self, envelope: Envelope) {
        if envelope.to != self.core.id {
            warn!(node = self.core.id, to = envelope.to, "misaddressed message dropped");
            return;
        }
        self.queue.push_back(Task::Message(envelope));
        self.run_tasks();
    }

    /// Decode and handle a message received as bytes.
    pub fn handle_encoded(&mut self, bytes: &[u8]) -> Result<(), RaftError> {
        let envelope = Envelope::decode(bytes)?;
        self.handle_message(envelope);
        Ok(())
    }

    /// Submit a client command; callable on any node.
    pub fn submit(&mut self, command: Vec<u8>) -> TransactionFuture {
        self.enqueue_proposal(Proposal::Command(command))
    }

    /// Propose a membership change through the log.
    pub fn propose_config_change(&mut self, change: ConfigChange) -> TransactionFuture {
        self.enqueue_proposal(Proposal::ConfigChange(change))
    }

    fn enqueue_proposal(&mut self, proposal: Proposal) -> TransactionFuture {
        let deadline = self.core.now + self.core.config.transaction_timeout;
        let (request_id, future) = self.core.pending.register(self.core.id, deadline);
        if self.core.offline {
            self.core.pending.resolve(&request_id, Err(ClientError::Offline));
            return future;
        }
        self.core.rearm_sweep();
        self.queue.push_back(Task::Submit { request_id, proposal });
        self.run_tasks();
        future
    }

    /// Create a brand new single-member cluster on an unconfigured, empty node.
    pub fn bootstrap(&mut self, address: impl Into<String>) -> Result<(), AdminError> {
        if self.core.offline {
            return Err(AdminError::Offline);
        }
        if !self.core.cluster.is_empty() || self.core.log.last_index() > 0 {
            return Err(AdminError::AlreadyConfigured);
        }
        let result = self.initialize_cluster(address.into());
        if let Err(err) = result {
            self.on_fault(err);
            return Err(AdminError::Offline);
        }
        self.run_tasks();
        Ok(())
    }

    fn initialize_cluster(&mut self, address: String) -> Result<(), RaftError> {
        let core = &mut self.core;
        if core.term == 0 {
            core.update_term(1)?;
        }
        let change = ConfigChange::add(core.id, address);
        let entry = LogEntry::new(
            core.term,
            1,
            EntryPayload::ConfigChange { request_id: RequestId { node: core.id, seq: 0 }, change },
        );
        core.append_entries(vec![entry])?;
        core.commit_through(1)?;
        info!(node = core.id, term = core.term, "bootstrapped new cluster");
        self.sync_membership()
    }

    /// Make the election timer of `role` expire now.
    pub fn force_election(&mut self, role: RoleId) -> Result<(), AdminError> {
        if self.core.offline {
            return Err(AdminError::Offline);
        }
        if self.role.id() != role {
            return Err(AdminError::RoleChanged);
        }
        let now = self.core.now;
        match self.role.election_timer_mut() {
            Some(timer) if timer.is_running() => {
                debug!(node = self.core.id, "forcing immediate election timeout");
                timer.timeout_now(now);
            }
            _ => return Err(AdminError::TimerNotRunning),
        }
        self.tick(now);
        Ok(())
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.queue.pop_front() {
            if self.core.offline {
                continue;
            }
            let result = self.execute(task).and_then(|()| self.sync_membership());
            if let Err(err) = result {
                self.on_fault(err);
            }
        }
    }

    fn on_fault(&mut self, err: RaftError) {
        match err {
            RaftError::Persistence(e) => {
                error!(node = self.core.id, error = %e, "persistence failure, taking node offline");
                self.core.offline = true;
                self.role.shutdown();
                self.core.sweep_timer.cancel();
                self.core.outbox.clear();
                self.queue.clear();
                self.core.pending.fail_all(ClientError::Offline);
            }
            other => warn!(node = self.core.id, role = self.role.name(), error = %other, "protocol fault, message discarded"),
        }
    }

    fn execute(&mut self, task: Task) -> Result<(), RaftError> {
        match task {
            Task::Message(envelope) => self.dispatch(envelope),
            Task::Timer { owner: Some(owner), kind } if owner != self.role.id() => {
                debug!(node = self.core.id, ?kind, ?owner, "timer of retired role ignored");
                Ok(())
            }
            Task::Timer { kind, .. } => self.on_timer(kind),
            Task::Submit { request_id, proposal } => self.on_submit(request_id, proposal),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) -> Result<(), RaftError> {
        match kind {
            TimerKind::Election => {
                if matches!(self.role, Role::Leader(_)) {
                    return Ok(());
                }
                match non_leader::handle_election_timeout(&self.core, self.role.name()) {
                    Some(next) => self.transition_to(next),
                    None => Ok(()),
                }
            }
            TimerKind::Heartbeat => match &mut self.role {
                Role::Leader(leader) => leader.handle_heartbeat_timeout(&mut self.core),
                _ => Ok(()),
            },
            TimerKind::TransactionSweep => {
                self.core.pending.expire(self.core.now);
                self.core.rearm_sweep();
                Ok(())
            }
        }
    }

    fn on_submit(&mut self, request_id: RequestId, proposal: Proposal) -> Result<(), RaftError> {
        if !self.core.pending.contains(&request_id) {
            return Ok(());
        }
        match &mut self.role {
            Role::Leader(leader) => match leader.propose(&mut self.core, request_id, proposal)? {
                Ok(position) => self.core.pending.set_position(&request_id, position, true),
                Err(err) => self.core.pending.resolve(&request_id, Err(err)),
            },
            _ => match self.core.leader_id {
                Some(leader) if leader != self.core.id => {
                    debug!(node = self.core.id, leader, request = %request_id, "forwarding proposal to leader");
                    self.core.send(leader, RaftMessage::CommitRequest { request_id, proposal });
                }
                _ => self.core.pending.resolve(&request_id, Err(ClientError::NoLeader)),
            },
        }
        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) -> Result<(), RaftError> {
        let Envelope { from, message, .. } = envelope;

        if let RaftMessage::CommitResponse { request_id, result } = message {
            self.on_commit_response(request_id, result);
            return Ok(());
        }

        if let Some(term) = message.term() {
            if term < self.core.term {
                self.reject_stale(from, &message);
                return Ok(());
            }
            if term > self.core.term {
                info!(node = self.core.id, from, term, old_term = self.core.term, "observed higher term");
                self.core.update_term(term)?;
                if !matches!(self.role, Role::Follower(_)) {
                    self.transition_to(Transition::Follower { leader: None })?;
                }
            }
        }

        // a legitimate leader of our term ends any candidacy
        if matches!(
            message,
            RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. }
        ) && matches!(self.role, Role::Candidate(_))
        {
            self.transition_to(Transition::Follower { leader: Some(from) })?;
        }

        let role_name = self.role.name();
        match message {
            RaftMessage::RequestVote { candidate_id, last_log_index, last_log_term, .. } => {
                self.role
                    .handle_request_vote(&mut self.core, from, candidate_id, last_log_index, last_log_term)
            }
            RaftMessage::RequestVoteResponse { granted, .. } => match &mut self.role {
                Role::Candidate(candidate) => {
                    match candidate.handle_vote_response(&self.core, from, granted) {
                        Some(next) => self.transition_to(next),
                        None => Ok(()),
                    }
                }
                _ => {
                    debug!(node = self.core.id, from, role = role_name, "late vote response ignored");
                    Ok(())
                }
            },
            RaftMessage::AppendEntries {
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                ..
            } => match &mut self.role {
                Role::Follower(follower) => follower.handle_append_entries(
                    &mut self.core,
                    from,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                ),
                _ => {
                    error!(node = self.core.id, from, term = self.core.term, "another leader in our term");
                    Err(RaftError::UnexpectedMessage { message: "AppendEntries", role: role_name })
                }
            },
            RaftMessage::InstallSnapshot {
                leader_id,
                last_included_index,
                last_included_term,
                config,
                applied_requests,
                data,
                ..
            } => match &mut self.role {
                Role::Follower(follower) => {
                    let meta = SnapshotMeta {
                        last_included_index,
                        last_included_term,
                        config,
                        applied_requests,
                    };
                    follower.handle_install_snapshot(&mut self.core, from, leader_id, meta, data)
                }
                _ => {
                    error!(node = self.core.id, from, term = self.core.term, "another leader in our term");
                    Err(RaftError::UnexpectedMessage { message: "InstallSnapshot", role: role_name })
                }
            },
            RaftMessage::AppendResponse { success, match_index, conflict_hint, .. } => {
                match &mut self.role {
                    Role::Leader(leader) => {
                        leader.handle_append_response(&mut self.core, from, success, match_index, conflict_hint)
                    }
                    _ => Err(non_leader::reject_leader_only(&mut self.core, role_name, from, &message)),
                }
            }
            RaftMessage::CommitRequest { request_id, proposal } => match &mut self.role {
                Role::Leader(_) if self.core.is_compacted_duplicate(request_id) => {
                    // the origin learns the outcome by applying the entry itself
                    debug!(node = self.core.id, from, request = %request_id, "already applied request dropped");
                    Ok(())
                }
                Role::Leader(leader) => {
                    let result = leader.propose(&mut self.core, request_id, proposal)?;
                    self.core.send(from, RaftMessage::CommitResponse { request_id, result });
                    Ok(())
                }
                _ => {
                    let message = RaftMessage::CommitRequest { request_id, proposal };
                    Err(non_leader::reject_leader_only(&mut self.core, role_name, from, &message))
                }
            },
            RaftMessage::CommitResponse { .. } => Ok(()),
        }
    }

    /// Answer a message from an obsolete term so its sender learns the new term.
    fn reject_stale(&mut self, from: NodeId, message: &RaftMessage) {
        let term = self.core.term;
        let fault = RaftError::StaleTerm { received: message.term().unwrap_or(0), current: term };
        debug!(node = self.core.id, from, kind = message.kind(), error = %fault, "message dropped");
        match message {
            RaftMessage::RequestVote { .. } => {
                self.core.send(from, RaftMessage::RequestVoteResponse { term, granted: false });
            }
            RaftMessage::AppendEntries { .. } | RaftMessage::InstallSnapshot { .. } => {
                self.core.send(
                    from,
                    RaftMessage::AppendResponse { term, success: false, match_index: 0, conflict_hint: 0 },
                );
            }
            _ => {}
        }
    }

    /// The leader told us where our forwarded proposal landed.
    fn on_commit_response(&mut self, request_id: RequestId, result: Result<LogPosition, ClientError>) {
        let core = &mut self.core;
        if !core.pending.contains(&request_id) {
            debug!(node = core.id, request = %request_id, "response for resolved transaction ignored");
            return;
        }
        match result {
            Err(err) => core.pending.resolve(&request_id, Err(err)),
            Ok(position) if position.index <= core.log.snapshot_index() => {
                // the slot arrived with a snapshot, its command is not visible here
                core.pending
                    .resolve(&request_id, Err(ClientError::OutcomeUnknown { index: position.index }));
            }
            Ok(position) if position.index <= core.last_applied => {
                // had it been ours, applying it would have resolved the transaction
                core.pending
                    .resolve(&request_id, Err(ClientError::Abandoned { index: position.index }));
            }
            Ok(position) => core.pending.set_position(&request_id, position, false),
        }
    }

    /// Swap the active role: shutdown, replace, setup.
    fn transition_to(&mut self, mut transition: Transition) -> Result<(), RaftError> {
        loop {
            let was_leader = matches!(self.role, Role::Leader(_));
            let from = self.role.name();
            self.role.shutdown();
            if was_leader {
                self.core.pending.on_leadership_lost(self.core.commit_index);
            }

            let id = RoleId(self.next_role_id);
            self.next_role_id += 1;
            let (role, next) = Role::setup(&mut self.core, id, transition)?;
            self.role = role;
            info!(node = self.core.id, term = self.core.term, from, to = self.role.name(), "role transition");

            match next {
                Some(next) => transition = next,
                None => return Ok(()),
            }
        }
    }

    /// React to membership changes applied during the last task.
    fn sync_membership(&mut self) -> Result<(), RaftError> {
        if !std::mem::take(&mut self.core.membership_changed) {
            return Ok(());
        }
        let member = self.core.is_member();
        match &mut self.role {
            Role::Leader(leader) if !member => {
                // let the remaining members learn the commit before we go quiet
                leader.sync_peers(&mut self.core)?;
                leader.broadcast(&mut self.core)?;
                info!(node = self.core.id, "removed from cluster, stepping down");
                self.transition_to(Transition::Follower { leader: None })
            }
            Role::Leader(leader) => {
                leader.sync_peers(&mut self.core)?;
                leader.broadcast(&mut self.core)
            }
            Role::Candidate(_) if !member => self.transition_to(Transition::Follower { leader: None }),
            Role::Follower(_) | Role::Candidate(_) => {
                if let Some(timer) = self.role.election_timer_mut() {
                    if member != timer.is_running() {
                        non_leader::restart_election_timer(&mut self.core, timer);
                    }
                }
                Ok(())
            }
        }
    }
}
