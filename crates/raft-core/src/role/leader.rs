//! # leader
//!
//! why: replicate the log, decide what is committed, and accept client proposals
//! relations: entered from candidate on winning, steps down through node.rs on a higher term
//! what: LeaderRole, per-follower Progress cursors, heartbeat, commit advancement, proposals

use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};

use crate::cluster::ConfigChange;
use crate::error::{ClientError, RaftError};
use crate::log::{EntryPayload, LogPosition, RequestId};
use crate::message::{Proposal, RaftMessage};
use crate::role::RoleId;
use crate::shared::Core;
use crate::timer::{Timer, TimerKind};
use crate::NodeId;

/// Replication cursor for one follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next index to send
    pub next_index: u64,
    /// Highest index known to be replicated
    pub match_index: u64,
}

pub(crate) struct LeaderRole {
    pub id: RoleId,
    pub heartbeat_timer: Timer,
    pub progress: BTreeMap<NodeId, Progress>,
}

impl LeaderRole {
    pub fn setup(core: &mut Core, id: RoleId) -> Result<Self, RaftError> {
        core.leader_id = Some(core.id);
        let mut role = Self {
            id,
            heartbeat_timer: Timer::new(TimerKind::Heartbeat),
            progress: BTreeMap::new(),
        };
        role.sync_peers(core)?;
        info!(node = core.id, term = core.term, peers = role.progress.len(), "became leader");

        // commits everything left over from earlier terms once replicated
        core.append_new(EntryPayload::Noop)?;
        role.broadcast(core)?;
        role.advance_commit(core)?;
        role.heartbeat_timer.timeout_at(core.now + core.config.heartbeat_interval);
        Ok(role)
    }

    /// Add cursors for new members and drop those of removed ones.
    ///
    /// A removed peer gets one last append carrying the commit index, so it
    /// applies its own removal instead of campaigning.
    pub fn sync_peers(&mut self, core: &mut Core) -> Result<(), RaftError> {
        let removed: Vec<NodeId> = self
            .progress
            .keys()
            .copied()
            .filter(|id| !core.cluster.contains(*id))
            .collect();
        for peer in removed {
            self.send_append(core, peer)?;
            self.progress.remove(&peer);
            debug!(node = core.id, peer, "stopped replicating to removed member");
        }

        let next_index = core.log.last_index() + 1;
        for peer in core.cluster.peers(core.id) {
            self.progress
                .entry(peer)
                .or_insert(Progress { next_index, match_index: 0 });
        }
        Ok(())
    }

    pub fn handle_heartbeat_timeout(&mut self, core: &mut Core) -> Result<(), RaftError> {
        self.broadcast(core)?;
        self.heartbeat_timer.timeout_at(core.now + core.config.heartbeat_interval);
        Ok(())
    }

    /// Send every follower whatever it is missing (possibly nothing).
    pub fn broadcast(&mut self, core: &mut Core) -> Result<(), RaftError> {
        let peers: Vec<NodeId> = self.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(core, peer)?;
        }
        Ok(())
    }

    fn send_append(&mut self, core: &mut Core, peer: NodeId) -> Result<(), RaftError> {
        let Some(progress) = self.progress.get(&peer) else {
            return Ok(());
        };
        let next_index = progress.next_index;

        if next_index <= core.log.snapshot_index() {
            let Some(snapshot) = core.storage.load_snapshot()? else {
                error!(node = core.id, peer, "log is compacted but no snapshot is stored");
                return Ok(());
            };
            debug!(node = core.id, peer, index = snapshot.meta.last_included_index, "sending snapshot");
            core.send(
                peer,
                RaftMessage::InstallSnapshot {
                    term: core.term,
                    leader_id: core.id,
                    last_included_index: snapshot.meta.last_included_index,
                    last_included_term: snapshot.meta.last_included_term,
                    config: snapshot.meta.config,
                    applied_requests: snapshot.meta.applied_requests,
                    data: snapshot.data,
                },
            );
            return Ok(());
        }

        let prev_log_index = next_index - 1;
        let prev_log_term = core.log.term_at(prev_log_index).unwrap_or(0);
        let entries = core.log.entries_from(next_index, core.config.max_entries_per_append);
        core.send(
            peer,
            RaftMessage::AppendEntries {
                term: core.term,
                leader_id: core.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: core.commit_index,
            },
        );
        Ok(())
    }

    pub fn handle_append_response(
        &mut self,
        core: &mut Core,
        from: NodeId,
        success: bool,
        match_index: u64,
        conflict_hint: u64,
    ) -> Result<(), RaftError> {
        let last_index = core.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            debug!(node = core.id, from, "append response from non-member ignored");
            return Ok(());
        };

        if success {
            if match_index > last_index {
                warn!(node = core.id, from, match_index, last_index, "follower claims entries we never sent");
                return Ok(());
            }
            progress.match_index = progress.match_index.max(match_index);
            progress.next_index = progress.next_index.max(match_index + 1);
            let behind = progress.next_index <= last_index;
            self.advance_commit(core)?;
            if behind {
                self.send_append(core, from)?;
            }
        } else {
            if conflict_hint <= progress.match_index {
                debug!(node = core.id, from, conflict_hint, "stale rejection ignored");
                return Ok(());
            }
            let backed_off = conflict_hint.min(progress.next_index.saturating_sub(1));
            progress.next_index = backed_off.max(progress.match_index + 1);
            debug!(node = core.id, from, next_index = progress.next_index, "append rejected, backing off");
            self.send_append(core, from)?;
        }
        Ok(())
    }

    /// Commit the highest index held by a majority, if it belongs to our term.
    pub fn advance_commit(&mut self, core: &mut Core) -> Result<(), RaftError> {
        let mut matched: Vec<u64> = core
            .cluster
            .ids()
            .map(|id| {
                if id == core.id {
                    core.log.last_index()
                } else {
                    self.progress.get(&id).map_or(0, |p| p.match_index)
                }
            })
            .collect();
        if matched.is_empty() {
            return Ok(());
        }
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[core.cluster.quorum_size() - 1];
        if candidate > core.commit_index && core.log.term_at(candidate) == Some(core.term) {
            core.commit_through(candidate)?;
        }
        Ok(())
    }

    /// Append a client proposal and start replicating it.
    ///
    /// The outer error is a node fault; the inner one goes back to the client.
    pub fn propose(
        &mut self,
        core: &mut Core,
        request_id: RequestId,
        proposal: Proposal,
    ) -> Result<Result<LogPosition, ClientError>, RaftError> {
        if let Some(position) = core.log.position_of(request_id) {
            debug!(node = core.id, request = %request_id, index = position.index, "duplicate proposal");
            return Ok(Ok(position));
        }
        let payload = match proposal {
            Proposal::Command(data) => EntryPayload::Command { request_id, data },
            Proposal::ConfigChange(change) => {
                if core.config_change_pending() {
                    return Ok(Err(ClientError::ConfigChangeInProgress));
                }
                Self::log_config_change(core, &change);
                EntryPayload::ConfigChange { request_id, change }
            }
        };
        let position = core.append_new(payload)?;
        debug!(node = core.id, request = %request_id, index = position.index, "proposal appended");
        self.broadcast(core)?;
        self.advance_commit(core)?;
        Ok(Ok(position))
    }

    fn log_config_change(core: &Core, change: &ConfigChange) {
        match &change.address {
            Some(address) => info!(node = core.id, member = change.node, address = %address, "proposing member add/update"),
            None => info!(node = core.id, member = change.node, "proposing member removal"),
        }
    }
}
