//! # follower
//!
//! why: accept the leader's log, acknowledge it, and watch for the leader going quiet
//! relations: built by Role::setup, fed AppendEntries/InstallSnapshot by node.rs
//! what: FollowerRole, log consistency check with conflict hint, snapshot install

use tracing::{debug, warn};

use crate::error::RaftError;
use crate::log::{LogEntry, RaftLog};
use crate::message::RaftMessage;
use crate::role::{non_leader, RoleId};
use crate::shared::Core;
use crate::storage::{Snapshot, SnapshotMeta};
use crate::timer::{Timer, TimerKind};
use crate::NodeId;

pub(crate) struct FollowerRole {
    pub id: RoleId,
    pub election_timer: Timer,
}

impl FollowerRole {
    pub fn setup(core: &mut Core, id: RoleId, leader: Option<NodeId>) -> Self {
        core.leader_id = leader;
        let mut role = Self { id, election_timer: Timer::new(TimerKind::Election) };
        non_leader::restart_election_timer(core, &mut role.election_timer);
        role
    }

    /// The current leader spoke: remember it and push the election back.
    fn heard_from_leader(&mut self, core: &mut Core, leader: NodeId) {
        core.leader_id = Some(leader);
        non_leader::restart_election_timer(core, &mut self.election_timer);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_append_entries(
        &mut self,
        core: &mut Core,
        from: NodeId,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<(), RaftError> {
        self.heard_from_leader(core, leader_id);

        if prev_log_index > core.log.last_index() {
            let hint = core.log.last_index() + 1;
            debug!(node = core.id, prev_log_index, hint, "append rejected: log too short");
            reject(core, from, hint);
            return Ok(());
        }
        if prev_log_index >= core.log.snapshot_index()
            && core.log.term_at(prev_log_index) != Some(prev_log_term)
        {
            let hint = conflict_hint(&core.log, prev_log_index, core.commit_index);
            debug!(node = core.id, prev_log_index, prev_log_term, hint, "append rejected: term mismatch");
            reject(core, from, hint);
            return Ok(());
        }

        let match_index = prev_log_index + entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in entries {
            if entry.index <= core.log.snapshot_index() {
                continue;
            }
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match core.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    core.truncate_log_from(entry.index)?;
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        core.append_entries(fresh)?;

        core.commit_through(leader_commit.min(match_index))?;
        core.send(
            from,
            RaftMessage::AppendResponse {
                term: core.term,
                success: true,
                match_index,
                conflict_hint: 0,
            },
        );
        Ok(())
    }

    pub fn handle_install_snapshot(
        &mut self,
        core: &mut Core,
        from: NodeId,
        leader_id: NodeId,
        meta: SnapshotMeta,
        data: Vec<u8>,
    ) -> Result<(), RaftError> {
        self.heard_from_leader(core, leader_id);
        let index = meta.last_included_index;
        if index <= core.commit_index {
            warn!(node = core.id, index, commit = core.commit_index, "snapshot already covered by committed log");
        } else {
            core.install_snapshot(Snapshot { meta, data })?;
            // membership may have changed with the snapshot
            non_leader::restart_election_timer(core, &mut self.election_timer);
        }
        core.send(
            from,
            RaftMessage::AppendResponse {
                term: core.term,
                success: true,
                match_index: index,
                conflict_hint: 0,
            },
        );
        Ok(())
    }
}

fn reject(core: &mut Core, to: NodeId, conflict_hint: u64) {
    core.send(
        to,
        RaftMessage::AppendResponse {
            term: core.term,
            success: false,
            match_index: 0,
            conflict_hint,
        },
    );
}

/// First index of the conflicting term at `prev`, never at or below `commit`.
///
/// Lets the leader skip a whole divergent term instead of one entry per round trip.
fn conflict_hint(log: &RaftLog, prev: u64, commit: u64) -> u64 {
    let Some(term) = log.term_at(prev) else {
        return prev;
    };
    let floor = log.first_index().max(commit + 1);
    let mut index = prev;
    while index > floor && log.term_at(index - 1) == Some(term) {
        index -= 1;
    }
    index.max(1)
}
