//! # role
//!
//! why: one explicit variant per raft role, so every transition goes through a single place
//! relations: node.rs owns the active Role and switches on it; handlers borrow Core mutably
//! what: NodeState, RoleId, Role, Transition, vote request handling shared by all roles

mod candidate;
mod follower;
mod leader;
pub(crate) mod non_leader;

pub(crate) use candidate::CandidateRole;
pub(crate) use follower::FollowerRole;
pub(crate) use leader::LeaderRole;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RaftError;
use crate::message::RaftMessage;
use crate::shared::Core;
use crate::timer::Timer;
use crate::NodeId;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Generation of a role instance. Timer tasks carry the id of the role that
/// armed them and are dropped when it no longer matches the active role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleId(pub u64);

/// Where the node goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Follower { leader: Option<NodeId> },
    Candidate,
    Leader,
}

pub(crate) enum Role {
    Follower(FollowerRole),
    Candidate(CandidateRole),
    Leader(LeaderRole),
}

impl Role {
    /// Build the role a transition asks for and run its setup.
    ///
    /// Setup may immediately ask for a further transition (a lone candidate
    /// wins its own election).
    pub fn setup(
        core: &mut Core,
        id: RoleId,
        transition: Transition,
    ) -> Result<(Role, Option<Transition>), RaftError> {
        match transition {
            Transition::Follower { leader } => {
                let role = FollowerRole::setup(core, id, leader);
                Ok((Role::Follower(role), None))
            }
            Transition::Candidate => {
                let (role, next) = CandidateRole::setup(core, id)?;
                Ok((Role::Candidate(role), next))
            }
            Transition::Leader => {
                let role = LeaderRole::setup(core, id)?;
                Ok((Role::Leader(role), None))
            }
        }
    }

    /// Release role-scoped resources.
    pub fn shutdown(&mut self) {
        self.timer_mut().cancel();
    }

    pub fn id(&self) -> RoleId {
        match self {
            Role::Follower(r) => r.id,
            Role::Candidate(r) => r.id,
            Role::Leader(r) => r.id,
        }
    }

    pub fn state(&self) -> NodeState {
        match self {
            Role::Follower(_) => NodeState::Follower,
            Role::Candidate(_) => NodeState::Candidate,
            Role::Leader(_) => NodeState::Leader,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }

    /// The single timer each role owns
    pub fn timer_mut(&mut self) -> &mut Timer {
        match self {
            Role::Follower(r) => &mut r.election_timer,
            Role::Candidate(r) => &mut r.election_timer,
            Role::Leader(r) => &mut r.heartbeat_timer,
        }
    }

    pub fn timer(&self) -> &Timer {
        match self {
            Role::Follower(r) => &r.election_timer,
            Role::Candidate(r) => &r.election_timer,
            Role::Leader(r) => &r.heartbeat_timer,
        }
    }

    /// The election timer of a non-leader role
    pub fn election_timer_mut(&mut self) -> Option<&mut Timer> {
        match self {
            Role::Follower(r) => Some(&mut r.election_timer),
            Role::Candidate(r) => Some(&mut r.election_timer),
            Role::Leader(_) => None,
        }
    }

    pub fn election_timer(&self) -> Option<&Timer> {
        match self {
            Role::Follower(r) => Some(&r.election_timer),
            Role::Candidate(r) => Some(&r.election_timer),
            Role::Leader(_) => None,
        }
    }

    /// Grant or refuse a vote. The message term already equals ours.
    pub fn handle_request_vote(
        &mut self,
        core: &mut Core,
        from: NodeId,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<(), RaftError> {
        let free = core.voted_for.map_or(true, |v| v == candidate_id);
        let up_to_date = core.log.is_up_to_date(last_log_index, last_log_term);
        let granted = free && up_to_date && !matches!(self, Role::Leader(_));
        if granted {
            if core.voted_for != Some(candidate_id) {
                core.vote_for(candidate_id)?;
            }
            if let Some(timer) = self.election_timer_mut() {
                non_leader::restart_election_timer(core, timer);
            }
        }
        debug!(
            node = core.id,
            term = core.term,
            candidate = candidate_id,
            granted,
            up_to_date,
            "vote requested"
        );
        core.send(from, RaftMessage::RequestVoteResponse { term: core.term, granted });
        Ok(())
    }
}
