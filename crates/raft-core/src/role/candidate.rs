//! # candidate
//!
//! why: campaign for leadership of a new term
//! relations: entered from follower/candidate on election timeout, leaves to leader or follower
//! what: CandidateRole, vote broadcast, vote tallying

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::RaftError;
use crate::message::RaftMessage;
use crate::role::{non_leader, RoleId, Transition};
use crate::shared::Core;
use crate::timer::{Timer, TimerKind};
use crate::NodeId;

pub(crate) struct CandidateRole {
    pub id: RoleId,
    pub election_timer: Timer,
    pub votes: BTreeSet<NodeId>,
}

impl CandidateRole {
    /// Bump the term, vote for ourselves and ask every other member for a vote.
    pub fn setup(core: &mut Core, id: RoleId) -> Result<(Self, Option<Transition>), RaftError> {
        core.start_term_as_candidate()?;
        let mut role = Self {
            id,
            election_timer: Timer::new(TimerKind::Election),
            votes: BTreeSet::from([core.id]),
        };
        non_leader::restart_election_timer(core, &mut role.election_timer);
        info!(node = core.id, term = core.term, "campaigning for leadership");

        let request = RaftMessage::RequestVote {
            term: core.term,
            candidate_id: core.id,
            last_log_index: core.log.last_index(),
            last_log_term: core.log.last_term(),
        };
        let peers: Vec<NodeId> = core.cluster.peers(core.id).collect();
        for peer in peers {
            core.send(peer, request.clone());
        }

        let next = role.has_quorum(core).then_some(Transition::Leader);
        Ok((role, next))
    }

    pub fn has_quorum(&self, core: &Core) -> bool {
        core.cluster.is_quorum(&self.votes)
    }

    pub fn handle_vote_response(
        &mut self,
        core: &Core,
        from: NodeId,
        granted: bool,
    ) -> Option<Transition> {
        debug!(node = core.id, term = core.term, voter = from, granted, "vote received");
        if !granted {
            return None;
        }
        self.votes.insert(from);
        if self.has_quorum(core) {
            info!(node = core.id, term = core.term, votes = self.votes.len(), "won election");
            return Some(Transition::Leader);
        }
        None
    }
}
