//! # non_leader
//!
//! why: followers and candidates share the election timer and refuse leader-only traffic
//! relations: used by follower.rs, candidate.rs and the vote handler in mod.rs
//! what: randomized election timer arming, election timeout, leader-only message rejection

use tracing::{debug, info};

use crate::error::{ClientError, RaftError};
use crate::message::RaftMessage;
use crate::role::Transition;
use crate::shared::Core;
use crate::timer::Timer;
use crate::NodeId;

/// Arm a fresh randomized deadline, or idle the timer for unconfigured nodes.
pub(crate) fn restart_election_timer(core: &mut Core, timer: &mut Timer) {
    if core.is_member() {
        let deadline = core.random_election_deadline();
        timer.timeout_at(deadline);
    } else {
        timer.cancel();
    }
}

/// The election timer fired while following or campaigning.
pub(crate) fn handle_election_timeout(core: &Core, role: &'static str) -> Option<Transition> {
    if !core.is_member() {
        debug!(node = core.id, "election timeout ignored: not a cluster member");
        return None;
    }
    info!(node = core.id, term = core.term, role, "election timeout, starting election");
    Some(Transition::Candidate)
}

/// AppendResponse and CommitRequest are only meaningful to a leader.
pub(crate) fn reject_leader_only(
    core: &mut Core,
    role: &'static str,
    from: NodeId,
    message: &RaftMessage,
) -> RaftError {
    if let RaftMessage::CommitRequest { request_id, .. } = message {
        let result = Err(ClientError::NotLeader { leader: core.leader_id });
        core.send(from, RaftMessage::CommitResponse { request_id: *request_id, result });
    }
    RaftError::UnexpectedMessage { message: message.kind(), role }
}
