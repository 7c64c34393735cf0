//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs and the roles, carried by any transport
//! what: RaftMessage variants, Envelope addressing, json encode/decode helpers

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterConfig, ConfigChange};
use crate::error::ClientError;
use crate::log::{LogEntry, LogPosition, RequestId};
use crate::NodeId;

/// What a client asks the leader to append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Proposal {
    Command(Vec<u8>),
    ConfigChange(ConfigChange),
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Response to a vote request
    RequestVoteResponse {
        term: u64,
        granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Response to AppendEntries and InstallSnapshot
    ///
    /// On success `match_index` is the last index known to match the leader.
    /// On failure `conflict_hint` is the next index the follower can accept from.
    AppendResponse {
        term: u64,
        success: bool,
        match_index: u64,
        conflict_hint: u64,
    },
    /// Client proposal forwarded to the leader
    CommitRequest {
        request_id: RequestId,
        proposal: Proposal,
    },
    /// Leader's answer to a CommitRequest: where the entry was appended
    CommitResponse {
        request_id: RequestId,
        result: Result<LogPosition, ClientError>,
    },
    /// Full state machine image for a follower behind the retained log
    InstallSnapshot {
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        config: ClusterConfig,
        #[serde(default)]
        applied_requests: BTreeMap<NodeId, u64>,
        data: Vec<u8>,
    },
}

impl RaftMessage {
    /// Term carried by the message; client traffic is term-less.
    pub fn term(&self) -> Option<u64> {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. } => Some(*term),
            RaftMessage::CommitRequest { .. } | RaftMessage::CommitResponse { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::RequestVoteResponse { .. } => "RequestVoteResponse",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendResponse { .. } => "AppendResponse",
            RaftMessage::CommitRequest { .. } => "CommitRequest",
            RaftMessage::CommitResponse { .. } => "CommitResponse",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
        }
    }
}

/// A message addressed from one node to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

impl Envelope {
    pub fn new(from: NodeId, to: NodeId, message: RaftMessage) -> Self {
        Self { from, to, message }
    }

    /// Serialize for a transport; any framing is the transport's business.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
