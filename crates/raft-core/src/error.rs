//! # error
//!
//! why: name every way a raft operation can fail and who gets to see it
//! relations: RaftError stays inside the node, ClientError reaches submitters
//! what: RaftError, ClientError, AdminError, ApplyError

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::NodeId;

/// Internal faults raised while executing a task.
///
/// Everything except `Persistence` is self-healing: the offending message is
/// logged and dropped and the protocol retries on its own.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("stale term {received} (current term {current})")]
    StaleTerm { received: u64, current: u64 },

    #[error("log mismatch at index {index}")]
    LogMismatch { index: u64 },

    #[error("unexpected {message} while {role}")]
    UnexpectedMessage {
        message: &'static str,
        role: &'static str,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] io::Error),

    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Outcome of a failed client transaction.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientError {
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("no leader known")]
    NoLeader,

    #[error("transaction entry at index {index} was overwritten before commit")]
    Abandoned { index: u64 },

    #[error("leadership lost before the transaction committed")]
    LeadershipLost,

    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,

    /// The entry may still commit after the caller gave up on it.
    #[error("transaction timed out, outcome unknown")]
    Timeout,

    /// The entry's slot was replaced by a snapshot before its result was seen here.
    #[error("transaction at index {index} was covered by a snapshot, outcome unknown")]
    OutcomeUnknown { index: u64 },

    #[error("node is offline")]
    Offline,

    #[error("state machine rejected the command: {0}")]
    Apply(String),
}

impl ClientError {
    /// Whether the caller may safely resubmit the same command.
    ///
    /// True only when the command is known not to have been applied.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NotLeader { .. }
                | ClientError::NoLeader
                | ClientError::Abandoned { .. }
                | ClientError::LeadershipLost
                | ClientError::ConfigChangeInProgress
        )
    }
}

/// Failures of the administrative surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("role is no longer active")]
    RoleChanged,

    #[error("election timer is not running")]
    TimerNotRunning,

    #[error("node is already part of a cluster")]
    AlreadyConfigured,

    #[error("node is offline")]
    Offline,
}

/// A command the state machine refused to apply.
///
/// The entry is still committed; the error is reported to the submitter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ApplyError(pub String);

impl From<ApplyError> for ClientError {
    fn from(err: ApplyError) -> Self {
        ClientError::Apply(err.0)
    }
}
