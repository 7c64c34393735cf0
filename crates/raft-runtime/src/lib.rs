//! # raft-runtime
//!
//! why: run a raft node in real time on tokio, outside of the deterministic tests
//! relations: owns a raft-core RaftNode per task, moves its messages over a Transport
//! what: spawn_node actor, NodeHandle client api, Transport trait, in-process LocalNetwork

mod actor;
mod network;

use raft_core::{AdminError, ClientError};
use thiserror::Error;

pub use actor::{spawn_node, NodeHandle};
pub use network::{LocalNetwork, Transport};

/// Why a call through a [`NodeHandle`] failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Admin(#[from] AdminError),

    /// The node task has exited; nothing will answer anymore.
    #[error("node task stopped")]
    Stopped,
}

impl RuntimeError {
    /// Whether resubmitting the same command is safe.
    ///
    /// A stopped node or a timed-out transaction may have applied the command already.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Client(err) => err.is_retryable(),
            RuntimeError::Admin(_) | RuntimeError::Stopped => false,
        }
    }
}
