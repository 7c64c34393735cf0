//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-runtime in real time, persisted through raft-storage
//! what: role state machine, election timers, log replication, transaction pipeline

pub mod cluster;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod pending;
mod role;
mod shared;
pub mod storage;
pub mod timer;

/// Identity of a node within a cluster
pub type NodeId = u64;

pub use cluster::{ClusterConfig, ConfigChange};
pub use config::{ConfigError, RaftConfig};
pub use error::{AdminError, ApplyError, ClientError, RaftError};
pub use log::{EntryPayload, LogEntry, LogPosition, RaftLog, RequestId};
pub use message::{Envelope, Proposal, RaftMessage};
pub use node::{NodeStatus, RaftNode};
pub use pending::{TransactionFuture, TransactionResult};
pub use role::{NodeState, RoleId};
pub use storage::{Snapshot, SnapshotMeta, StateMachine, Storage};
