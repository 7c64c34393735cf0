//! # raft-storage
//!
//! why: provide durable persistence for raft state and the replicated key-value engine
//! relations: implements raft-core's Storage and StateMachine traits
//! what: FileStorage, InMemoryStorage for testing, KvStateMachine

mod file;
mod kv;
mod memory;

pub use file::FileStorage;
pub use kv::{KvCommand, KvError, KvOp, KvResult, KvStateMachine};
pub use memory::InMemoryStorage;
pub use raft_core::{Snapshot, SnapshotMeta, StateMachine, Storage};
