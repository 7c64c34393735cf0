//! in-memory storage for testing
//!
//! stores all state in memory, no persistence across restarts
//! unless the same instance is handed to the restarted node

use std::io;
use std::sync::{Arc, Mutex};

use raft_core::{ClusterConfig, LogEntry, NodeId, Snapshot, Storage};

#[derive(Default)]
struct State {
    term: u64,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    config: Option<(u64, ClusterConfig)>,
    snapshot: Option<Snapshot>,
    fail_writes: bool,
}

/// In-memory storage.
///
/// Clones share the same state, so a test can keep a handle, "crash" the
/// node and recover a new one from the same storage, or make writes fail.
#[derive(Default, Clone)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a dying disk would.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // a panicked test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> io::Result<std::sync::MutexGuard<'_, State>> {
        let state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        Ok(state)
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        let mut state = self.write()?;
        state.term = term;
        state.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<NodeId>)> {
        let state = self.lock();
        Ok((state.term, state.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.write()?.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.lock().log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.write()?.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn purge_log_through(&mut self, index: u64) -> io::Result<()> {
        self.write()?.log.retain(|e| e.index > index);
        Ok(())
    }

    fn save_config(&mut self, index: u64, config: &ClusterConfig) -> io::Result<()> {
        self.write()?.config = Some((index, config.clone()));
        Ok(())
    }

    fn load_config(&self) -> io::Result<Option<(u64, ClusterConfig)>> {
        Ok(self.lock().config.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.write()?.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> io::Result<Option<Snapshot>> {
        Ok(self.lock().snapshot.clone())
    }
}
