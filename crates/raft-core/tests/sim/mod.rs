//! # sim
//!
//! why: drive whole clusters deterministically, without threads or sockets
//! relations: used by comprehensive_tests.rs
//! what: RecordingMachine, Sim (manual clock, droppable links, safety checks)

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use raft_core::{
    ApplyError, ClusterConfig, Envelope, NodeId, NodeState, RaftConfig, RaftNode, StateMachine,
    Storage, TransactionFuture, TransactionResult,
};
pub use raft_storage::InMemoryStorage;

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Every (index, command) any incarnation of a node ever applied.
pub type ApplyRecord = Arc<Mutex<BTreeMap<u64, Vec<u8>>>>;

/// Keeps applied commands in order; `b"reject"` is refused.
pub struct RecordingMachine {
    entries: BTreeMap<u64, Vec<u8>>,
    applied_index: u64,
    record: ApplyRecord,
}

impl RecordingMachine {
    pub fn new(record: ApplyRecord) -> Self {
        Self { entries: BTreeMap::new(), applied_index: 0, record }
    }
}

impl StateMachine for RecordingMachine {
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<Vec<u8>, ApplyError> {
        assert!(index > self.applied_index, "apply out of order: {index} after {}", self.applied_index);
        self.applied_index = index;
        if command == b"reject" {
            return Err(ApplyError("rejected".into()));
        }
        self.entries.insert(index, command.to_vec());
        let previous = self.record.lock().unwrap().insert(index, command.to_vec());
        if let Some(previous) = previous {
            assert_eq!(previous, command, "index {index} applied with two different commands");
        }
        Ok([b"applied:".as_slice(), command].concat())
    }

    fn applied_index(&self) -> u64 {
        self.applied_index
    }

    fn snapshot(&self) -> Vec<u8> {
        let pairs: Vec<(u64, Vec<u8>)> = self.entries.iter().map(|(k, v)| (*k, v.clone())).collect();
        serde_json::to_vec(&pairs).unwrap()
    }

    fn restore(&mut self, index: u64, data: &[u8]) -> Result<(), ApplyError> {
        let pairs: Vec<(u64, Vec<u8>)> =
            serde_json::from_slice(data).map_err(|e| ApplyError(e.to_string()))?;
        self.entries = pairs.into_iter().collect();
        self.applied_index = index;
        Ok(())
    }
}

// =============================================================================
// CLUSTER SIMULATOR
// =============================================================================

pub fn test_config(seed: u64) -> RaftConfig {
    RaftConfig { rng_seed: Some(seed), ..RaftConfig::default() }
}

pub fn address(id: NodeId) -> String {
    format!("node-{id}")
}

pub fn members(ids: &[NodeId]) -> ClusterConfig {
    ClusterConfig::from_members(ids.iter().map(|id| (*id, address(*id))))
}

/// Fresh storage that already holds `config` as the committed membership.
pub fn configured_storage(config: &ClusterConfig) -> InMemoryStorage {
    let mut storage = InMemoryStorage::new();
    storage.save_config(0, config).unwrap();
    storage
}

/// Outcome of a transaction if it has resolved.
pub fn outcome(rx: &mut TransactionFuture) -> Option<TransactionResult> {
    rx.try_recv().ok()
}

pub struct Sim {
    pub now: u64,
    nodes: BTreeMap<NodeId, RaftNode>,
    storages: BTreeMap<NodeId, InMemoryStorage>,
    records: BTreeMap<NodeId, ApplyRecord>,
    configs: BTreeMap<NodeId, RaftConfig>,
    /// Directed links whose messages are dropped
    cut: BTreeSet<(NodeId, NodeId)>,
    crashed: BTreeSet<NodeId>,
    network: VecDeque<Envelope>,
    leaders_by_term: BTreeMap<u64, NodeId>,
    leader_tail: BTreeMap<(NodeId, u64), u64>,
    /// (index -> term) of every entry any node reported committed
    committed: BTreeMap<u64, u64>,
}

impl Sim {
    /// A cluster whose members all start with the same persisted membership.
    pub fn new(ids: &[NodeId]) -> Self {
        Self::with_config(ids, test_config)
    }

    pub fn with_config(ids: &[NodeId], config: impl Fn(u64) -> RaftConfig) -> Self {
        let mut sim = Self::empty();
        let cluster = members(ids);
        for id in ids {
            sim.add_node(*id, configured_storage(&cluster), config(*id));
        }
        sim
    }

    pub fn empty() -> Self {
        Self {
            now: 0,
            nodes: BTreeMap::new(),
            storages: BTreeMap::new(),
            records: BTreeMap::new(),
            configs: BTreeMap::new(),
            cut: BTreeSet::new(),
            crashed: BTreeSet::new(),
            network: VecDeque::new(),
            leaders_by_term: BTreeMap::new(),
            leader_tail: BTreeMap::new(),
            committed: BTreeMap::new(),
        }
    }

    /// Start a node on the given storage.
    pub fn add_node(&mut self, id: NodeId, storage: InMemoryStorage, config: RaftConfig) {
        let record = self.records.entry(id).or_default().clone();
        let node = RaftNode::recover(
            id,
            config.clone(),
            Box::new(storage.clone()),
            Box::new(RecordingMachine::new(record)),
            self.now,
        )
        .unwrap();
        self.nodes.insert(id, node);
        self.storages.insert(id, storage);
        self.configs.insert(id, config);
    }

    pub fn node(&self, id: NodeId) -> &RaftNode {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut RaftNode {
        self.nodes.get_mut(&id).unwrap()
    }

    pub fn storage(&self, id: NodeId) -> &InMemoryStorage {
        &self.storages[&id]
    }

    pub fn applied(&self, id: NodeId) -> BTreeMap<u64, Vec<u8>> {
        self.records[&id].lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    // -------------------------------------------------------------------------
    // faults
    // -------------------------------------------------------------------------

    pub fn cut_link(&mut self, from: NodeId, to: NodeId) {
        self.cut.insert((from, to));
    }

    /// Drop everything `id` sends.
    pub fn mute(&mut self, id: NodeId) {
        for other in self.ids() {
            if other != id {
                self.cut.insert((id, other));
            }
        }
    }

    /// Drop everything to and from `id`.
    pub fn isolate(&mut self, id: NodeId) {
        for other in self.ids() {
            if other != id {
                self.cut.insert((id, other));
                self.cut.insert((other, id));
            }
        }
    }

    pub fn heal(&mut self) {
        self.cut.clear();
    }

    pub fn crash(&mut self, id: NodeId) {
        self.nodes.remove(&id);
        self.crashed.insert(id);
        self.network.retain(|e| e.to != id && e.from != id);
    }

    /// Recover a crashed node from its storage with a fresh state machine.
    pub fn restart(&mut self, id: NodeId) {
        assert!(self.crashed.remove(&id), "node {id} is not crashed");
        let storage = self.storages[&id].clone();
        let config = self.configs[&id].clone();
        self.add_node(id, storage, config);
    }

    // -------------------------------------------------------------------------
    // driving
    // -------------------------------------------------------------------------

    /// Deliver messages until the network is quiet.
    pub fn deliver(&mut self) {
        for _ in 0..100_000 {
            self.collect();
            let Some(envelope) = self.network.pop_front() else {
                self.check();
                return;
            };
            if self.cut.contains(&(envelope.from, envelope.to)) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&envelope.to) {
                node.handle_message(envelope);
            }
            self.check();
        }
        panic!("network never went quiet");
    }

    /// Advance the clock one millisecond at a time.
    pub fn advance(&mut self, ms: u64) {
        for _ in 0..ms {
            self.now += 1;
            let now = self.now;
            for node in self.nodes.values_mut() {
                node.tick(now);
            }
            self.deliver();
        }
    }

    /// Advance until `done` holds; false if `limit` ms pass first.
    pub fn run_until(&mut self, limit: u64, mut done: impl FnMut(&Sim) -> bool) -> bool {
        for _ in 0..limit {
            if done(self) {
                return true;
            }
            self.advance(1);
        }
        done(self)
    }

    /// Make `id` win an election right now.
    pub fn elect(&mut self, id: NodeId) {
        let role = self.node(id).status().role_id;
        self.node_mut(id).force_election(role).unwrap();
        self.deliver();
        assert_eq!(self.node(id).state(), NodeState::Leader, "node {id} failed to win");
    }

    /// Let the leader's next heartbeat spread the commit index.
    pub fn heartbeat(&mut self) {
        let interval = self.configs.values().map(|c| c.heartbeat_interval).max().unwrap_or(50);
        self.advance(interval + 1);
    }

    pub fn submit(&mut self, id: NodeId, command: &[u8]) -> TransactionFuture {
        let rx = self.node_mut(id).submit(command.to_vec());
        self.deliver();
        rx
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.state() == NodeState::Leader)
            .max_by_key(|n| n.term())
            .map(|n| n.id())
    }

    fn collect(&mut self) {
        for node in self.nodes.values_mut() {
            self.network.extend(node.take_messages());
        }
    }

    // -------------------------------------------------------------------------
    // safety
    // -------------------------------------------------------------------------

    /// Checks cheap enough to run after every delivery.
    fn check(&mut self) {
        for node in self.nodes.values() {
            let (id, term) = (node.id(), node.term());
            if node.state() == NodeState::Leader {
                let first = *self.leaders_by_term.entry(term).or_insert(id);
                assert_eq!(first, id, "two leaders in term {term}");

                let last = node.log().last_index();
                let tail = self.leader_tail.entry((id, term)).or_insert(last);
                assert!(last >= *tail, "leader {id} shrank its log in term {term}");
                *tail = last;

                for (index, committed_term) in &self.committed {
                    if *index > node.log().snapshot_index() {
                        assert_eq!(
                            node.log().term_at(*index),
                            Some(*committed_term),
                            "leader {id} of term {term} lacks committed entry {index}"
                        );
                    }
                }
            }

            let log = node.log();
            let from = log.first_index().max(self.committed.keys().next_back().map_or(1, |i| i + 1));
            for index in from..=node.commit_index() {
                if let Some(term) = log.term_at(index) {
                    self.committed.entry(index).or_insert(term);
                }
            }
        }
    }

    /// Same (index, term) on two nodes implies identical retained prefixes.
    pub fn assert_log_matching(&self) {
        let nodes: Vec<&RaftNode> = self.nodes.values().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let (la, lb) = (a.log(), b.log());
                let last = la.last_index().min(lb.last_index());
                let first = la.first_index().max(lb.first_index());
                let Some(top) = (first..=last).rev().find(|idx| {
                    la.term_at(*idx).is_some() && la.term_at(*idx) == lb.term_at(*idx)
                }) else {
                    continue;
                };
                for index in first..=top {
                    assert_eq!(la.get(index), lb.get(index), "logs of {} and {} diverge at {index}", a.id(), b.id());
                }
            }
        }
    }

    /// No index was ever applied with two different commands on two nodes.
    pub fn assert_state_machine_safety(&self) {
        let mut seen: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
        for record in self.records.values() {
            for (index, command) in record.lock().unwrap().iter() {
                let first = seen.entry(*index).or_insert_with(|| command.clone());
                assert_eq!(first, command, "index {index} applied with different commands");
            }
        }
    }
}
