//! # network
//!
//! why: move envelopes between node tasks; raft tolerates loss, so sending never fails loudly
//! relations: Transport is called by the node loop in actor.rs after every step
//! what: Transport trait, LocalNetwork in-process router with link cutting

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use raft_core::{Envelope, NodeId, RaftNode};
use tracing::{debug, warn};

use crate::actor::{spawn_node, NodeHandle};

/// Carries envelopes to their destination node.
///
/// Delivery is best effort: a lost message is retried by the protocol.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, envelope: Envelope);
}

#[derive(Default)]
struct Routes {
    nodes: BTreeMap<NodeId, NodeHandle>,
    /// Directed links whose traffic is dropped
    cut: BTreeSet<(NodeId, NodeId)>,
}

/// Routes json-encoded envelopes between nodes of one process.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `node` on its own task and make it reachable.
    pub fn spawn(&self, node: RaftNode) -> NodeHandle {
        let handle = spawn_node(node, Arc::new(self.clone()));
        self.lock().nodes.insert(handle.id(), handle.clone());
        handle
    }

    pub fn handle(&self, id: NodeId) -> Option<NodeHandle> {
        self.lock().nodes.get(&id).cloned()
    }

    /// Stop a node and forget its route.
    pub fn remove(&self, id: NodeId) {
        if let Some(handle) = self.lock().nodes.remove(&id) {
            handle.shutdown();
        }
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        let mut routes = self.lock();
        let others: Vec<NodeId> = routes.nodes.keys().copied().filter(|n| *n != id).collect();
        for other in others {
            routes.cut.insert((id, other));
            routes.cut.insert((other, id));
        }
    }

    pub fn heal(&self) {
        self.lock().cut.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for LocalNetwork {
    fn send(&self, envelope: Envelope) {
        let (from, to) = (envelope.from, envelope.to);
        let target = {
            let routes = self.lock();
            if routes.cut.contains(&(from, to)) {
                debug!(from, to, kind = envelope.message.kind(), "link cut, message dropped");
                return;
            }
            routes.nodes.get(&to).cloned()
        };
        let Some(target) = target else {
            debug!(from, to, "no route to node");
            return;
        };
        match envelope.encode() {
            Ok(bytes) => {
                if target.deliver(bytes).is_err() {
                    debug!(from, to, "destination node stopped");
                }
            }
            Err(err) => warn!(from, to, error = %err, "failed to encode message"),
        }
    }
}
