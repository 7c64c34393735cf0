//! # cluster
//!
//! why: track which nodes vote and where they live
//! relations: mutated by node.rs only when a ConfigChange entry is applied
//! what: ClusterConfig membership map, ConfigChange, quorum arithmetic

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Add or update a member (`address = Some`), or remove it (`address = None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub node: NodeId,
    pub address: Option<String>,
}

impl ConfigChange {
    pub fn add(node: NodeId, address: impl Into<String>) -> Self {
        Self { node, address: Some(address.into()) }
    }

    pub fn remove(node: NodeId) -> Self {
        Self { node, address: None }
    }
}

/// The committed cluster membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, String>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: impl IntoIterator<Item = (NodeId, String)>) -> Self {
        Self { members: members.into_iter().collect() }
    }

    pub fn apply(&mut self, change: &ConfigChange) {
        match &change.address {
            Some(address) => {
                self.members.insert(change.node, address.clone());
            }
            None => {
                self.members.remove(&change.node);
            }
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    pub fn address(&self, node: NodeId) -> Option<&str> {
        self.members.get(&node).map(String::as_str)
    }

    pub fn members(&self) -> &BTreeMap<NodeId, String> {
        &self.members
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    /// Every member except `me`.
    pub fn peers(&self, me: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.ids().filter(move |id| *id != me)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Smallest number of members that forms a majority.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Whether `voters` holds a majority of the members.
    pub fn is_quorum<'a>(&self, voters: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let count = voters.into_iter().filter(|id| self.contains(**id)).count();
        count >= self.quorum_size()
    }
}
