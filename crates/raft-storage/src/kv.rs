//! # kv
//!
//! why: the replicated data the cluster actually agrees on
//! relations: implements raft-core's StateMachine, driven by the node's apply loop
//! what: ordered byte-keyed map with atomic batch commands and snapshot/restore

use std::collections::BTreeMap;

use raft_core::{ApplyError, StateMachine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum KvError {
    #[error("malformed kv payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One operation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Get { key: Vec<u8> },
    /// Abort the whole batch unless `key` currently holds `value`
    /// (`None` means the key must be absent).
    Expect { key: Vec<u8>, value: Option<Vec<u8>> },
}

/// A batch of operations applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub ops: Vec<KvOp>,
}

impl KvCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(KvOp::Put { key: key.into(), value: value.into() });
        self
    }

    pub fn delete(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.ops.push(KvOp::Delete { key: key.into() });
        self
    }

    pub fn get(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.ops.push(KvOp::Get { key: key.into() });
        self
    }

    pub fn expect(mut self, key: impl Into<Vec<u8>>, value: Option<Vec<u8>>) -> Self {
        self.ops.push(KvOp::Expect { key: key.into(), value });
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, KvError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Values read by the `Get` ops of a batch, in op order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvResult {
    pub reads: Vec<Option<Vec<u8>>>,
}

impl KvResult {
    pub fn decode(bytes: &[u8]) -> Result<Self, KvError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Snapshot image; JSON maps need string keys, so pairs are stored as a list.
#[derive(Serialize, Deserialize)]
struct Image {
    applied_index: u64,
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    applied_index: u64,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    /// Keys in `[start, end)` in order.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        let end = end.max(start);
        self.data
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Run a batch against a staged overlay; nothing touches `data` unless
    /// every `Expect` holds.
    fn execute(&mut self, command: KvCommand) -> Result<KvResult, ApplyError> {
        let mut staged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        let mut result = KvResult::default();

        for op in command.ops {
            match op {
                KvOp::Put { key, value } => {
                    staged.insert(key, Some(value));
                }
                KvOp::Delete { key } => {
                    staged.insert(key, None);
                }
                KvOp::Get { key } => {
                    result.reads.push(self.read_staged(&staged, &key));
                }
                KvOp::Expect { key, value } => {
                    let current = self.read_staged(&staged, &key);
                    if current != value {
                        return Err(ApplyError(format!(
                            "expectation failed for key {}",
                            String::from_utf8_lossy(&key)
                        )));
                    }
                }
            }
        }

        for (key, value) in staged {
            match value {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(result)
    }

    fn read_staged(&self, staged: &BTreeMap<Vec<u8>, Option<Vec<u8>>>, key: &[u8]) -> Option<Vec<u8>> {
        match staged.get(key) {
            Some(value) => value.clone(),
            None => self.data.get(key).cloned(),
        }
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, index: u64, command: &[u8]) -> Result<Vec<u8>, ApplyError> {
        // the index is consumed even when the command is rejected
        self.applied_index = index;

        let command = KvCommand::decode(command).map_err(|e| ApplyError(e.to_string()))?;
        let ops = command.ops.len();
        match self.execute(command) {
            Ok(result) => {
                debug!(index, ops, keys = self.data.len(), "kv batch applied");
                serde_json::to_vec(&result).map_err(|e| ApplyError(e.to_string()))
            }
            Err(err) => {
                warn!(index, error = %err.0, "kv batch rejected");
                Err(err)
            }
        }
    }

    fn applied_index(&self) -> u64 {
        self.applied_index
    }

    fn snapshot(&self) -> Vec<u8> {
        let image = Image {
            applied_index: self.applied_index,
            pairs: self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        // byte vectors and integers always serialize
        serde_json::to_vec(&image).unwrap_or_default()
    }

    fn restore(&mut self, index: u64, data: &[u8]) -> Result<(), ApplyError> {
        let image: Image = serde_json::from_slice(data).map_err(|e| ApplyError(e.to_string()))?;
        self.data = image.pairs.into_iter().collect();
        self.applied_index = index;
        debug!(index, keys = self.data.len(), "kv state restored from snapshot");
        Ok(())
    }
}
