//! # pending
//!
//! why: tie a submitted command to the log entry that carries it and to the caller waiting on it
//! relations: owned by node.rs, survives role transitions, resolved by the apply step
//! what: PendingTransactions keyed by RequestId, TransactionFuture

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::ClientError;
use crate::log::{LogPosition, RequestId};
use crate::NodeId;

/// Outcome delivered to a submitter: the state machine's result bytes.
pub type TransactionResult = Result<Vec<u8>, ClientError>;

/// Resolves once the transaction is applied or known to have failed.
pub type TransactionFuture = oneshot::Receiver<TransactionResult>;

#[derive(Debug)]
struct PendingTx {
    reply: oneshot::Sender<TransactionResult>,
    /// Where the entry was appended, once known
    position: Option<LogPosition>,
    /// Appended by this node while it was leader
    leader_local: bool,
    deadline: u64,
}

/// Transactions submitted on this node that have not been resolved yet.
#[derive(Debug, Default)]
pub struct PendingTransactions {
    pending: BTreeMap<RequestId, PendingTx>,
    next_seq: u64,
}

impl PendingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number request ids from `seq` onward.
    pub fn starting_at(seq: u64) -> Self {
        Self { pending: BTreeMap::new(), next_seq: seq }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    /// Register a new transaction and hand back its id and future.
    pub fn register(&mut self, node: NodeId, deadline: u64) -> (RequestId, TransactionFuture) {
        self.next_seq += 1;
        let id = RequestId { node, seq: self.next_seq };
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingTx { reply: tx, position: None, leader_local: false, deadline },
        );
        (id, rx)
    }

    /// Record where the transaction's entry landed.
    pub fn set_position(&mut self, id: &RequestId, position: LogPosition, leader_local: bool) {
        if let Some(tx) = self.pending.get_mut(id) {
            tx.position = Some(position);
            tx.leader_local = leader_local;
        }
    }

    /// Complete a transaction; unknown ids are ignored (already resolved).
    pub fn resolve(&mut self, id: &RequestId, result: TransactionResult) {
        if let Some(tx) = self.pending.remove(id) {
            debug!(request = %id, ok = result.is_ok(), "transaction resolved");
            // the caller may have dropped its future
            let _ = tx.reply.send(result);
        }
    }

    /// The entry at `index` was applied carrying `request_id`.
    ///
    /// Any other transaction expecting that index lost its slot.
    pub fn on_applied(
        &mut self,
        index: u64,
        request_id: Option<RequestId>,
        result: TransactionResult,
    ) {
        if let Some(id) = request_id {
            self.resolve(&id, result);
        }
        self.fail_where(
            |tx| tx.position.is_some_and(|p| p.index == index),
            ClientError::Abandoned { index },
        );
    }

    /// Entries from `index` onward were discarded.
    pub fn on_truncated(&mut self, index: u64) {
        let stale: Vec<(RequestId, u64)> = self
            .pending
            .iter()
            .filter_map(|(id, tx)| match tx.position {
                Some(p) if p.index >= index => Some((*id, p.index)),
                _ => None,
            })
            .collect();
        for (id, at) in stale {
            self.resolve(&id, Err(ClientError::Abandoned { index: at }));
        }
    }

    /// The log was replaced by a snapshot covering `index`.
    ///
    /// Entries expected at or below it may have committed with our command or
    /// with another one; later positions stay pending.
    pub fn on_snapshot_installed(&mut self, index: u64) {
        let covered: Vec<(RequestId, u64)> = self
            .pending
            .iter()
            .filter_map(|(id, tx)| match tx.position {
                Some(p) if p.index <= index => Some((*id, p.index)),
                _ => None,
            })
            .collect();
        for (id, at) in covered {
            self.resolve(&id, Err(ClientError::OutcomeUnknown { index: at }));
        }
    }

    /// Leadership ended: entries this node appended beyond `commit_index` may never commit.
    pub fn on_leadership_lost(&mut self, commit_index: u64) {
        self.fail_where(
            |tx| tx.leader_local && tx.position.is_some_and(|p| p.index > commit_index),
            ClientError::LeadershipLost,
        );
    }

    /// Fail everything whose deadline has passed.
    pub fn expire(&mut self, now: u64) {
        self.fail_where(|tx| tx.deadline <= now, ClientError::Timeout);
    }

    pub fn fail_all(&mut self, err: ClientError) {
        self.fail_where(|_| true, err);
    }

    pub fn earliest_deadline(&self) -> Option<u64> {
        self.pending.values().map(|tx| tx.deadline).min()
    }

    fn fail_where(&mut self, pred: impl Fn(&PendingTx) -> bool, err: ClientError) {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, tx)| pred(tx))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.resolve(&id, Err(err.clone()));
        }
    }
}
