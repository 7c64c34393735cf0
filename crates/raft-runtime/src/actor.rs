//! # actor
//!
//! why: give a RaftNode exclusive ownership on one task, fed by a command inbox and its own deadlines
//! relations: spawned by spawn_node or LocalNetwork::spawn, flushes outgoing envelopes to a Transport
//! what: Command, NodeHandle, the node loop and its millisecond clock

use std::sync::Arc;
use std::time::Duration;

use raft_core::{
    AdminError, ConfigChange, NodeId, NodeStatus, RaftNode, RoleId, TransactionFuture,
    TransactionResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::network::Transport;
use crate::RuntimeError;

#[derive(Debug)]
enum Command {
    /// Encoded envelope from a peer
    Deliver(Vec<u8>),
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<TransactionFuture>,
    },
    ChangeMembership {
        change: ConfigChange,
        reply: oneshot::Sender<TransactionFuture>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    ForceElection {
        role: RoleId,
        reply: oneshot::Sender<Result<(), AdminError>>,
    },
    Bootstrap {
        address: String,
        reply: oneshot::Sender<Result<(), AdminError>>,
    },
    Shutdown,
}

/// Cheap, cloneable access to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    inbox: mpsc::UnboundedSender<Command>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Hand an encoded envelope to the node. Fails only once the node stopped.
    pub fn deliver(&self, bytes: Vec<u8>) -> Result<(), RuntimeError> {
        self.inbox
            .send(Command::Deliver(bytes))
            .map_err(|_| RuntimeError::Stopped)
    }

    /// Replicate `command` and wait for the state machine's answer.
    pub async fn submit(&self, command: Vec<u8>) -> Result<Vec<u8>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Submit { command, reply })?;
        let transaction = rx.await.map_err(|_| RuntimeError::Stopped)?;
        settle(transaction.await)
    }

    /// Add, update or remove a member; resolves once the change is applied here.
    pub async fn propose_config_change(&self, change: ConfigChange) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ChangeMembership { change, reply })?;
        let transaction = rx.await.map_err(|_| RuntimeError::Stopped)?;
        settle(transaction.await).map(|_| ())
    }

    pub async fn status(&self) -> Result<NodeStatus, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    pub async fn force_election(&self, role: RoleId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForceElection { role, reply })?;
        Ok(rx.await.map_err(|_| RuntimeError::Stopped)??)
    }

    pub async fn bootstrap(&self, address: impl Into<String>) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Bootstrap { address: address.into(), reply })?;
        Ok(rx.await.map_err(|_| RuntimeError::Stopped)??)
    }

    /// Stop the node task. Unresolved transactions are dropped.
    pub fn shutdown(&self) {
        let _ = self.inbox.send(Command::Shutdown);
    }

    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.inbox.send(command).map_err(|_| RuntimeError::Stopped)
    }
}

fn settle(outcome: Result<TransactionResult, oneshot::error::RecvError>) -> Result<Vec<u8>, RuntimeError> {
    match outcome {
        Ok(result) => Ok(result?),
        // the node dropped the transaction while stopping
        Err(_) => Err(RuntimeError::Stopped),
    }
}

/// Milliseconds since the node task started, the unit of every raft deadline.
struct Clock {
    epoch: Instant,
}

impl Clock {
    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn instant(&self, ms: u64) -> Instant {
        self.epoch + Duration::from_millis(ms)
    }
}

/// Run `node` on its own task.
///
/// The node's deadlines are read as milliseconds since this call, so it
/// should have been recovered with `now = 0`.
pub fn spawn_node(node: RaftNode, transport: Arc<dyn Transport>) -> NodeHandle {
    let (inbox, commands) = mpsc::unbounded_channel();
    let handle = NodeHandle { id: node.id(), inbox };
    let clock = Clock { epoch: Instant::now() };
    tokio::spawn(run(node, commands, transport, clock));
    handle
}

async fn run(
    mut node: RaftNode,
    mut commands: mpsc::UnboundedReceiver<Command>,
    transport: Arc<dyn Transport>,
    clock: Clock,
) {
    let id = node.id();
    info!(node = id, "node task started");
    loop {
        let next = match node.next_deadline() {
            Some(deadline) => tokio::select! {
                command = commands.recv() => Some(command),
                _ = tokio::time::sleep_until(clock.instant(deadline)) => None,
            },
            None => Some(commands.recv().await),
        };

        node.tick(clock.now());
        match next {
            None => {}
            Some(None) | Some(Some(Command::Shutdown)) => break,
            Some(Some(command)) => handle(&mut node, command),
        }

        for envelope in node.take_messages() {
            transport.send(envelope);
        }
    }
    info!(node = id, "node task stopped");
}

fn handle(node: &mut RaftNode, command: Command) {
    match command {
        Command::Deliver(bytes) => {
            if let Err(err) = node.handle_encoded(&bytes) {
                warn!(node = node.id(), error = %err, "undecodable message dropped");
            }
        }
        Command::Submit { command, reply } => {
            debug!(node = node.id(), bytes = command.len(), "client submit");
            let _ = reply.send(node.submit(command));
        }
        Command::ChangeMembership { change, reply } => {
            let _ = reply.send(node.propose_config_change(change));
        }
        Command::Status { reply } => {
            let _ = reply.send(node.status());
        }
        Command::ForceElection { role, reply } => {
            let _ = reply.send(node.force_election(role));
        }
        Command::Bootstrap { address, reply } => {
            let _ = reply.send(node.bootstrap(address));
        }
        Command::Shutdown => {}
    }
}
