//! # timer
//!
//! why: single-shot deadlines that never call back into the node directly
//! relations: owned by the roles (election, heartbeat) and node.rs (transaction sweep)
//! what: Timer with arm/cancel/poll, TimerKind

/// What a timer is for; carried by the task it enqueues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
    TransactionSweep,
}

/// A cancelable, reschedulable single-shot deadline.
///
/// Firing only reports that the deadline passed; the node turns that into a
/// task on its queue.
#[derive(Debug, Clone)]
pub struct Timer {
    kind: TimerKind,
    deadline: Option<u64>,
}

impl Timer {
    pub fn new(kind: TimerKind) -> Self {
        Self { kind, deadline: None }
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// (Re)arm the timer to fire at `deadline`.
    pub fn timeout_at(&mut self, deadline: u64) {
        self.deadline = Some(deadline);
    }

    /// Make the timer due at `now` without waiting.
    pub fn timeout_now(&mut self, now: u64) {
        self.deadline = Some(now);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Disarm and return true if the deadline has passed.
    pub fn poll(&mut self, now: u64) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
