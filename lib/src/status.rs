//! Status tracking.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};

pub struct Status {
    pub commands: Commands,
    pub ai: AiRequests,
    pub(crate) cancel: Cancel,
}

#[derive(Default)]
pub struct Commands {
    complete: AtomicUsize,
    total: AtomicUsize,
}

#[derive(Default)]
pub struct AiRequests {
    rounds: AtomicUsize,
    ledger_items: AtomicUsize,
}

// Cancellation is cooperative: the AI loop races in-flight completions
// against `cancelled()`, so tool effects are only ever applied for completed
// calls.
#[derive(Default)]
pub(crate) struct Cancel {
    cancelled: AtomicBool,
}

impl Status {
    pub fn new() -> Self {
        Status {
            commands: Default::default(),
            ai: Default::default(),
            cancel: Default::default(),
        }
    }

    /// Cancel execution.
    pub fn cancel(&self) {
        self.cancel.cancelled.store(true, Relaxed);
    }

    /// Return whether execution has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve when execution is cancelled.
    pub(crate) async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::new()
    }
}

impl Commands {
    pub(crate) fn inc_complete(&self) {
        self.complete.fetch_add(1, Relaxed);
    }

    pub fn complete_count(&self) -> usize {
        self.complete.load(Relaxed)
    }

    pub(crate) fn set_total(&self, val: usize) {
        self.total.store(val, Relaxed)
    }

    pub fn total_count(&self) -> usize {
        self.total.load(Relaxed)
    }

    pub fn done(&self) -> bool {
        self.complete_count() == self.total_count()
    }
}

impl AiRequests {
    pub(crate) fn inc_rounds(&self) {
        self.rounds.fetch_add(1, Relaxed);
    }

    pub fn rounds(&self) -> usize {
        self.rounds.load(Relaxed)
    }

    pub(crate) fn set_ledger_items(&self, val: usize) {
        self.ledger_items.store(val, Relaxed)
    }

    pub fn ledger_items(&self) -> usize {
        self.ledger_items.load(Relaxed)
    }
}

impl Cancel {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Relaxed)
    }
}
