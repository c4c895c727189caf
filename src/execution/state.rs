//! Per-request execution state shared by all workers

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Default)]
struct Inner {
    executed: HashSet<String>,
    /// Completion order, for reporting
    executed_order: Vec<String>,
    /// Terminal failures, keyed by task name
    failed: HashMap<String, String>,
    /// Tasks some worker is running right now. The sender side lives in the
    /// owner's `ClaimGuard`; dropping it wakes every waiter.
    in_flight: HashMap<String, watch::Receiver<()>>,
}

/// The executed set plus in-flight bookkeeping, behind a single mutex
#[derive(Default)]
pub struct ExecutionState {
    inner: Mutex<Inner>,
}

/// Result of asking to run a task
pub enum Claim {
    /// Already completed in this request; nothing to do
    Executed,
    /// Already failed terminally in this request
    Failed(String),
    /// Another worker is running it; await the receiver, then claim again
    InFlight(watch::Receiver<()>),
    /// The caller now owns the run
    Acquired(ClaimGuard),
}

impl ExecutionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_executed(&self, name: &str) -> bool {
        self.lock().executed.contains(name)
    }

    /// Names that completed successfully, in completion order
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed_order.clone()
    }

    /// Add a name to the executed set. Returns false if it was already there.
    pub fn mark_executed(&self, name: &str) -> bool {
        let mut inner = self.lock();
        if inner.executed.insert(name.to_string()) {
            inner.executed_order.push(name.to_string());
            true
        } else {
            false
        }
    }

    pub fn mark_failed(&self, name: &str, message: &str) {
        self.lock().failed.insert(name.to_string(), message.to_string());
    }

    pub fn claim(self: &Arc<Self>, name: &str) -> Claim {
        let mut inner = self.lock();

        if inner.executed.contains(name) {
            return Claim::Executed;
        }
        if let Some(message) = inner.failed.get(name) {
            return Claim::Failed(message.clone());
        }
        if let Some(rx) = inner.in_flight.get(name) {
            return Claim::InFlight(rx.clone());
        }

        let (tx, rx) = watch::channel(());
        inner.in_flight.insert(name.to_string(), rx);

        Claim::Acquired(ClaimGuard {
            state: self.clone(),
            name: name.to_string(),
            _done: tx,
        })
    }
}

/// Exclusive right to run one task; released on drop
pub struct ClaimGuard {
    state: Arc<ExecutionState>,
    name: String,
    _done: watch::Sender<()>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.state.lock().in_flight.remove(&self.name);
    }
}

/// The names on the active resolution path of one worker
#[derive(Debug, Default, Clone)]
pub struct DependencyChain {
    path: Vec<String>,
    members: HashSet<String>,
}

impl DependencyChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains(name)
    }

    pub fn push(&mut self, name: &str) {
        self.path.push(name.to_string());
        self.members.insert(name.to_string());
    }

    pub fn pop(&mut self, name: &str) {
        if let Some(pos) = self.path.iter().rposition(|n| n == name) {
            self.path.remove(pos);
        }
        self.members.remove(name);
    }

    pub fn clear(&mut self) {
        self.path.clear();
        self.members.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }

    /// The path from the root down to `name`, closing the loop
    pub fn cycle_through(&self, name: &str) -> Vec<String> {
        let start = self.path.iter().position(|n| n == name).unwrap_or(0);
        let mut cycle: Vec<String> = self.path[start..].to_vec();
        cycle.push(name.to_string());
        cycle
    }
}
