//! One top-level task and its dependency subtree

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::resolver::{CyclePolicy, DependencyResolver};
use super::retry::{RetryConfig, RetryExecutor};
use super::state::{Claim, DependencyChain, ExecutionState};
use crate::error::{EngineError, Result};
use crate::runlog::RunLogger;
use crate::task::{Params, TaskDefinition, TaskLoader};

/// Captured output of one executed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub task: String,
    pub output: String,
}

/// Outcome of one requested task
#[derive(Debug)]
pub struct RunResult {
    pub name: String,
    /// Output of every task executed for this request, dependencies first
    pub outputs: Vec<TaskOutput>,
    pub error: Option<EngineError>,
    pub duration: Duration,
}

impl RunResult {
    pub fn failed(name: &str, error: EngineError) -> Self {
        Self {
            name: name.to_string(),
            outputs: Vec::new(),
            error: Some(error),
            duration: Duration::ZERO,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolves and executes one top-level task against shared state
pub struct Worker {
    loader: TaskLoader,
    executor: RetryExecutor,
    state: Arc<ExecutionState>,
    cycle_policy: CyclePolicy,
}

impl Worker {
    pub fn new(
        loader: TaskLoader,
        retry: RetryConfig,
        logger: Arc<RunLogger>,
        state: Arc<ExecutionState>,
        cycle_policy: CyclePolicy,
    ) -> Self {
        let executor = RetryExecutor::new(retry, logger, state.clone());
        Self {
            loader,
            executor,
            state,
            cycle_policy,
        }
    }

    pub fn state(&self) -> &Arc<ExecutionState> {
        &self.state
    }

    pub async fn run(&self, name: &str, params: Arc<Params>, cancel: &CancellationToken) -> RunResult {
        let started = Instant::now();
        let mut outputs = Vec::new();

        // The chain only lives for this top-level task
        let mut chain = DependencyChain::new();
        let resolver = DependencyResolver::new(&self.loader, &self.state, self.cycle_policy);

        let error = match resolver.resolve(name, &mut chain) {
            Ok(order) => {
                debug!(task = %name, order = ?order.iter().map(|t| &t.name).collect::<Vec<_>>(), "resolved");
                self.execute_order(name, &order, params, cancel, &mut outputs).await.err()
            }
            Err(e) => Some(e),
        };

        RunResult {
            name: name.to_string(),
            outputs,
            error,
            duration: started.elapsed(),
        }
    }

    /// Run tasks in order, stopping at the first failure
    async fn execute_order(
        &self,
        requested: &str,
        order: &[TaskDefinition],
        params: Arc<Params>,
        cancel: &CancellationToken,
        outputs: &mut Vec<TaskOutput>,
    ) -> Result<()> {
        for task in order {
            if let Some(output) = self.execute_once(requested, task, params.clone(), cancel).await? {
                outputs.push(TaskOutput {
                    task: task.name.clone(),
                    output,
                });
            }
        }
        Ok(())
    }

    /// Execute unless some worker already did. `None` means it was skipped.
    async fn execute_once(
        &self,
        requested: &str,
        task: &TaskDefinition,
        params: Arc<Params>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        loop {
            match self.state.claim(&task.name) {
                Claim::Executed => return Ok(None),
                Claim::Failed(_) => {
                    return Err(EngineError::DependencyFailed {
                        name: requested.to_string(),
                        dependency: task.name.clone(),
                    })
                }
                Claim::InFlight(mut done) => {
                    debug!(task = %task.name, "waiting for another worker");
                    tokio::select! {
                        _ = done.changed() => continue,
                        _ = cancel.cancelled() => {
                            return Err(EngineError::Cancelled { name: requested.to_string() });
                        }
                    }
                }
                Claim::Acquired(_guard) => {
                    return match self.executor.execute(task, params, cancel).await {
                        Ok(output) => Ok(Some(output)),
                        Err(e) => {
                            self.state.mark_failed(&task.name, &e.to_string());
                            Err(e)
                        }
                    };
                }
            }
        }
    }
}
