//! Parallel fan-out of top-level tasks using tokio

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::worker::{RunResult, Worker};
use crate::error::EngineError;
use crate::task::Params;

/// Extra time cancelled workers get to record their final attempt
const DRAIN_MARGIN: Duration = Duration::from_secs(1);

/// Aggregated outcome of a request
#[derive(Debug)]
pub struct RunReport {
    /// One result per requested task, in request order
    pub results: Vec<RunResult>,
    /// Batch-level failure (`AggregateFailure` or `BatchTimeout`)
    pub error: Option<EngineError>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.error.is_none() && self.results.iter().all(|r| r.success())
    }

    pub fn failed(&self) -> Vec<&RunResult> {
        self.results.iter().filter(|r| !r.success()).collect()
    }
}

/// Runs each requested task on its own worker, bounded by a global ceiling
pub struct ParallelOrchestrator {
    worker: Arc<Worker>,
    ceiling: Duration,
    grace: Duration,
}

impl ParallelOrchestrator {
    pub fn new(worker: Arc<Worker>, ceiling: Duration, grace: Duration) -> Self {
        Self { worker, ceiling, grace }
    }

    pub async fn run_many(&self, names: &[String], params: Arc<Params>) -> RunReport {
        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();

        info!("Running {} task(s) in parallel", names.len());

        for (idx, name) in names.iter().enumerate() {
            let worker = self.worker.clone();
            let params = params.clone();
            let cancel = cancel.clone();
            let name = name.clone();

            join_set.spawn(async move {
                let run = AssertUnwindSafe(worker.run(&name, params, &cancel)).catch_unwind().await;
                let result = run.unwrap_or_else(|_| {
                    RunResult::failed(
                        &name,
                        EngineError::ExecutionFailure {
                            name: name.clone(),
                            attempts: 0,
                            message: "worker panicked".to_string(),
                        },
                    )
                });
                (idx, result)
            });
        }

        let mut slots: Vec<Option<RunResult>> = names.iter().map(|_| None).collect();
        // A ceiling too large to represent never expires
        let deadline = Instant::now().checked_add(self.ceiling);
        let mut timed_out = false;

        loop {
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, join_set.join_next()).await,
                None => Ok(join_set.join_next().await),
            };
            match joined {
                Ok(Some(Ok((idx, result)))) => slots[idx] = Some(result),
                Ok(Some(Err(e))) => warn!("Worker join error: {}", e),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!("Batch exceeded {:?}; cancelling outstanding tasks", self.ceiling);
            cancel.cancel();

            // Give cancelled workers a moment to log their last attempt
            let now = Instant::now();
            let grace_deadline = now
                .checked_add(self.grace.saturating_add(DRAIN_MARGIN))
                .unwrap_or(now + DRAIN_MARGIN);
            while let Ok(Some(joined)) = tokio::time::timeout_at(grace_deadline, join_set.join_next()).await {
                if let Ok((idx, result)) = joined {
                    slots[idx] = Some(result);
                }
            }
            join_set.abort_all();
        }

        self.collect(names, slots)
    }

    fn collect(&self, names: &[String], slots: Vec<Option<RunResult>>) -> RunReport {
        let pending: Vec<String> = names
            .iter()
            .zip(&slots)
            .filter(|(_, slot)| match slot {
                None => true,
                Some(r) => matches!(r.error, Some(EngineError::Cancelled { .. })),
            })
            .map(|(name, _)| name.clone())
            .collect();

        let results: Vec<RunResult> = names
            .iter()
            .zip(slots)
            .map(|(name, slot)| {
                let batch_timeout = || EngineError::BatchTimeout {
                    ceiling: self.ceiling,
                    pending: vec![name.clone()],
                };
                match slot {
                    Some(mut r) if matches!(r.error, Some(EngineError::Cancelled { .. })) => {
                        r.error = Some(batch_timeout());
                        r
                    }
                    Some(r) => r,
                    None => RunResult::failed(name, batch_timeout()),
                }
            })
            .collect();

        let error = if !pending.is_empty() {
            Some(EngineError::BatchTimeout {
                ceiling: self.ceiling,
                pending,
            })
        } else {
            let failed: Vec<String> = results
                .iter()
                .filter(|r| !r.success())
                .map(|r| r.name.clone())
                .collect();
            if failed.is_empty() {
                None
            } else {
                Some(EngineError::AggregateFailure {
                    failed,
                    total: results.len(),
                })
            }
        };

        RunReport { results, error }
    }
}
