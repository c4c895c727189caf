//! Entry point of the engine: runs an `ExecutionRequest`

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::parallel::{ParallelOrchestrator, RunReport};
use super::resolver::CyclePolicy;
use super::retry::{RetryConfig, DEFAULT_GRACE};
use super::state::ExecutionState;
use super::worker::Worker;
use crate::runlog::RunLogger;
use crate::task::{Params, TaskLoader};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// What the caller wants run
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub tasks: Vec<String>,
    pub params: Params,
    pub max_retries: u32,
    /// Per attempt
    pub timeout: Duration,
    pub parallel: bool,
    /// Sequential runs only: stop after the first failed task
    pub fail_fast: bool,
}

impl ExecutionRequest {
    pub fn new<S: Into<String>>(tasks: impl IntoIterator<Item = S>) -> Self {
        Self {
            tasks: tasks.into_iter().map(Into::into).collect(),
            params: Params::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            parallel: false,
            fail_fast: false,
        }
    }

    pub fn params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Engine-wide settings that are not part of a request
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry_delay: Duration,
    pub batch_timeout: Duration,
    pub grace: Duration,
    pub cycle_policy: CyclePolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            grace: DEFAULT_GRACE,
            cycle_policy: CyclePolicy::Warn,
        }
    }
}

/// Task execution engine
///
/// Blocking API: owns its own tokio runtime, so it must not be driven from
/// inside another runtime.
pub struct Engine {
    loader: TaskLoader,
    logger: Arc<RunLogger>,
    settings: EngineSettings,
    runtime: tokio::runtime::Runtime,
}

impl Engine {
    pub fn new(loader: TaskLoader, logger: RunLogger, settings: EngineSettings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("brainx-worker")
            .build()
            .context("Failed to start task runtime")?;

        Ok(Self {
            loader,
            logger: Arc::new(logger),
            settings,
            runtime,
        })
    }

    pub fn loader(&self) -> &TaskLoader {
        &self.loader
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    /// Run a request: parallel fan-out when asked for and worthwhile, otherwise
    /// one top-level task after another. A fresh `ExecutionState` per call.
    pub fn run(&self, request: &ExecutionRequest) -> RunReport {
        let state = ExecutionState::new();
        let worker = Arc::new(self.worker(request, state));
        let params = Arc::new(request.params.clone());

        if request.parallel && request.tasks.len() > 1 {
            let orchestrator = ParallelOrchestrator::new(worker, self.settings.batch_timeout, self.settings.grace);
            return self.runtime.block_on(orchestrator.run_many(&request.tasks, params));
        }

        self.run_sequential(&worker, request, params)
    }

    fn run_sequential(&self, worker: &Worker, request: &ExecutionRequest, params: Arc<Params>) -> RunReport {
        let cancel = CancellationToken::new();
        let mut results = Vec::with_capacity(request.tasks.len());

        for name in &request.tasks {
            let result = self.runtime.block_on(worker.run(name, params.clone(), &cancel));
            let failed = !result.success();
            results.push(result);

            if failed && request.fail_fast {
                info!("Stopping due to task failure");
                break;
            }
        }

        RunReport { results, error: None }
    }

    fn worker(&self, request: &ExecutionRequest, state: Arc<ExecutionState>) -> Worker {
        let retry = RetryConfig {
            max_retries: request.max_retries,
            timeout: request.timeout,
            delay: self.settings.retry_delay,
            grace: self.settings.grace,
        };
        Worker::new(
            self.loader.clone(),
            retry,
            self.logger.clone(),
            state,
            self.settings.cycle_policy,
        )
    }
}
