//! Retry and timeout enforcement for a single task

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::ExecutionState;
use crate::error::{EngineError, Result};
use crate::runlog::{AttemptRecord, RunLogger};
use crate::task::{Params, TaskContext, TaskDefinition};

/// How long an attempt that ignored its cancellation gets before it is abandoned
pub const DEFAULT_GRACE: Duration = Duration::from_millis(250);

/// Retry configuration for a run
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Per attempt, never cumulative
    pub timeout: Duration,
    pub delay: Duration,
    pub grace: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(60),
            delay: Duration::from_secs(1),
            grace: DEFAULT_GRACE,
        }
    }
}

impl RetryConfig {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

enum AttemptOutcome {
    Completed(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

enum LastFailure {
    Error(String),
    Timeout,
}

pub struct RetryExecutor {
    config: RetryConfig,
    logger: Arc<RunLogger>,
    state: Arc<ExecutionState>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, logger: Arc<RunLogger>, state: Arc<ExecutionState>) -> Self {
        Self { config, logger, state }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `task` until one attempt succeeds or attempts run out.
    ///
    /// Every attempt is logged as `running` when it starts and again with its
    /// terminal status before the next one starts. On success the task
    /// joins the executed set. `cancel` aborts the whole sequence (batch ceiling).
    pub async fn execute(
        &self,
        task: &TaskDefinition,
        params: Arc<Params>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let total = self.config.total_attempts();
        let mut last = LastFailure::Error(String::new());

        for attempt in 1..=total {
            let (record, started) = AttemptRecord::started(&task.name, attempt, &params);
            debug!(task = %task.name, attempt, "running");
            self.log(record.clone()).await;

            match self.run_once(task, attempt, params.clone(), cancel).await {
                AttemptOutcome::Completed(output) => {
                    self.log(record.complete(started)).await;
                    self.state.mark_executed(&task.name);
                    if attempt > 1 {
                        info!(task = %task.name, "passed on attempt {}/{}", attempt, total);
                    }
                    return Ok(output);
                }
                AttemptOutcome::Failed(message) => {
                    debug!(task = %task.name, attempt, error = %message, "attempt failed");
                    self.log(record.fail(started, message.clone())).await;
                    last = LastFailure::Error(message);
                }
                AttemptOutcome::TimedOut => {
                    let message = format!("Operation timed out after {}", format_duration(self.config.timeout));
                    debug!(task = %task.name, attempt, "{}", message);
                    self.log(record.fail(started, message)).await;
                    last = LastFailure::Timeout;
                }
                AttemptOutcome::Cancelled => {
                    self.log(record.fail(started, "Cancelled: batch time limit reached".to_string()))
                        .await;
                    return Err(EngineError::Cancelled {
                        name: task.name.clone(),
                    });
                }
            }

            if attempt < total {
                info!(
                    task = %task.name,
                    "Retrying attempt {} of {} (waiting {}ms)",
                    attempt + 1,
                    total,
                    self.config.delay.as_millis()
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.config.delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(EngineError::Cancelled { name: task.name.clone() });
                    }
                }
            }
        }

        Err(match last {
            LastFailure::Timeout => EngineError::ExecutionTimeout {
                name: task.name.clone(),
                attempts: total,
                timeout: self.config.timeout,
            },
            LastFailure::Error(message) => EngineError::ExecutionFailure {
                name: task.name.clone(),
                attempts: total,
                message,
            },
        })
    }

    /// Append off the runtime threads; the file lock may block on other processes
    async fn log(&self, record: AttemptRecord) {
        let logger = self.logger.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || logger.append(&record)).await {
            warn!("Run log writer failed: {}", e);
        }
    }

    /// One attempt on its own thread, so a stuck entry point can be abandoned
    async fn run_once(
        &self,
        task: &TaskDefinition,
        attempt: u32,
        params: Arc<Params>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let token = cancel.child_token();
        let ctx = TaskContext::new(&task.name, attempt, params, token.clone());
        let entry = task.entry();
        let (tx, mut rx) = oneshot::channel();

        let spawned = thread::Builder::new()
            .name(format!("task-{}-{}", task.name, attempt))
            .spawn(move || {
                let _ = tx.send(entry.run(&ctx));
            });
        if let Err(e) = spawned {
            return AttemptOutcome::Failed(format!("failed to start task thread: {}", e));
        }

        let finished = tokio::select! {
            res = tokio::time::timeout(self.config.timeout, &mut rx) => Some(res),
            _ = cancel.cancelled() => None,
        };

        match finished {
            Some(Ok(Ok(Ok(output)))) => AttemptOutcome::Completed(output),
            Some(Ok(Ok(Err(e)))) => AttemptOutcome::Failed(format!("{:#}", e)),
            // Sender dropped without a value: the entry point panicked
            Some(Ok(Err(_))) => AttemptOutcome::Failed("task panicked".to_string()),
            Some(Err(_)) => {
                token.cancel();
                self.abandon(&task.name, rx).await;
                AttemptOutcome::TimedOut
            }
            None => {
                token.cancel();
                self.abandon(&task.name, rx).await;
                AttemptOutcome::Cancelled
            }
        }
    }

    async fn abandon(&self, name: &str, rx: oneshot::Receiver<anyhow::Result<String>>) {
        if tokio::time::timeout(self.config.grace, rx).await.is_err() {
            warn!(task = %name, "Task ignored cancellation; abandoning its thread");
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runlog::{read_records, AttemptRecord, AttemptStatus};
    use crate::task::{FnTask, Runnable};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::{tempdir, TempDir};

    fn definition<R: Runnable + 'static>(name: &str, task: R) -> TaskDefinition {
        TaskDefinition::new(name, vec![], Arc::new(task))
    }

    fn executor(dir: &TempDir, max_retries: u32, timeout: Duration) -> (RetryExecutor, Arc<ExecutionState>) {
        let state = ExecutionState::new();
        let config = RetryConfig {
            max_retries,
            timeout,
            delay: Duration::from_millis(10),
            grace: Duration::from_millis(50),
        };
        let logger = Arc::new(RunLogger::new(dir.path().join("tasks.json")));
        (RetryExecutor::new(config, logger, state.clone()), state)
    }

    /// Terminal records only; every attempt also writes a `running` line first
    fn finished(dir: &TempDir) -> Vec<AttemptRecord> {
        read_records(&dir.path().join("tasks.json"))
            .unwrap()
            .into_iter()
            .filter(|r| r.status != AttemptStatus::Running)
            .collect()
    }

    fn statuses(dir: &TempDir) -> Vec<AttemptStatus> {
        finished(dir).into_iter().map(|r| r.status).collect()
    }

    #[test]
    fn test_total_attempts() {
        let config = RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        };
        assert_eq!(config.total_attempts(), 3);
        assert_eq!(RetryConfig::default().timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let dir = tempdir().unwrap();
        let (executor, state) = executor(&dir, 3, Duration::from_secs(5));
        let task = definition("noop", FnTask::new(|_: &TaskContext| Ok("done".to_string())));

        let output = executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output, "done");
        assert_eq!(statuses(&dir), vec![AttemptStatus::Completed]);
        assert!(state.is_executed("noop"));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 2, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let task = definition(
            "flaky",
            FnTask::new(move |_: &TaskContext| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("Retry error");
                }
                Ok("Task executed".to_string())
            }),
        );

        executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            statuses(&dir),
            vec![AttemptStatus::Failed, AttemptStatus::Failed, AttemptStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries() {
        let dir = tempdir().unwrap();
        let (executor, state) = executor(&dir, 1, Duration::from_secs(5));
        let task = definition("test_task", FnTask::new(|_: &TaskContext| anyhow::bail!("Task error")));

        let err = executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Task test_task failed to complete after 2 attempt(s): Task error");
        assert_eq!(statuses(&dir).len(), 2);
        assert!(!state.is_executed("test_task"));

        let records = finished(&dir);
        assert_eq!(records[1].attempt, 2);
        assert_eq!(records[1].error.as_deref(), Some("Task error"));
    }

    #[tokio::test]
    async fn test_timeout_abandons_uncooperative_task() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 0, Duration::from_millis(200));
        let task = definition(
            "slow",
            FnTask::new(|_: &TaskContext| {
                thread::sleep(Duration::from_secs(2));
                Ok(String::new())
            }),
        );

        let started = std::time::Instant::now();
        let err = executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));

        let records = finished(&dir);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AttemptStatus::Failed);
        assert!(records[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_is_a_failed_attempt() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 0, Duration::from_secs(5));
        let task = definition("boom", FnTask::new(|_: &TaskContext| -> anyhow::Result<String> { panic!("boom") }));

        let err = executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ExecutionFailure { ref message, .. } if message == "task panicked"));
    }

    #[tokio::test]
    async fn test_cancel_stops_retrying() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 5, Duration::from_secs(5));
        let task = definition(
            "waits",
            FnTask::new(|ctx: &TaskContext| {
                while !ctx.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                anyhow::bail!("stopped")
            }),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = executor
            .execute(&task, Arc::new(Params::new()), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled { .. }));
        assert_eq!(statuses(&dir), vec![AttemptStatus::Failed]);
    }

    #[tokio::test]
    async fn test_running_record_precedes_terminal_record() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 0, Duration::from_secs(5));
        let task = definition("noop", FnTask::new(|_: &TaskContext| Ok(String::new())));

        executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap();

        let records = read_records(&dir.path().join("tasks.json")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, AttemptStatus::Running);
        assert!(records[0].end_time.is_none());
        assert!(records[0].error.is_none());
        assert_eq!(records[1].status, AttemptStatus::Completed);
        assert_eq!(records[1].attempt, records[0].attempt);
        assert!(records[1].end_time.is_some());
    }

    #[tokio::test]
    async fn test_last_attempt_timing_out_reports_timeout() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 1, Duration::from_millis(200));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let task = definition(
            "flaky_then_slow",
            FnTask::new(move |_: &TaskContext| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first failure");
                }
                thread::sleep(Duration::from_secs(2));
                Ok(String::new())
            }),
        );

        let err = executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ExecutionTimeout { attempts: 2, .. }));
        assert_eq!(statuses(&dir), vec![AttemptStatus::Failed, AttemptStatus::Failed]);
    }

    #[tokio::test]
    async fn test_last_attempt_erroring_reports_failure() {
        let dir = tempdir().unwrap();
        let (executor, _) = executor(&dir, 1, Duration::from_millis(200));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let task = definition(
            "slow_then_flaky",
            FnTask::new(move |_: &TaskContext| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_secs(2));
                    return Ok(String::new());
                }
                anyhow::bail!("second failure")
            }),
        );

        let err = executor
            .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            EngineError::ExecutionFailure { attempts, ref message, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(message, "second failure");
            }
            other => panic!("expected execution failure, got {:?}", other),
        }
        let records = finished(&dir);
        assert!(records[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_locked_log_does_not_stall_runtime() {
        use fs2::FileExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let holder = std::fs::File::create(&path).unwrap();
        holder.lock_exclusive().unwrap();

        // Another process owning the lock for a while
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(400));
            holder.unlock().unwrap();
        });

        let (executor, _) = executor(&dir, 0, Duration::from_secs(5));
        let executor = Arc::new(executor);
        let run = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let task = definition("noop", FnTask::new(|_: &TaskContext| Ok(String::new())));
                executor
                    .execute(&task, Arc::new(Params::new()), &CancellationToken::new())
                    .await
            })
        };

        // A blocked runtime thread would delay this sleep until the lock is released
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        run.await.unwrap().unwrap();
        release.join().unwrap();
        assert_eq!(statuses(&dir), vec![AttemptStatus::Completed]);
    }
}
