//! Error types for the task execution engine

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why a task unit exists but could not be turned into a definition
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("missing entry point (no `cmd` defined)")]
    MissingEntryPoint,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Task not found: {name} (looked in {})", dir.display())]
    TaskNotFound { name: String, dir: PathBuf },

    #[error("Failed to load task {name}: {source}")]
    TaskLoadFailure {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("Task {name} timed out after {timeout:?} ({attempts} attempt(s))")]
    ExecutionTimeout {
        name: String,
        attempts: u32,
        timeout: Duration,
    },

    #[error("Task {name} failed to complete after {attempts} attempt(s): {message}")]
    ExecutionFailure {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("Circular dependency detected: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Task {name} was not run: dependency {dependency} already failed in this run")]
    DependencyFailed { name: String, dependency: String },

    #[error("Task {name} was cancelled")]
    Cancelled { name: String },

    #[error("Batch exceeded {ceiling:?}; cancelled: {}", pending.join(", "))]
    BatchTimeout { ceiling: Duration, pending: Vec<String> },

    #[error("{} of {total} task(s) failed: {}", failed.len(), failed.join(", "))]
    AggregateFailure { failed: Vec<String>, total: usize },
}

impl EngineError {
    /// True for the per-attempt deadline error (not the batch ceiling)
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::ExecutionTimeout { .. })
    }

    /// True for any failure to turn a unit into a definition
    pub fn is_load_failure(&self) -> bool {
        matches!(self, EngineError::TaskLoadFailure { .. })
    }

    /// The task this error is about, when it concerns a single task
    pub fn task_name(&self) -> Option<&str> {
        match self {
            EngineError::TaskNotFound { name, .. }
            | EngineError::TaskLoadFailure { name, .. }
            | EngineError::ExecutionTimeout { name, .. }
            | EngineError::ExecutionFailure { name, .. }
            | EngineError::DependencyFailed { name, .. }
            | EngineError::Cancelled { name } => Some(name),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
