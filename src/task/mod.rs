//! Task definitions
//!
//! A task is anything implementing [`Runnable`]: an in-process function
//! registered with the [`TaskRegistry`], or a shell command described by a
//! TOML manifest in the task directory.

pub mod loader;
pub mod script;

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use loader::{TaskLoader, TaskRegistry};
pub use script::ScriptTask;

/// Named parameters shared by every task of a request
pub type Params = BTreeMap<String, Value>;

/// What an entry point sees while it runs
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_name: String,
    pub attempt: u32,
    pub params: Arc<Params>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_name: &str, attempt: u32, params: Arc<Params>, cancel: CancellationToken) -> Self {
        Self {
            task_name: task_name.to_string(),
            attempt,
            params,
            cancel,
        }
    }

    /// Look up a parameter as a string (non-string values are rendered as JSON)
    pub fn param(&self, key: &str) -> Option<String> {
        self.params.get(key).map(param_to_string)
    }

    /// Set once the attempt's deadline has passed or the batch was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub fn param_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A unit of user work
pub trait Runnable: Send + Sync {
    /// Run once, returning the captured output
    fn run(&self, ctx: &TaskContext) -> Result<String>;
}

/// Wraps a closure as a task
pub struct FnTask<F>(F);

impl<F> FnTask<F>
where
    F: Fn(&TaskContext) -> Result<String> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Runnable for FnTask<F>
where
    F: Fn(&TaskContext) -> Result<String> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext) -> Result<String> {
        (self.0)(ctx)
    }
}

/// A loaded task: name, ordered dependencies and entry point
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub depends_on: Vec<String>,
    pub description: Option<String>,
    entry: Arc<dyn Runnable>,
}

impl TaskDefinition {
    pub fn new(name: &str, depends_on: Vec<String>, entry: Arc<dyn Runnable>) -> Self {
        Self {
            name: name.to_string(),
            depends_on,
            description: None,
            entry,
        }
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn entry(&self) -> Arc<dyn Runnable> {
        self.entry.clone()
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
