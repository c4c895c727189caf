//! brainx - dependency-aware task execution engine
//!
//! Runs named tasks after their declared dependencies with:
//! - Depth-first dependency resolution and cycle detection
//! - Per-attempt timeouts with bounded retries
//! - Optional parallel fan-out under a batch time ceiling
//! - An append-only JSON-lines log of every attempt

pub mod config;
pub mod error;
pub mod execution;
pub mod runlog;
pub mod task;

pub use config::Config;
pub use error::{EngineError, LoadError};
pub use execution::{CyclePolicy, Engine, EngineSettings, ExecutionRequest, RunReport, RunResult};
pub use runlog::{AttemptRecord, AttemptStatus, RunLogger};
pub use task::{FnTask, Params, Runnable, TaskContext, TaskDefinition, TaskLoader, TaskRegistry};
