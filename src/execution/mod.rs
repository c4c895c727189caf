//! Execution module for brainx
//!
//! Provides:
//! - Depth-first dependency resolution with cycle detection
//! - Retry logic with per-attempt timeouts
//! - Parallel fan-out of top-level tasks with a batch ceiling
//! - Shared, mutex-guarded executed set

pub mod parallel;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod state;
pub mod worker;

pub use parallel::{ParallelOrchestrator, RunReport};
pub use resolver::{CyclePolicy, DependencyResolver};
pub use retry::{RetryConfig, RetryExecutor};
pub use runner::{Engine, EngineSettings, ExecutionRequest};
pub use state::{DependencyChain, ExecutionState};
pub use worker::{RunResult, TaskOutput, Worker};
