//! Depth-first dependency resolution

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use super::state::{DependencyChain, ExecutionState};
use crate::error::{EngineError, Result};
use crate::task::{TaskDefinition, TaskLoader};

/// What to do when a task shows up again on its own resolution path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Warn and treat the edge as satisfied
    #[default]
    Warn,
    /// Fail the task with `CircularDependency`
    Fail,
}

impl std::str::FromStr for CyclePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "warn" => Ok(CyclePolicy::Warn),
            "fail" => Ok(CyclePolicy::Fail),
            other => Err(format!("unknown cycle policy '{}' (expected warn or fail)", other)),
        }
    }
}

pub struct DependencyResolver<'a> {
    loader: &'a TaskLoader,
    state: &'a ExecutionState,
    policy: CyclePolicy,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(loader: &'a TaskLoader, state: &'a ExecutionState, policy: CyclePolicy) -> Self {
        Self { loader, state, policy }
    }

    /// Tasks to run, in order, so that `name` and everything it needs has run.
    /// Dependencies come first, in declaration order; `name` is last unless it
    /// has already been executed. Loading any task in the subtree can fail the
    /// whole resolution.
    pub fn resolve(&self, name: &str, chain: &mut DependencyChain) -> Result<Vec<TaskDefinition>> {
        let mut order = Vec::new();
        let mut emitted = HashSet::new();
        self.visit(name, chain, &mut order, &mut emitted)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &str,
        chain: &mut DependencyChain,
        order: &mut Vec<TaskDefinition>,
        emitted: &mut HashSet<String>,
    ) -> Result<()> {
        if self.state.is_executed(name) || emitted.contains(name) {
            return Ok(());
        }

        if chain.contains(name) {
            let cycle = chain.cycle_through(name);
            return match self.policy {
                CyclePolicy::Warn => {
                    warn!("Circular dependency detected: {}", cycle.join(" -> "));
                    Ok(())
                }
                CyclePolicy::Fail => Err(EngineError::CircularDependency { chain: cycle }),
            };
        }

        let task = self.loader.load(name)?;

        chain.push(name);
        let visited = task
            .depends_on
            .iter()
            .try_for_each(|dep| self.visit(dep, chain, order, emitted));
        chain.pop(name);
        visited?;

        emitted.insert(name.to_string());
        order.push(task);
        Ok(())
    }
}
