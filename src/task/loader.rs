//! Resolves task names to definitions

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::script::ScriptTask;
use super::{Runnable, TaskDefinition};
use crate::error::{EngineError, LoadError, Result};

const MANIFEST_EXT: &str = "toml";

/// On-disk description of a task: `<task_dir>/<name>.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct TaskManifest {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Working directory, relative to the task directory
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Clone)]
struct Registered {
    depends_on: Vec<String>,
    description: Option<String>,
    entry: Arc<dyn Runnable>,
}

/// Explicitly registered in-process tasks
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Registered>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R>(&mut self, name: &str, depends_on: &[&str], task: R) -> &mut Self
    where
        R: Runnable + 'static,
    {
        self.register_arc(name, depends_on, Arc::new(task))
    }

    pub fn register_arc(&mut self, name: &str, depends_on: &[&str], task: Arc<dyn Runnable>) -> &mut Self {
        self.tasks.insert(
            name.to_string(),
            Registered {
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
                description: None,
                entry: task,
            },
        );
        self
    }

    pub fn describe(&mut self, name: &str, description: &str) -> &mut Self {
        if let Some(task) = self.tasks.get_mut(name) {
            task.description = Some(description.to_string());
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.tasks.keys()
    }

    fn get(&self, name: &str) -> Option<TaskDefinition> {
        self.tasks.get(name).map(|t| {
            TaskDefinition::new(name, t.depends_on.clone(), t.entry.clone())
                .with_description(t.description.clone())
        })
    }
}

/// Loads tasks from the registry first, then from the task directory
#[derive(Clone)]
pub struct TaskLoader {
    task_dir: PathBuf,
    registry: TaskRegistry,
}

impl TaskLoader {
    pub fn new(task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_dir: task_dir.into(),
            registry: TaskRegistry::new(),
        }
    }

    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    /// Build a fresh definition for `name`. Never touches execution state.
    pub fn load(&self, name: &str) -> Result<TaskDefinition> {
        if let Some(task) = self.registry.get(name) {
            return Ok(task);
        }

        if !is_valid_task_name(name) {
            return Err(self.not_found(name));
        }

        let path = self.manifest_path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.not_found(name)),
            Err(e) => return Err(load_failure(name, LoadError::Io(e))),
        };

        let manifest: TaskManifest =
            toml::from_str(&content).map_err(|e| load_failure(name, LoadError::Parse(e)))?;

        let cmd = match manifest.cmd {
            Some(ref cmd) if !cmd.trim().is_empty() => cmd.clone(),
            _ => return Err(load_failure(name, LoadError::MissingEntryPoint)),
        };

        let cwd = manifest
            .cwd
            .as_ref()
            .map(|c| self.task_dir.join(c))
            .unwrap_or_else(|| self.task_dir.clone());

        let script = ScriptTask::new(cmd, cwd, manifest.env.clone());

        Ok(TaskDefinition::new(name, manifest.depends_on, Arc::new(script))
            .with_description(manifest.description))
    }

    /// Every task name the loader can see, sorted
    pub fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.registry.names().cloned().collect();

        if self.task_dir.is_dir() {
            let pattern = format!("{}/*.{}", glob::Pattern::escape(&self.task_dir.to_string_lossy()), MANIFEST_EXT);
            for path in glob::glob(&pattern)?.filter_map(|p| p.ok()) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if is_valid_task_name(stem) {
                        names.insert(stem.to_string());
                    }
                }
            }
        }

        Ok(names.into_iter().collect())
    }

    fn manifest_path(&self, name: &str) -> PathBuf {
        self.task_dir.join(format!("{}.{}", name, MANIFEST_EXT))
    }

    fn not_found(&self, name: &str) -> EngineError {
        EngineError::TaskNotFound {
            name: name.to_string(),
            dir: self.task_dir.clone(),
        }
    }
}

fn load_failure(name: &str, source: LoadError) -> EngineError {
    EngineError::TaskLoadFailure {
        name: name.to_string(),
        source,
    }
}

/// Names map to file stems, so only a safe character set is accepted
pub fn is_valid_task_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnTask;
    use tempfile::tempdir;

    #[test]
    fn test_load_manifest() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("test.toml"),
            r#"
description = "Run the tests"
cmd = "cargo test"
depends_on = ["build", "lint"]
"#,
        )
        .unwrap();

        let loader = TaskLoader::new(dir.path());
        let task = loader.load("test").unwrap();
        assert_eq!(task.name, "test");
        assert_eq!(task.depends_on, vec!["build", "lint"]);
        assert_eq!(task.description.as_deref(), Some("Run the tests"));
    }

    #[test]
    fn test_missing_task() {
        let dir = tempdir().unwrap();
        let loader = TaskLoader::new(dir.path());
        let err = loader.load("missing_task").unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound { .. }));
        assert!(err.to_string().contains("Task not found"));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = tempdir().unwrap();
        let loader = TaskLoader::new(dir.path().join("tasks"));
        fs::write(dir.path().join("secret.toml"), "cmd = \"echo hi\"").unwrap();

        let err = loader.load("../secret").unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound { .. }));
    }

    #[test]
    fn test_missing_entry_point() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test_task.toml"), "depends_on = []\n").unwrap();

        let err = TaskLoader::new(dir.path()).load("test_task").unwrap_err();
        assert!(matches!(
            err,
            EngineError::TaskLoadFailure {
                source: LoadError::MissingEntryPoint,
                ..
            }
        ));
    }

    #[test]
    fn test_unparsable_manifest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.toml"), "cmd = [unterminated").unwrap();

        let err = TaskLoader::new(dir.path()).load("broken").unwrap_err();
        assert!(matches!(
            err,
            EngineError::TaskLoadFailure {
                source: LoadError::Parse(_),
                ..
            }
        ));
    }

    #[test]
    fn test_registry_takes_precedence() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("build.toml"), "cmd = \"false\"").unwrap();

        let mut registry = TaskRegistry::new();
        registry.register("build", &["fetch"], FnTask::new(|_: &crate::task::TaskContext| Ok("built".to_string())));

        let loader = TaskLoader::new(dir.path()).with_registry(registry);
        let task = loader.load("build").unwrap();
        assert_eq!(task.depends_on, vec!["fetch"]);
    }

    #[test]
    fn test_load_is_repeatable() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.toml"), "cmd = \"echo a\"\ndepends_on = [\"b\"]").unwrap();

        let loader = TaskLoader::new(dir.path());
        let first = loader.load("a").unwrap();
        let second = loader.load("a").unwrap();
        assert_eq!(first.depends_on, second.depends_on);
    }

    #[test]
    fn test_list_merges_sources() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("lint.toml"), "cmd = \"echo lint\"").unwrap();
        fs::write(dir.path().join("build.toml"), "cmd = \"echo build\"").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = TaskRegistry::new();
        registry.register("audit", &[], FnTask::new(|_: &crate::task::TaskContext| Ok(String::new())));

        let loader = TaskLoader::new(dir.path()).with_registry(registry);
        assert_eq!(loader.list().unwrap(), vec!["audit", "build", "lint"]);
    }
}
