use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::execution::{CyclePolicy, EngineSettings};
use crate::execution::retry::DEFAULT_GRACE;

pub const CONFIG_FILE: &str = "brainx.toml";

/// Keys accepted by `config set`
pub const KEYS: &[&str] = &[
    "task_dir",
    "log_file",
    "max_retries",
    "timeout_secs",
    "retry_delay_ms",
    "batch_timeout_secs",
    "cycle_policy",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one `<name>.toml` manifest per task
    pub task_dir: String,
    /// Run log path (default: `<task_dir>/../logs/tasks.json`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub max_retries: u32,
    /// Per attempt
    pub timeout_secs: u64,
    pub retry_delay_ms: u64,
    pub batch_timeout_secs: u64,
    pub cycle_policy: CyclePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_dir: "tasks".to_string(),
            log_file: None,
            max_retries: 3,
            timeout_secs: 60,
            retry_delay_ms: 1000,
            batch_timeout_secs: 120,
            cycle_policy: CyclePolicy::Warn,
        }
    }
}

impl Config {
    /// Load a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be greater than 0");
        }
        if self.batch_timeout_secs == 0 {
            bail!("batch_timeout_secs must be greater than 0");
        }
        if self.task_dir.trim().is_empty() {
            bail!("task_dir must not be empty");
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "task_dir" => self.task_dir.clone(),
            "log_file" => self.log_file.clone().unwrap_or_default(),
            "max_retries" => self.max_retries.to_string(),
            "timeout_secs" => self.timeout_secs.to_string(),
            "retry_delay_ms" => self.retry_delay_ms.to_string(),
            "batch_timeout_secs" => self.batch_timeout_secs.to_string(),
            "cycle_policy" => match self.cycle_policy {
                CyclePolicy::Warn => "warn".to_string(),
                CyclePolicy::Fail => "fail".to_string(),
            },
            _ => return None,
        };
        Some(value)
    }

    /// Set one key from its string form, validating the value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "task_dir" => self.task_dir = value.to_string(),
            "log_file" => {
                self.log_file = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            "max_retries" => {
                self.max_retries = value
                    .parse()
                    .with_context(|| format!("Invalid max_retries: {}", value))?
            }
            "timeout_secs" => self.timeout_secs = parse_positive(key, value)?,
            "retry_delay_ms" => {
                self.retry_delay_ms = value
                    .parse()
                    .with_context(|| format!("Invalid retry_delay_ms: {}", value))?
            }
            "batch_timeout_secs" => self.batch_timeout_secs = parse_positive(key, value)?,
            "cycle_policy" => {
                self.cycle_policy = value.parse().map_err(anyhow::Error::msg)?;
            }
            _ => bail!("Invalid config key: {} (expected one of: {})", key, KEYS.join(", ")),
        }
        self.validate()
    }

    /// Task directory, resolved against `base_dir` after `~`/`$VAR` expansion
    pub fn task_dir(&self, base_dir: &Path) -> Result<PathBuf> {
        resolve_path(&self.task_dir, base_dir)
    }

    pub fn log_file(&self, base_dir: &Path) -> Result<PathBuf> {
        match self.log_file {
            Some(ref path) => resolve_path(path, base_dir),
            None => {
                let task_dir = self.task_dir(base_dir)?;
                let root = task_dir.parent().map(Path::to_path_buf).unwrap_or_else(|| base_dir.to_path_buf());
                Ok(root.join("logs").join("tasks.json"))
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            grace: DEFAULT_GRACE,
            cycle_policy: self.cycle_policy,
        }
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64> {
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {}: {}", key, value))?;
    if parsed == 0 {
        bail!("Invalid {}: must be greater than 0", key);
    }
    Ok(parsed)
}

fn resolve_path(raw: &str, base_dir: &Path) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw).with_context(|| format!("Failed to expand path: {}", raw))?;
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(base_dir.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
task_dir = "automation/tasks"
max_retries = 1
timeout_secs = 30
cycle_policy = "fail"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.task_dir, "automation/tasks");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.cycle_policy, CyclePolicy::Fail);
        // Unset keys keep their defaults
        assert_eq!(config.batch_timeout_secs, 120);
        assert_eq!(config.retry_delay_ms, 1000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "timeout_secs = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_set_validates_values() {
        let mut config = Config::default();
        config.set("max_retries", "5").unwrap();
        assert_eq!(config.max_retries, 5);

        assert!(config.set("max_retries", "-1").is_err());
        assert!(config.set("timeout_secs", "0").is_err());
        assert!(config.set("cycle_policy", "sometimes").is_err());
        assert!(config.set("Bad Key", "x").is_err());

        config.set("cycle_policy", "fail").unwrap();
        assert_eq!(config.get("cycle_policy").as_deref(), Some("fail"));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = Config::default();
        config.set("log_file", "/var/log/brainx.json").unwrap();
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_default_log_file_next_to_task_dir() {
        let base = Path::new("/work/project");
        let config = Config::default();
        assert_eq!(config.task_dir(base).unwrap(), PathBuf::from("/work/project/tasks"));
        assert_eq!(
            config.log_file(base).unwrap(),
            PathBuf::from("/work/project/logs/tasks.json")
        );
    }

    #[test]
    fn test_absolute_paths_are_kept() {
        let mut config = Config::default();
        config.set("task_dir", "/opt/tasks").unwrap();
        assert_eq!(config.task_dir(Path::new("/elsewhere")).unwrap(), PathBuf::from("/opt/tasks"));
    }
}
