//! Append-only run log
//!
//! One JSON object per line: a `running` line when an attempt starts and a
//! terminal line when it ends. Writers from any worker serialize through an
//! in-process mutex and an exclusive OS file lock, so concurrent appends never
//! interleave. The lock blocks, so async callers append from the blocking pool.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

use crate::task::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Running,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
        }
    }
}

/// One execution attempt of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_name: String,
    pub attempt: u32,
    pub status: AttemptStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds
    pub duration: f64,
    pub params: Params,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn started(task_name: &str, attempt: u32, params: &Params) -> (Self, Instant) {
        let record = Self {
            task_name: task_name.to_string(),
            attempt,
            status: AttemptStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            duration: 0.0,
            params: params.clone(),
            error: None,
        };
        (record, Instant::now())
    }

    pub fn complete(self, started: Instant) -> Self {
        self.finish(started, AttemptStatus::Completed, None)
    }

    pub fn fail(self, started: Instant, error: String) -> Self {
        self.finish(started, AttemptStatus::Failed, Some(error))
    }

    fn finish(mut self, started: Instant, status: AttemptStatus, error: Option<String>) -> Self {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.duration = started.elapsed().as_secs_f64();
        self.error = error;
        self
    }
}

pub struct RunLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record. Failures are reported as warnings and never propagate.
    pub fn append(&self, record: &AttemptRecord) {
        if let Err(e) = self.try_append(record) {
            warn!(
                task = %record.task_name,
                attempt = record.attempt,
                path = %self.path.display(),
                "Failed to log task {}: {}",
                record.task_name,
                e
            );
        }
    }

    fn try_append(&self, record: &AttemptRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let locked = FileLock::exclusive(&file)?;
        locked.write_line(line.as_bytes())
    }
}

/// Holds an advisory exclusive lock until dropped
struct FileLock<'a> {
    file: &'a File,
}

impl<'a> FileLock<'a> {
    fn exclusive(file: &'a File) -> io::Result<Self> {
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut out = self.file;
        out.write_all(line)?;
        out.flush()
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Parse a run log back. A missing file is an empty log; malformed lines are skipped.
pub fn read_records(path: &Path) -> Result<Vec<AttemptRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open run log: {}", path.display()))
        }
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read run log: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AttemptRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("Skipping malformed run log line {}: {}", idx + 1, e),
        }
    }

    Ok(records)
}

/// One line per attempt: drop `running` lines whose attempt has finished
pub fn collapse_attempts(records: Vec<AttemptRecord>) -> Vec<AttemptRecord> {
    let finished: HashSet<(String, u32, DateTime<Utc>)> = records
        .iter()
        .filter(|r| r.status != AttemptStatus::Running)
        .map(|r| (r.task_name.clone(), r.attempt, r.start_time))
        .collect();

    records
        .into_iter()
        .filter(|r| {
            r.status != AttemptStatus::Running
                || !finished.contains(&(r.task_name.clone(), r.attempt, r.start_time))
        })
        .collect()
}
