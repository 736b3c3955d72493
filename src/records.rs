//! Run artifacts: prediction rows, per-attempt log rows, and the append-only
//! JSONL files they are written to.

use crate::llm::Usage;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const PREDICTIONS_FILE: &str = "predictions.jsonl";
pub const ATTEMPTS_FILE: &str = "logs/attempts.jsonl";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    NoValidPatch,
    /// A gateway failure aborted the attempt.
    Error,
    /// Nothing was attempted, or the task itself crashed.
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::NoValidPatch => "no_valid_patch",
            Status::Error => "error",
            Status::Failed => "failed",
        }
    }
}

/// One row of `predictions.jsonl`, in the shape benchmark evaluators read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub instance_id: String,
    /// `<provider>:<model>`
    pub model_name_or_path: String,
    pub model_patch: String,
    pub status: Status,
    #[serde(default)]
    pub usage: Usage,
}

impl PredictionRecord {
    /// Record for a task that crashed before producing an outcome.
    pub fn failed(instance_id: &str, model_name_or_path: &str, error: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            model_name_or_path: model_name_or_path.to_string(),
            model_patch: String::new(),
            status: Status::Failed,
            usage: Usage {
                error: Some(error.into()),
                ..Default::default()
            },
        }
    }
}

/// One row of `logs/attempts.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub instance_id: String,
    pub provider: String,
    pub model: String,
    pub attempt_index: usize,
    pub seed: u64,
    pub status: Status,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reprompts: usize,
    pub timestamp: DateTime<Utc>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// Append-only JSONL file shared by concurrent tasks.
///
/// Each record becomes exactly one `write_all` of a complete line, made under
/// an in-process mutex and an exclusive advisory lock on the file.
pub struct JsonlLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLog {
    /// Open for appending, creating the file and its parent directory.
    pub fn append(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path.into(), false)
    }

    /// Like [`JsonlLog::append`] but starts from an empty file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path.into(), true)
    }

    fn open(path: PathBuf, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options
            .open(&path)
            .with_context(|| format!("Failed to open '{}'", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("log writer for '{}' is poisoned", self.path.display()))?;
        FileExt::lock_exclusive(&*file)
            .with_context(|| format!("Failed to lock '{}'", self.path.display()))?;
        let written = file.write_all(line.as_bytes()).and_then(|_| file.flush());
        let _ = FileExt::unlock(&*file);
        written.with_context(|| format!("Failed to append to '{}'", self.path.display()))
    }
}

/// Read every record of a JSONL file, skipping blank lines.
pub fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), i + 1))
        })
        .collect()
}
