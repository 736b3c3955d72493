//! Benchmark tasks: the instance list, optionally joined with a local
//! dataset export keyed by `instance_id`.

use crate::error::TaskError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One unit of work. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub instance_id: String,
    pub repo: String,
    #[serde(default)]
    pub base_commit: Option<String>,
    pub problem_statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Task {
    pub fn new(
        instance_id: impl Into<String>,
        repo: impl Into<String>,
        problem_statement: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repo: repo.into(),
            base_commit: None,
            problem_statement: problem_statement.into(),
            title: None,
        }
    }

    pub fn with_base_commit(mut self, commit: impl Into<String>) -> Self {
        self.base_commit = Some(commit.into());
        self
    }
}

/// A raw instance line: `instance_id` plus whatever other fields it carried.
#[derive(Debug, Clone)]
pub struct InstanceLine {
    pub instance_id: String,
    pub fields: Map<String, Value>,
}

/// Parse JSONL instance text. Blank lines are skipped; the first occurrence of
/// a duplicated `instance_id` wins.
pub fn parse_instance_lines(text: &str) -> Result<Vec<InstanceLine>, TaskError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(raw).map_err(|e| TaskError::InvalidLine {
            line,
            message: e.to_string(),
        })?;
        let Value::Object(fields) = value else {
            return Err(TaskError::InvalidLine {
                line,
                message: "expected a JSON object".to_string(),
            });
        };
        let instance_id = non_empty_str(&fields, &["instance_id"])
            .ok_or(TaskError::MissingInstanceId { line })?;
        if !seen.insert(instance_id.clone()) {
            tracing::warn!(instance_id = %instance_id, line, "duplicate instance id ignored");
            continue;
        }
        out.push(InstanceLine {
            instance_id,
            fields,
        });
    }
    Ok(out)
}

pub fn load_instance_lines(path: &Path) -> Result<Vec<InstanceLine>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read instances '{}'", path.display()))?;
    parse_instance_lines(&text).with_context(|| format!("Invalid instances file '{}'", path.display()))
}

/// Local JSONL export of the benchmark dataset, indexed by `instance_id`.
#[derive(Debug, Clone, Default)]
pub struct JsonlDataset {
    records: HashMap<String, Map<String, Value>>,
}

impl JsonlDataset {
    pub fn parse(text: &str) -> Result<Self, TaskError> {
        let records = parse_instance_lines(text)?
            .into_iter()
            .map(|line| (line.instance_id, line.fields))
            .collect();
        Ok(Self { records })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid dataset file '{}'", path.display()))
    }

    pub fn get(&self, instance_id: &str) -> Option<&Map<String, Value>> {
        self.records.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Build tasks from instance lines, filling gaps from `dataset`. Any instance
/// still lacking `repo` or `problem_statement` fails the whole batch, naming
/// every such id.
pub fn resolve_tasks(
    lines: Vec<InstanceLine>,
    dataset: Option<&JsonlDataset>,
) -> Result<Vec<Task>, TaskError> {
    let mut tasks = Vec::with_capacity(lines.len());
    let mut missing = Vec::new();

    for line in lines {
        let joined = dataset.and_then(|d| d.get(&line.instance_id));
        let field = |keys: &[&str]| {
            non_empty_str(&line.fields, keys).or_else(|| joined.and_then(|j| non_empty_str(j, keys)))
        };

        let repo = field(&["repo"]);
        let problem = field(&["problem_statement", "issue_body"]);
        let (Some(repo), Some(problem_statement)) = (repo, problem) else {
            missing.push(line.instance_id);
            continue;
        };
        tasks.push(Task {
            base_commit: field(&["base_commit"]),
            title: field(&["title", "issue_title"]),
            instance_id: line.instance_id,
            repo,
            problem_statement,
        });
    }

    if !missing.is_empty() {
        missing.sort();
        return Err(TaskError::MissingInstances(missing));
    }
    Ok(tasks)
}

fn non_empty_str(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
