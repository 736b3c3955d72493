//! Bounded-concurrency driver for a whole run: every (task, model) pair is
//! one spawned future, at most `workers` of them active at a time.

use crate::harness::{AttemptContext, AttemptSettings, Mode};
use crate::llm::{ChatGateway, ModelSpec};
use crate::records::{
    JsonlLog, PredictionRecord, Status, ATTEMPTS_FILE, MANIFEST_FILE, PREDICTIONS_FILE,
};
use crate::task::Task;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Where a run's artifacts live: `<out_dir>/<run_id>/...`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub run_dir: PathBuf,
    pub predictions: PathBuf,
    pub attempts: PathBuf,
    pub manifest: PathBuf,
}

impl RunPaths {
    pub fn new(out_dir: &Path, run_id: &str) -> Self {
        let run_dir = out_dir.join(run_id);
        Self {
            predictions: run_dir.join(PREDICTIONS_FILE),
            attempts: run_dir.join(ATTEMPTS_FILE),
            manifest: run_dir.join(MANIFEST_FILE),
            run_dir,
        }
    }
}

/// `manifest.json`: what was run and how it turned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub generated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances_path: Option<PathBuf>,
    pub predictions_path: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name_or_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<ManifestSettings>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSettings {
    pub attempts: usize,
    pub mode: Mode,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub preflight: bool,
    pub hints: bool,
    pub workers: usize,
}

impl ManifestSettings {
    pub fn new(settings: &AttemptSettings, workers: usize) -> Self {
        Self {
            attempts: settings.attempts,
            mode: settings.mode,
            temperature: settings.sampling.temperature,
            max_output_tokens: settings.sampling.max_output_tokens,
            preflight: settings.preflight,
            hints: settings.hints,
            workers,
        }
    }
}

impl RunManifest {
    pub fn new(run_id: &str, predictions_path: &Path) -> Self {
        Self {
            run_id: run_id.to_string(),
            generated: Utc::now(),
            instances_path: None,
            predictions_path: absolute(predictions_path),
            models: Vec::new(),
            model_name_or_path: None,
            settings: None,
            summary: BTreeMap::new(),
            note: None,
        }
    }

    /// Write as pretty JSON through a temp file in the same directory.
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create '{}'", dir.display()))?;
        let content = serde_json::to_string_pretty(self)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in '{}'", dir.display()))?;
        temp.write_all(content.as_bytes())?;
        temp.write_all(b"\n")?;
        temp.as_file().sync_all()?;
        temp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write manifest '{}'", path.display()))?;
        Ok(())
    }
}

pub fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// A model paired with the gateway that serves it.
#[derive(Clone)]
pub struct ModelRun {
    pub spec: ModelSpec,
    pub gateway: Arc<dyn ChatGateway>,
}

/// Status counts for a finished batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
}

impl BatchSummary {
    fn record(&mut self, status: Status) {
        *self.counts.entry(status.as_str().to_string()).or_default() += 1;
        self.total += 1;
    }

    pub fn count(&self, status: Status) -> usize {
        self.counts.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// Run every task against every model, streaming one prediction line per
/// pair into `paths.predictions` as each finishes.
///
/// A task that panics still gets a `failed` row.
pub async fn run_batch(
    ctx: Arc<AttemptContext>,
    tasks: &[Task],
    models: &[ModelRun],
    workers: usize,
    paths: &RunPaths,
) -> Result<BatchSummary> {
    std::fs::create_dir_all(&paths.run_dir)
        .with_context(|| format!("Failed to create run dir '{}'", paths.run_dir.display()))?;
    let predictions = Arc::new(JsonlLog::create(&paths.predictions)?);
    let attempts = Arc::new(JsonlLog::append(&paths.attempts)?);
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));

    tracing::info!(
        tasks = tasks.len(),
        models = models.len(),
        workers,
        predictions = %paths.predictions.display(),
        "starting batch"
    );

    let mut handles = Vec::with_capacity(tasks.len() * models.len());
    for model in models {
        for task in tasks {
            let ctx = Arc::clone(&ctx);
            let model = model.clone();
            let task = task.clone();
            let semaphore = Arc::clone(&semaphore);
            let predictions = Arc::clone(&predictions);
            let attempts = Arc::clone(&attempts);
            let key = (task.instance_id.clone(), model.spec.qualified_name());

            let handle = tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let record = ctx
                    .run_task(model.gateway.as_ref(), &model.spec, &task, Some(&attempts))
                    .await;
                if let Err(err) = predictions.write(&record) {
                    tracing::error!(
                        instance_id = %record.instance_id,
                        error = %format!("{:#}", err),
                        "failed to write prediction"
                    );
                }
                record.status
            });
            handles.push((key, handle));
        }
    }

    let joined = futures::future::join_all(
        handles
            .into_iter()
            .map(|(key, handle)| async move { (key, handle.await) }),
    )
    .await;

    let mut summary = BatchSummary::default();
    for ((instance_id, model_name), result) in joined {
        match result {
            Ok(status) => summary.record(status),
            Err(err) => {
                tracing::error!(instance_id = %instance_id, model = %model_name, error = %err, "task crashed");
                let record =
                    PredictionRecord::failed(&instance_id, &model_name, format!("task crashed: {}", err));
                predictions.write(&record)?;
                summary.record(Status::Failed);
            }
        }
    }

    tracing::info!(
        total = summary.total,
        ok = summary.count(Status::Ok),
        no_valid_patch = summary.count(Status::NoValidPatch),
        error = summary.count(Status::Error),
        failed = summary.count(Status::Failed),
        "batch finished"
    );
    Ok(summary)
}
