//! Per-task attempt loop: seeds, mode selection, final repair, and the
//! prediction row that comes out the other end.

use super::patch::PatchRequest;
use crate::agent::{run_edit_agent, AgentBudget};
use crate::diff::{CandidateDiff, PathFixups};
use crate::error::GatewayError;
use crate::llm::{ChatGateway, ModelSpec, SamplingParams, Usage};
use crate::records::{AttemptRecord, JsonlLog, PredictionRecord, Status};
use crate::task::Task;
use crate::workspace::{Workspace, WorkspaceProvider};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Ask for a diff directly.
    Patch,
    /// Let the model edit a checkout through tools, then diff it.
    Edit,
}

#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub attempts: usize,
    pub mode: Mode,
    pub sampling: SamplingParams,
    pub preflight: bool,
    pub hints: bool,
    pub agent_budget: AgentBudget,
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self {
            attempts: 2,
            mode: Mode::Patch,
            sampling: SamplingParams::default(),
            preflight: true,
            hints: true,
            agent_budget: AgentBudget::default(),
        }
    }
}

/// Shared, read-only state every task runs against.
pub struct AttemptContext {
    pub workspaces: Arc<dyn WorkspaceProvider>,
    pub fixups: PathFixups,
    pub settings: AttemptSettings,
}

struct AttemptResult {
    candidate: CandidateDiff,
    reprompts: usize,
}

impl AttemptContext {
    /// Run every attempt for one (task, model) pair and produce its prediction.
    ///
    /// Never fails: gateway errors become `error` attempts, and a task that
    /// never yields a valid diff still gets a row with an empty patch.
    pub async fn run_task(
        &self,
        gateway: &dyn ChatGateway,
        model: &ModelSpec,
        task: &Task,
        attempts_log: Option<&JsonlLog>,
    ) -> PredictionRecord {
        let model_name = model.qualified_name();
        let mut status = Status::Failed;
        let mut usage = Usage::default();
        let mut patch = String::new();
        let repo_files = if self.settings.hints {
            self.list_files(task).await
        } else {
            Vec::new()
        };

        for attempt_index in 0..self.settings.attempts {
            let seed = model.derived_seed(attempt_index);
            let params = self.settings.sampling.with_seed(seed);
            let mut attempt_usage = Usage::default();

            let outcome = self
                .run_attempt(gateway, task, &params, &repo_files, &mut attempt_usage)
                .await;
            let (attempt_status, reprompts) =
                match outcome {
                    Ok(result) => {
                        let mut candidate = result.candidate.repaired(&task.repo, &self.fixups);
                        let valid = candidate.validate().is_ok();
                        if valid && !candidate.is_empty() {
                            patch = candidate.into_text();
                            (Status::Ok, result.reprompts)
                        } else {
                            (Status::NoValidPatch, result.reprompts)
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            instance_id = %task.instance_id,
                            model = %model_name,
                            attempt = attempt_index,
                            error = %err,
                            "attempt aborted by gateway error"
                        );
                        attempt_usage.error = Some(err.to_string());
                        (Status::Error, 0)
                    }
                };

            tracing::info!(
                instance_id = %task.instance_id,
                model = %model_name,
                attempt = attempt_index,
                seed,
                status = attempt_status.as_str(),
                total_tokens = attempt_usage.total_tokens,
                "attempt finished"
            );
            if let Some(log) = attempts_log {
                let record = AttemptRecord {
                    instance_id: task.instance_id.clone(),
                    provider: model.provider.clone(),
                    model: model.model_name.clone(),
                    attempt_index,
                    seed,
                    status: attempt_status,
                    usage: attempt_usage.clone(),
                    reprompts,
                    timestamp: Utc::now(),
                };
                if let Err(err) = log.write(&record) {
                    tracing::warn!(error = %format!("{:#}", err), "failed to write attempt log");
                }
            }

            status = attempt_status;
            usage = attempt_usage;
            if status == Status::Ok {
                break;
            }
        }

        PredictionRecord {
            instance_id: task.instance_id.clone(),
            model_name_or_path: model_name,
            model_patch: if status == Status::Ok { patch } else { String::new() },
            status,
            usage,
        }
    }

    async fn run_attempt(
        &self,
        gateway: &dyn ChatGateway,
        task: &Task,
        params: &SamplingParams,
        repo_files: &[String],
        usage: &mut Usage,
    ) -> Result<AttemptResult, GatewayError> {
        if self.settings.mode == Mode::Edit {
            match self.materialize(task).await {
                Ok(workspace) => {
                    let outcome = run_edit_agent(
                        gateway,
                        workspace,
                        task,
                        params,
                        &self.settings.agent_budget,
                        usage,
                    )
                    .await?;
                    if !outcome.diff.trim().is_empty() {
                        return Ok(AttemptResult {
                            candidate: CandidateDiff::from_text(outcome.diff),
                            reprompts: 0,
                        });
                    }
                    tracing::info!(
                        instance_id = %task.instance_id,
                        calls = outcome.calls,
                        "edit agent produced no changes; falling back to patch mode"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        instance_id = %task.instance_id,
                        error = %format!("{:#}", err),
                        "could not prepare edit workspace; falling back to patch mode"
                    );
                }
            }
        }

        let outcome = PatchRequest {
            gateway,
            task,
            params,
            fixups: &self.fixups,
            preflight: self
                .settings
                .preflight
                .then(|| Arc::clone(&self.workspaces)),
            hints: self.settings.hints,
            repo_files,
        }
        .run(usage)
        .await?;
        Ok(AttemptResult {
            candidate: outcome.candidate,
            reprompts: outcome.reprompts,
        })
    }

    /// Tracked files of the task's repository for hint checking. Empty if the
    /// listing fails; hints then come from the issue text alone.
    async fn list_files(&self, task: &Task) -> Vec<String> {
        let provider = Arc::clone(&self.workspaces);
        let repo = task.repo.clone();
        let listed = tokio::task::spawn_blocking(move || provider.list_files(&repo)).await;
        match listed {
            Ok(Ok(files)) => files,
            Ok(Err(err)) => {
                tracing::warn!(
                    instance_id = %task.instance_id,
                    error = %format!("{:#}", err),
                    "could not list repository files; hints stay unchecked"
                );
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(instance_id = %task.instance_id, error = %err, "file listing task failed");
                Vec::new()
            }
        }
    }

    async fn materialize(&self, task: &Task) -> anyhow::Result<Workspace> {
        let provider = Arc::clone(&self.workspaces);
        let repo = task.repo.clone();
        let revision = task.base_commit.clone();
        tokio::task::spawn_blocking(move || provider.materialize(&repo, revision.as_deref()))
            .await?
    }
}
