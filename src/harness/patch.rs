//! Patch mode: ask for a diff, then steer the model through at most one
//! structural correction and one apply correction.

use super::hints::file_hints;
use super::prompts;
use crate::diff::{preflight_apply, CandidateDiff, PathFixups, Validity};
use crate::error::GatewayError;
use crate::llm::{ChatGateway, ChatMessage, SamplingParams, Usage};
use crate::task::Task;
use crate::workspace::{ApplyCheck, WorkspaceProvider};
use std::sync::Arc;

/// Re-prompts still available within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionBudget {
    pub structural: u8,
    pub apply: u8,
}

impl Default for CorrectionBudget {
    fn default() -> Self {
        Self {
            structural: 1,
            apply: 1,
        }
    }
}

/// Why the next model request is being made.
#[derive(Debug)]
enum Purpose {
    Initial,
    StructuralFix,
    /// Holds the candidate that failed to apply, kept if the fix comes back empty.
    ApplyFix(CandidateDiff),
}

#[derive(Debug)]
enum State {
    Request(Purpose),
    Validate(CandidateDiff),
    Repair(CandidateDiff),
    Preflight(CandidateDiff),
    Finished(CandidateDiff),
}

#[derive(Debug, Clone)]
pub struct PatchOutcome {
    /// Repaired candidate; empty when the model never produced a diff.
    pub candidate: CandidateDiff,
    pub reprompts: usize,
}

/// Everything one patch-mode request needs.
pub struct PatchRequest<'a> {
    pub gateway: &'a dyn ChatGateway,
    pub task: &'a Task,
    pub params: &'a SamplingParams,
    pub fixups: &'a PathFixups,
    /// Checkout source for the dry-run apply; `None` disables preflight.
    pub preflight: Option<Arc<dyn WorkspaceProvider>>,
    pub hints: bool,
    /// Tracked files of the repository, used to check hints. May be empty.
    pub repo_files: &'a [String],
}

impl PatchRequest<'_> {
    /// Run the request to completion. Usage of every successful call is
    /// merged into `usage`, including calls made before a gateway failure.
    pub async fn run(&self, usage: &mut Usage) -> Result<PatchOutcome, GatewayError> {
        let task = self.task;
        let hints = if self.hints {
            file_hints(task, self.fixups, self.repo_files)
        } else {
            Vec::new()
        };
        let mut transcript = vec![
            ChatMessage::system(prompts::PATCH_SYSTEM),
            ChatMessage::user(prompts::patch_user_prompt(task, &hints)),
        ];
        let mut budget = CorrectionBudget::default();
        let mut reprompts = 0usize;
        let mut last_reply = String::new();

        let mut state = State::Request(Purpose::Initial);
        let candidate = loop {
            state = match state {
                State::Request(purpose) => {
                    let reply = self.gateway.chat(&transcript, self.params).await?;
                    *usage += &reply.usage;
                    let candidate = CandidateDiff::from_model_output(&reply.text);
                    last_reply = reply.text;
                    match purpose {
                        Purpose::Initial | Purpose::StructuralFix => State::Validate(candidate),
                        Purpose::ApplyFix(previous) if candidate.is_empty() => {
                            tracing::debug!(
                                instance_id = %task.instance_id,
                                "apply correction came back empty; keeping previous candidate"
                            );
                            State::Finished(previous)
                        }
                        Purpose::ApplyFix(_) => State::Repair(candidate),
                    }
                }

                State::Validate(mut candidate) => match candidate.validate() {
                    Ok(()) => State::Repair(candidate),
                    Err(reason) if budget.structural > 0 => {
                        budget.structural -= 1;
                        reprompts += 1;
                        tracing::debug!(
                            instance_id = %task.instance_id,
                            reason = %reason,
                            "re-prompting for a structurally valid diff"
                        );
                        transcript.push(ChatMessage::assistant(std::mem::take(&mut last_reply)));
                        transcript.push(ChatMessage::user(prompts::structural_correction(
                            &reason.to_string(),
                        )));
                        State::Request(Purpose::StructuralFix)
                    }
                    Err(_) => State::Repair(candidate),
                },

                State::Repair(candidate) => {
                    if candidate.is_empty() {
                        State::Finished(candidate)
                    } else {
                        let mut candidate = candidate.repaired(&task.repo, self.fixups);
                        if let Err(reason) = candidate.validate() {
                            tracing::debug!(
                                instance_id = %task.instance_id,
                                reason = %reason,
                                "repaired candidate is still structurally invalid"
                            );
                        }
                        State::Preflight(candidate)
                    }
                }

                State::Preflight(mut candidate) => {
                    let provider = match &self.preflight {
                        Some(provider)
                            if budget.apply > 0
                                && !candidate.is_empty()
                                && !task.repo.trim().is_empty() =>
                        {
                            Arc::clone(provider)
                        }
                        _ => break candidate,
                    };
                    let check = run_preflight(
                        provider,
                        task.repo.clone(),
                        task.base_commit.clone(),
                        candidate.text().to_string(),
                    )
                    .await;
                    if check.ok {
                        if candidate.validity() == Validity::StructurallyValid {
                            candidate.confirm_applied();
                        }
                        State::Finished(candidate)
                    } else {
                        budget.apply -= 1;
                        reprompts += 1;
                        tracing::debug!(
                            instance_id = %task.instance_id,
                            "preflight apply failed; re-prompting with stderr"
                        );
                        transcript.push(ChatMessage::assistant(std::mem::take(&mut last_reply)));
                        transcript.push(ChatMessage::user(prompts::apply_correction(&check.stderr)));
                        State::Request(Purpose::ApplyFix(candidate))
                    }
                }

                State::Finished(candidate) => break candidate,
            };
        };

        Ok(PatchOutcome {
            candidate,
            reprompts,
        })
    }
}

/// The dry-run apply shells out to git, so keep it off the async workers.
async fn run_preflight(
    provider: Arc<dyn WorkspaceProvider>,
    repo: String,
    revision: Option<String>,
    diff: String,
) -> ApplyCheck {
    let joined = tokio::task::spawn_blocking(move || {
        preflight_apply(provider.as_ref(), &repo, revision.as_deref(), &diff)
    })
    .await;
    joined.unwrap_or_else(|err| ApplyCheck {
        ok: false,
        stderr: format!("preflight: check did not complete: {}", err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LocalRemote, ScriptedGateway, FIX_DIFF};

    fn wrapped(diff: &str) -> String {
        format!("BEGIN_PATCH\n{}END_PATCH", diff)
    }

    fn stale_diff() -> String {
        FIX_DIFF.replace("items[1:]", "items[2:]")
    }

    async fn request(
        gateway: &ScriptedGateway,
        task: &Task,
        preflight: Option<Arc<dyn WorkspaceProvider>>,
        usage: &mut Usage,
    ) -> Result<PatchOutcome, GatewayError> {
        let fixups = PathFixups::builtin();
        let params = SamplingParams::default().with_seed(42);
        PatchRequest {
            gateway,
            task,
            params: &params,
            fixups: &fixups,
            preflight,
            hints: true,
            repo_files: &[],
        }
        .run(usage)
        .await
    }

    fn task() -> Task {
        Task::new("t1", "acme/widgets", "fix off-by-one in widgets/parse.py")
    }

    #[tokio::test]
    async fn test_valid_first_reply_needs_no_correction() {
        let gateway = ScriptedGateway::new(&[&wrapped(FIX_DIFF)]);
        let mut usage = Usage::default();
        let outcome = request(&gateway, &task(), None, &mut usage).await.unwrap();

        assert_eq!(outcome.candidate.text(), FIX_DIFF);
        assert_eq!(outcome.candidate.validity(), Validity::StructurallyValid);
        assert_eq!(outcome.reprompts, 0);
        assert_eq!(gateway.calls(), 1);
        assert_eq!(usage.total_tokens, 15);
        assert!(gateway
            .last_prompt(0)
            .ends_with("Repository likely files (paths):\n- widgets/parse.py"));
    }

    #[tokio::test]
    async fn test_prose_gets_one_structural_correction() {
        let gateway = ScriptedGateway::new(&["I think the bug is in parse().", &wrapped(FIX_DIFF)]);
        let mut usage = Usage::default();
        let outcome = request(&gateway, &task(), None, &mut usage).await.unwrap();

        assert_eq!(outcome.candidate.text(), FIX_DIFF);
        assert_eq!(outcome.reprompts, 1);
        assert_eq!(gateway.calls(), 2);
        assert_eq!(usage.total_tokens, 30);
        assert!(gateway
            .last_prompt(1)
            .starts_with("Your previous output was not a valid unified diff (empty diff)."));
        assert_eq!(gateway.seen.lock().unwrap()[1].len(), 4);
    }

    #[tokio::test]
    async fn test_persistent_prose_yields_empty_candidate() {
        let gateway = ScriptedGateway::new(&["no idea"]);
        let mut usage = Usage::default();
        let outcome = request(&gateway, &task(), None, &mut usage).await.unwrap();

        assert!(outcome.candidate.is_empty());
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_preflight_feeds_stderr_back() {
        let remote = LocalRemote::new();
        let provider: Arc<dyn WorkspaceProvider> = Arc::new(remote.provider());
        let gateway = ScriptedGateway::new(&[&wrapped(&stale_diff()), &wrapped(FIX_DIFF)]);
        let mut usage = Usage::default();
        let outcome = request(&gateway, &task(), Some(provider), &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.candidate.text(), FIX_DIFF);
        assert_eq!(outcome.reprompts, 1);
        assert!(gateway.last_prompt(1).starts_with("Preflight apply failed on the repository."));
        // Only one apply correction, so the fix is not re-checked.
        assert_eq!(outcome.candidate.validity(), Validity::StructurallyValid);
    }

    #[tokio::test]
    async fn test_empty_apply_correction_keeps_previous_candidate() {
        let remote = LocalRemote::new();
        let provider: Arc<dyn WorkspaceProvider> = Arc::new(remote.provider());
        let stale = stale_diff();
        let gateway = ScriptedGateway::new(&[&wrapped(&stale), "sorry, I cannot"]);
        let mut usage = Usage::default();
        let outcome = request(&gateway, &task(), Some(provider), &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.candidate.text(), stale);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_passing_preflight_confirms_candidate() {
        let remote = LocalRemote::new();
        let provider: Arc<dyn WorkspaceProvider> = Arc::new(remote.provider());
        let gateway = ScriptedGateway::new(&[&wrapped(FIX_DIFF)]);
        let mut usage = Usage::default();
        let outcome = request(&gateway, &task(), Some(provider), &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.candidate.validity(), Validity::ApplyConfirmed);
        assert_eq!(outcome.reprompts, 0);
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_keeps_usage_so_far() {
        let gateway = ScriptedGateway::new(&["prose", "!error"]);
        let mut usage = Usage::default();
        let err = request(&gateway, &task(), None, &mut usage).await.unwrap_err();

        assert!(matches!(err, GatewayError::Transport(_)));
        assert_eq!(usage.total_tokens, 15);
    }
}
