//! Sandboxed edit agent: a bounded conversation in which the model edits a
//! private workspace through four verbs, then hands back a diff.

pub mod tools;

use crate::error::GatewayError;
use crate::harness::prompts;
use crate::llm::{ChatGateway, ChatMessage, SamplingParams, Usage};
use crate::task::Task;
use crate::workspace::Workspace;
use regex::Regex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tools::{ToolOutput, ToolResult};

/// Literal the model emits when it has finished editing.
pub const COMPLETION_TOKEN: &str = "READY_FOR_DIFF";

/// Files listed when seeding the opening message.
const TREE_SEED_LIMIT: usize = 300;

static CALL_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```call[ \t]*\r?\n(\{.*?\})[ \t]*\r?\n```").expect("call block regex")
});

/// Hard caps on one agent run. Checked between turns; an in-flight model or
/// tool call is never interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentBudget {
    pub max_calls: usize,
    pub wall_time: Duration,
    /// Soft: told to the model and logged when exceeded.
    pub per_call: Duration,
}

impl Default for AgentBudget {
    fn default() -> Self {
        Self {
            max_calls: 12,
            wall_time: Duration::from_secs(90),
            per_call: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    CallBudget,
    WallClock,
}

#[derive(Debug, Clone)]
pub struct EditAgentOutcome {
    /// Working-tree diff against the base commit; empty if nothing changed.
    pub diff: String,
    pub calls: usize,
    pub termination: Termination,
}

/// What the model's reply asked for.
#[derive(Debug, Clone, PartialEq)]
enum Parsed {
    Done,
    Call(serde_json::Value),
    NoCall,
    ManyCalls(usize),
    BadJson(String),
}

fn parse_reply(text: &str) -> Parsed {
    if text.contains(COMPLETION_TOKEN) {
        return Parsed::Done;
    }
    let blocks: Vec<&str> = CALL_BLOCK_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    match blocks.as_slice() {
        [] => Parsed::NoCall,
        [body] => match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) if value.is_object() => Parsed::Call(value),
            Ok(_) => Parsed::BadJson("call must be a JSON object".to_string()),
            Err(e) => Parsed::BadJson(e.to_string()),
        },
        many => Parsed::ManyCalls(many.len()),
    }
}

/// Run the agent to completion on `workspace`, which it consumes and removes.
///
/// Token usage is merged into `usage` as the run progresses, so a gateway
/// failure still leaves the totals for the calls that succeeded.
pub async fn run_edit_agent(
    gateway: &dyn ChatGateway,
    workspace: Workspace,
    task: &Task,
    params: &SamplingParams,
    budget: &AgentBudget,
    usage: &mut Usage,
) -> Result<EditAgentOutcome, GatewayError> {
    let start = Instant::now();
    let workspace = Arc::new(workspace);
    let root = workspace.path().to_path_buf();

    let tree = match run_tool(root.clone(), tools::ToolCall::ListTree { limit: TREE_SEED_LIMIT }).await {
        Ok(ToolOutput::Tree { entries, .. }) => entries,
        _ => Vec::new(),
    };
    let mut transcript = vec![
        ChatMessage::system(prompts::edit_system_prompt(budget)),
        ChatMessage::user(prompts::edit_user_prompt(task, &tree, TREE_SEED_LIMIT)),
    ];

    let mut calls = 0usize;
    let termination = loop {
        if calls >= budget.max_calls {
            break Termination::CallBudget;
        }
        if start.elapsed() >= budget.wall_time {
            break Termination::WallClock;
        }

        let turn_start = Instant::now();
        let reply = gateway.chat(&transcript, params).await?;
        *usage += &reply.usage;
        if turn_start.elapsed() > budget.per_call {
            tracing::warn!(
                instance_id = %task.instance_id,
                elapsed_ms = turn_start.elapsed().as_millis() as u64,
                "model turn exceeded per-call budget"
            );
        }

        let feedback = match parse_reply(&reply.text) {
            Parsed::Done => break Termination::Completed,
            Parsed::Call(call) => {
                calls += 1;
                usage.calls += 1;
                let result = dispatch(root.clone(), call, budget.per_call).await;
                tracing::debug!(
                    instance_id = %task.instance_id,
                    call = calls,
                    ok = result.ok,
                    duration_s = result.duration_s,
                    "tool call"
                );
                prompts::result_block(&result.to_json())
            }
            Parsed::NoCall => prompts::missing_call_nudge(),
            Parsed::ManyCalls(count) => prompts::multiple_calls_nudge(count),
            Parsed::BadJson(err) => {
                prompts::result_block(&ToolResult::failure(format!("invalid JSON: {}", err)).to_json())
            }
        };
        transcript.push(ChatMessage::assistant(reply.text));
        transcript.push(ChatMessage::user(feedback));
    };

    if termination != Termination::Completed {
        tracing::info!(
            instance_id = %task.instance_id,
            calls,
            elapsed_ms = start.elapsed().as_millis() as u64,
            termination = ?termination,
            "edit agent stopped by budget"
        );
    }

    let diff = export_diff(workspace).await;
    Ok(EditAgentOutcome {
        diff,
        calls,
        termination,
    })
}

async fn run_tool(root: PathBuf, call: tools::ToolCall) -> Result<ToolOutput, String> {
    tokio::task::spawn_blocking(move || tools::run(&root, &call).map_err(|e| e.to_string()))
        .await
        .map_err(|e| e.to_string())?
}

/// Execute one call off the async runtime. A panicking tool becomes an error result.
async fn dispatch(root: PathBuf, call: serde_json::Value, per_call: Duration) -> ToolResult {
    let result = match tokio::task::spawn_blocking(move || tools::execute(&root, &call)).await {
        Ok(result) => result,
        Err(err) => ToolResult::failure(format!("tool execution failed: {}", err)),
    };
    if result.duration_s > per_call.as_secs_f64() {
        tracing::warn!(duration_s = result.duration_s, "tool call exceeded per-call budget");
    }
    result
}

/// Diff the workspace and remove it, both off the async runtime.
async fn export_diff(workspace: Arc<Workspace>) -> String {
    let joined = tokio::task::spawn_blocking(move || {
        let diff = workspace.diff_since_snapshot();
        drop(workspace);
        diff
    })
    .await;
    match joined {
        Ok(Ok(diff)) => diff,
        Ok(Err(err)) => {
            tracing::warn!(error = %format!("{:#}", err), "failed to export workspace diff");
            String::new()
        }
        Err(err) => {
            tracing::warn!(error = %err, "diff export task failed");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LocalRemote, ScriptedGateway};
    use crate::workspace::WorkspaceProvider;

    fn call(json: &str) -> String {
        format!("Let me do that.\n```call\n{}\n```", json)
    }

    fn workspace(remote: &LocalRemote) -> Workspace {
        remote.provider().materialize("acme/widgets", None).unwrap()
    }

    async fn run(
        gateway: &ScriptedGateway,
        ws: Workspace,
        budget: AgentBudget,
        usage: &mut Usage,
    ) -> Result<EditAgentOutcome, GatewayError> {
        let task = Task::new("t1", "acme/widgets", "fix off-by-one in parse()");
        run_edit_agent(gateway, ws, &task, &SamplingParams::default(), &budget, usage).await
    }

    #[test]
    fn test_parse_reply_variants() {
        assert_eq!(parse_reply("all done. READY_FOR_DIFF"), Parsed::Done);
        assert_eq!(parse_reply("thinking..."), Parsed::NoCall);
        assert_eq!(
            parse_reply(&call(r#"{"tool":"LIST_TREE"}"#)),
            Parsed::Call(serde_json::json!({"tool": "LIST_TREE"}))
        );
        let two = format!(
            "{}\n{}",
            call(r#"{"tool":"READ","path":"a"}"#),
            call(r#"{"tool":"READ","path":"b"}"#)
        );
        assert_eq!(parse_reply(&two), Parsed::ManyCalls(2));
        assert!(matches!(parse_reply(&call("{tool: LIST_TREE}")), Parsed::BadJson(_)));
        assert!(matches!(parse_reply(&call("[1, 2]")), Parsed::NoCall));
    }

    #[tokio::test]
    async fn test_agent_edits_and_exports_diff() {
        let remote = LocalRemote::new();
        let ws = workspace(&remote);
        let root = ws.path().to_path_buf();

        let write = call(
            r#"{"tool":"WRITE","path":"widgets/parse.py","content":"def parse(items):\n    return items[0:]\n"}"#,
        );
        let gateway = ScriptedGateway::new(&[
            &call(r#"{"tool":"READ","path":"widgets/parse.py"}"#),
            "I should look around first.",
            &write,
            "READY_FOR_DIFF",
        ]);
        let mut usage = Usage::default();

        let outcome = run(&gateway, ws, AgentBudget::default(), &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.calls, 2);
        assert!(outcome.diff.contains("+    return items[0:]"), "{}", outcome.diff);
        assert_eq!(usage.total_tokens, 60);
        assert_eq!(usage.calls, 2);
        assert!(!root.exists(), "workspace should be removed after export");

        let opening = gateway.seen.lock().unwrap()[0][1].content.clone();
        assert!(opening.contains("- widgets/parse.py (39 bytes)"), "{}", opening);
        assert!(gateway.last_prompt(1).contains("return items[1:]"));
        assert!(gateway.last_prompt(2).contains("No call block found"));
    }

    #[tokio::test]
    async fn test_malformed_calls_stop_at_wall_clock() {
        let remote = LocalRemote::new();
        let gateway = ScriptedGateway::new(&["```call\nLIST_TREE please\n```"])
            .with_delay(Duration::from_millis(20));
        let budget = AgentBudget {
            max_calls: 3,
            wall_time: Duration::from_millis(200),
            per_call: Duration::from_secs(25),
        };
        let mut usage = Usage::default();

        let outcome = run(&gateway, workspace(&remote), budget, &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::WallClock);
        assert_eq!(outcome.calls, 0);
        assert_eq!(outcome.diff, "");
    }

    #[tokio::test]
    async fn test_call_budget_stops_the_loop() {
        let remote = LocalRemote::new();
        let gateway = ScriptedGateway::new(&[&call(r#"{"tool":"GREP","pattern":"def"}"#)]);
        let budget = AgentBudget {
            max_calls: 3,
            ..AgentBudget::default()
        };
        let mut usage = Usage::default();

        let outcome = run(&gateway, workspace(&remote), budget, &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::CallBudget);
        assert_eq!(outcome.calls, 3);
        assert_eq!(gateway.calls(), 3);
    }

    #[tokio::test]
    async fn test_sandbox_violation_is_reported_and_loop_continues() {
        let remote = LocalRemote::new();
        let gateway = ScriptedGateway::new(&[
            &call(r#"{"tool":"WRITE","path":"../outside.txt","content":"x"}"#),
            "READY_FOR_DIFF",
        ]);
        let mut usage = Usage::default();

        let outcome = run(&gateway, workspace(&remote), AgentBudget::default(), &mut usage)
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.diff, "");
        assert!(gateway.last_prompt(1).contains("\"ok\":false"));
    }

    #[tokio::test]
    async fn test_gateway_error_propagates_with_usage_so_far() {
        let remote = LocalRemote::new();
        let gateway = ScriptedGateway::new(&[&call(r#"{"tool":"LIST_TREE"}"#), "!error"]);
        let mut usage = Usage::default();

        let err = run(&gateway, workspace(&remote), AgentBudget::default(), &mut usage)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.calls, 1);
    }
}
