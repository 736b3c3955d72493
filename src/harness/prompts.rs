//! Prompt text for patch requests, corrective re-prompts, and the edit agent.

use crate::agent::AgentBudget;
use crate::agent::tools::TreeEntry;
use crate::task::Task;

pub const PATCH_SYSTEM: &str = "You are a highly skilled software engineer. Given a repository name and an issue description, you will propose a code fix as a unified diff. Output only the diff. No explanations. Ensure the patch applies cleanly using `git apply`.";

/// How many tree entries are shown in the edit agent's opening message.
pub const TREE_SKETCH_ENTRIES: usize = 50;

pub fn patch_user_prompt(task: &Task, hints: &[String]) -> String {
    let mut fields = vec![
        format!("Instance: {}", task.instance_id),
        format!("Repo: {}", task.repo),
    ];
    if let Some(title) = task.title.as_deref().filter(|t| !t.trim().is_empty()) {
        fields.push(format!("Title: {}", title.trim()));
    }
    fields.push(format!("Issue:\n{}", task.problem_statement.trim()));
    fields.push(
        "Instructions:\n\
         - Produce a single-file unified diff beginning with 'diff --git a/... b/...'.\n\
         - Use paths relative to the repository root, exactly as they appear in the repository.\n\
         - Include only changed hunks, with correct '@@' line ranges and 3 lines of context.\n\
         - Wrap the diff between a line BEGIN_PATCH and a line END_PATCH.\n\
         - Do not include analysis or commentary."
            .to_string(),
    );
    if !hints.is_empty() {
        fields.push(format!(
            "Repository likely files (paths):\n- {}",
            hints.join("\n- ")
        ));
    }
    fields.join("\n\n")
}

pub fn structural_correction(reason: &str) -> String {
    format!(
        "Your previous output was not a valid unified diff ({}). Reply again with ONLY a valid single-file unified diff between BEGIN_PATCH and END_PATCH.\n\
         Requirements: include 'diff --git', then '--- a/<path>' and '+++ b/<path>', at least one '@@' hunk, and each hunk line must start with space, '+' or '-'.",
        reason
    )
}

/// `stderr` is expected to be truncated already.
pub fn apply_correction(stderr: &str) -> String {
    format!(
        "Preflight apply failed on the repository. Use the following error to correct the diff, then respond again with ONLY the unified diff between BEGIN_PATCH and END_PATCH.\n\n{}",
        stderr
    )
}

pub fn edit_system_prompt(budget: &AgentBudget) -> String {
    format!(
        "You are editing a local repository to resolve a SWE-bench instance.\n\
         Do not write patches. Use tools to read and write files.\n\
         Tools: LIST_TREE, GREP, READ, WRITE.\n\
         - LIST_TREE {{\"limit\": 500}}: files with sizes.\n\
         - GREP {{\"pattern\": \"regex\", \"glob\": \"**/*.py\", \"max_hits\": 50}}: matching lines.\n\
         - READ {{\"path\": \"rel/path.py\", \"max_bytes\": 20000}}: file content.\n\
         - WRITE {{\"path\": \"rel/path.py\", \"content\": \"full new file content\"}}: replace a file.\n\
         Protocol: issue exactly one command per message, inside a fenced block labeled call containing JSON.\n\
         After each call, wait for a result block. When done, output exactly READY_FOR_DIFF.\n\
         Constraints: no network; keep changes minimal; prefer targeted edits; preserve formatting.\n\
         Budget: at most {} calls, about {}s per call, {}s in total.\n\n\
         Example call/result:\n\
         ```call\n{{\"tool\":\"LIST_TREE\",\"limit\":30}}\n```\n\
         ```result\n{{\"ok\":true,\"entries\":[{{\"path\":\"src/_pytest/assertion/rewrite.py\",\"bytes\":1234,\"ext\":\".py\"}}],\"truncated\":true}}\n```\n\
         Continue issuing call blocks until you are done, then output READY_FOR_DIFF.\n",
        budget.max_calls,
        budget.per_call.as_secs(),
        budget.wall_time.as_secs()
    )
}

pub fn edit_user_prompt(task: &Task, tree: &[TreeEntry], tree_limit: usize) -> String {
    let sketch = tree
        .iter()
        .take(TREE_SKETCH_ENTRIES)
        .map(|e| format!("- {} ({} bytes)", e.path, e.bytes))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Instance: {}\nRepo: {}\n\nTask:\n{}\n\nTree sketch (first ~{} files):\n{}\n\nUse the tools; do not output patches; end with READY_FOR_DIFF.",
        task.instance_id,
        task.repo,
        task.problem_statement.trim(),
        tree_limit,
        sketch
    )
}

/// A tool result (or nudge) as the model sees it.
pub fn result_block(json: &str) -> String {
    format!("```result\n{}\n```", json)
}

pub fn missing_call_nudge() -> String {
    result_block(
        r#"{"ok":false,"error":"No call block found. Use LIST_TREE/GREP/READ/WRITE and end with READY_FOR_DIFF."}"#,
    )
}

pub fn multiple_calls_nudge(count: usize) -> String {
    result_block(&format!(
        r#"{{"ok":false,"error":"Found {} call blocks. Issue exactly one call per message."}}"#,
        count
    ))
}
