use crate::util::head_chars;
use crate::workspace::{ApplyCheck, WorkspaceProvider};

/// Cap on apply stderr echoed back to the model.
pub const FEEDBACK_CHARS: usize = 800;

/// Dry-run `diff` against a fresh checkout of `repo` at `revision`.
///
/// Advisory only: failures to set up the checkout are reported the same way as
/// a failed apply, so the caller can decide whether to re-prompt.
pub fn preflight_apply(
    provider: &dyn WorkspaceProvider,
    repo: &str,
    revision: Option<&str>,
    diff: &str,
) -> ApplyCheck {
    let check = match provider.materialize(repo, revision) {
        Ok(workspace) => workspace.check_apply(diff),
        Err(err) => ApplyCheck {
            ok: false,
            stderr: format!("preflight: workspace setup failed: {:#}", err),
        },
    };
    ApplyCheck {
        ok: check.ok,
        stderr: head_chars(&check.stderr, FEEDBACK_CHARS).to_string(),
    }
}
