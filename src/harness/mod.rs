//! The attempt harness: prompts, issue-text hints, the corrective patch
//! request, and the per-task attempt loop.

pub mod hints;
pub mod orchestrator;
pub mod patch;
pub mod prompts;

pub use hints::file_hints;
pub use orchestrator::{AttemptContext, AttemptSettings, Mode};
pub use patch::{CorrectionBudget, PatchOutcome, PatchRequest};
