//! Diff repair pipeline: extract -> validate -> normalize -> path fixup,
//! with an optional preflight apply against a real checkout.

pub mod extract;
pub mod fixup;
pub mod normalize;
pub mod preflight;
pub mod validate;

pub use extract::{extract_diff, looks_like_diff, BEGIN_MARK, END_MARK};
pub use fixup::{PathFixups, PathRewrite};
pub use normalize::{normalize_diff, strip_wrappers};
pub use preflight::{preflight_apply, FEEDBACK_CHARS};
pub use validate::validate_diff;

use crate::error::StructuralDiffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Validity {
    Unvalidated,
    StructurallyValid,
    ApplyConfirmed,
}

/// Diff text tagged with how far through the pipeline it has made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDiff {
    text: String,
    validity: Validity,
}

impl CandidateDiff {
    /// Extract a candidate from raw model output. May be empty.
    pub fn from_model_output(raw: &str) -> Self {
        Self::from_text(extract_diff(raw))
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            validity: Validity::Unvalidated,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Normalize and apply the repository's path fixups. The tag survives
    /// only if the text comes out unchanged.
    pub fn repaired(self, repo: &str, fixups: &PathFixups) -> Self {
        let text = fixups.apply(repo, &normalize_diff(&self.text));
        if text == self.text {
            return self;
        }
        Self::from_text(text)
    }

    /// Structural check. An apply-confirmed candidate is not re-checked.
    pub fn validate(&mut self) -> Result<(), StructuralDiffError> {
        if self.validity >= Validity::StructurallyValid {
            return Ok(());
        }
        validate_diff(&self.text)?;
        self.validity = Validity::StructurallyValid;
        Ok(())
    }

    pub fn confirm_applied(&mut self) {
        self.validity = Validity::ApplyConfirmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = concat!(
        "diff --git a/widgets/parse.py b/widgets/parse.py\n",
        "--- a/widgets/parse.py\n",
        "+++ b/widgets/parse.py\n",
        "@@ -1,2 +1,2 @@\n",
        " def parse(items):\n",
        "-    return items[1:]\n",
        "+    return items[0:]\n",
    );

    fn pipeline(raw: &str) -> (String, Result<(), StructuralDiffError>) {
        let mut candidate =
            CandidateDiff::from_model_output(raw).repaired("acme/widgets", &PathFixups::builtin());
        let verdict = candidate.validate();
        (candidate.into_text(), verdict)
    }

    #[test]
    fn test_marker_and_fence_wrapping_round_trips() {
        let body = DIFF.trim_end();
        for wrapped in [
            format!("BEGIN_PATCH\n{}\nEND_PATCH", body),
            format!("Here you go:\n```diff\n{}\n```\nDone.", body),
        ] {
            assert_eq!(extract_diff(&wrapped), body);
        }
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let inputs = [
            format!("BEGIN_PATCH\n{}END_PATCH", DIFF),
            format!("```\n{}```", DIFF.replace("diff --git a/widgets/parse.py b/widgets/parse.py\n", "")),
            "just some prose".to_string(),
            format!("{}diff --git a/b b/b\n--- a/b\n+++ b/b\n@@ -1 +1 @@\n-x\n+y\n", DIFF),
        ];
        for input in inputs {
            let (first_text, first_verdict) = pipeline(&input);
            let (second_text, second_verdict) = pipeline(&first_text);
            assert_eq!(first_text, second_text);
            assert_eq!(first_verdict, second_verdict);
        }
    }

    #[test]
    fn test_pipeline_outputs_clean_diff() {
        let (text, verdict) = pipeline(&format!("BEGIN_PATCH\n{}END_PATCH\n", DIFF));
        assert_eq!(verdict, Ok(()));
        assert_eq!(text, DIFF);
    }

    #[test]
    fn test_validity_tag_progression() {
        let mut candidate = CandidateDiff::from_text(DIFF);
        assert_eq!(candidate.validity(), Validity::Unvalidated);
        candidate.validate().unwrap();
        assert_eq!(candidate.validity(), Validity::StructurallyValid);
        candidate.confirm_applied();

        let candidate = candidate.repaired("acme/widgets", &PathFixups::builtin());
        assert_eq!(candidate.validity(), Validity::ApplyConfirmed);

        let changed = CandidateDiff::from_text(DIFF.trim_end()).repaired("acme/widgets", &PathFixups::builtin());
        assert_eq!(changed.validity(), Validity::Unvalidated);
    }
}
