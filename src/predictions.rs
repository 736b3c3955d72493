//! Offline tools over predictions files: well-formedness checks, patch
//! sanitizing, and empty-patch baselines.

use crate::batch::{absolute, RunManifest, RunPaths};
use crate::diff::{looks_like_diff, BEGIN_MARK, END_MARK};
use crate::records::JsonlLog;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const REQUIRED_FIELDS: [&str; 3] = ["instance_id", "model_name_or_path", "model_patch"];

static DIFF_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:diff|patch)?\n(.*?)```").expect("fence regex"));

/// Problems found in a predictions file, one message per problem.
pub fn validate_predictions(text: &str) -> Vec<String> {
    let mut issues = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                issues.push(format!("Line {}: invalid JSON: {}", line_no, err));
                continue;
            }
        };
        for key in REQUIRED_FIELDS {
            if value.get(key).is_none() {
                issues.push(format!("Line {}: missing field '{}'", line_no, key));
            }
        }
        let patch = value.get("model_patch").and_then(Value::as_str).unwrap_or("");
        if !patch.is_empty() && !looks_like_diff(patch) {
            issues.push(format!(
                "Line {}: model_patch does not look like a unified diff",
                line_no
            ));
        }
    }
    issues
}

pub fn validate_predictions_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read predictions '{}'", path.display()))?;
    Ok(validate_predictions(&text))
}

/// Strip code fences and patch markers a model left around a diff.
pub fn sanitize_patch(patch: &str) -> String {
    let mut text = patch.trim().to_string();
    if let Some(body) = DIFF_FENCE_RE.captures(&text).and_then(|c| c.get(1)) {
        text = body.as_str().trim().to_string();
    }
    if let Some((_, rest)) = text.split_once(BEGIN_MARK) {
        if let Some((body, _)) = rest.split_once(END_MARK) {
            text = body.trim().to_string();
        }
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped.trim_end().to_string();
    }
    let lines: Vec<&str> = text
        .lines()
        .filter(|line| !matches!(line.trim(), BEGIN_MARK | END_MARK))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeReport {
    pub output: PathBuf,
    pub changed: usize,
    pub total: usize,
}

/// `preds.jsonl` -> `preds.sanitized.jsonl` next to it.
pub fn default_sanitized_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "predictions".to_string());
    input.with_file_name(format!("{}.sanitized.jsonl", stem))
}

/// Rewrite every row's `model_patch` through [`sanitize_patch`], keeping
/// all other fields as they are.
pub fn sanitize_file(input: &Path, output: Option<&Path>) -> Result<SanitizeReport> {
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_sanitized_path(input));
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read predictions '{}'", input.display()))?;

    let mut rows = Vec::new();
    let mut changed = 0;
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut value: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", input.display(), idx + 1))?;
        let original = value
            .get("model_patch")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let cleaned = sanitize_patch(&original);
        if cleaned != original {
            changed += 1;
        }
        if let Some(obj) = value.as_object_mut() {
            obj.insert("model_patch".to_string(), Value::String(cleaned));
        }
        rows.push(serde_json::to_string(&value)?);
    }

    let mut file = std::fs::File::create(&output)
        .with_context(|| format!("Failed to create '{}'", output.display()))?;
    for row in &rows {
        writeln!(file, "{}", row)?;
    }
    Ok(SanitizeReport {
        output,
        changed,
        total: rows.len(),
    })
}

#[derive(Debug, Serialize)]
struct BaselineRow<'a> {
    instance_id: &'a str,
    model_name_or_path: &'a str,
    model_patch: &'a str,
    /// Some evaluators read `patch` instead of `model_patch`.
    patch: &'a str,
}

/// Write an empty-patch prediction for every id plus a manifest.
pub fn write_baseline(
    instance_ids: &[String],
    instances_path: &Path,
    paths: &RunPaths,
    run_id: &str,
    model_name: &str,
) -> Result<()> {
    let log = JsonlLog::create(&paths.predictions)?;
    for instance_id in instance_ids {
        log.write(&BaselineRow {
            instance_id,
            model_name_or_path: model_name,
            model_patch: "",
            patch: "",
        })?;
    }

    let mut manifest = RunManifest::new(run_id, &paths.predictions);
    manifest.instances_path = Some(absolute(instances_path));
    manifest.model_name_or_path = Some(model_name.to_string());
    manifest.note = Some("Baseline run with empty patches for all instances.".to_string());
    manifest.write(&paths.manifest)?;

    tracing::info!(
        count = instance_ids.len(),
        predictions = %paths.predictions.display(),
        "baseline written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "diff --git a/x.py b/x.py\n--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";

    #[test]
    fn test_validate_reports_each_problem_with_line_number() {
        let good = serde_json::json!({
            "instance_id": "t1", "model_name_or_path": "p:m", "model_patch": DIFF
        });
        let empty = serde_json::json!({
            "instance_id": "t2", "model_name_or_path": "p:m", "model_patch": ""
        });
        let prose = serde_json::json!({
            "instance_id": "t3", "model_name_or_path": "p:m", "model_patch": "I changed x.py"
        });
        let text = format!(
            "{}\n{}\n\n{{not json\n{{\"instance_id\":\"t4\"}}\n{}\n",
            good, empty, prose
        );

        let issues = validate_predictions(&text);
        assert_eq!(issues.len(), 4, "{:?}", issues);
        assert!(issues[0].starts_with("Line 4: invalid JSON"));
        assert_eq!(issues[1], "Line 5: missing field 'model_name_or_path'");
        assert_eq!(issues[2], "Line 5: missing field 'model_patch'");
        assert_eq!(issues[3], "Line 6: model_patch does not look like a unified diff");
    }

    #[test]
    fn test_sanitize_strips_fences_and_markers() {
        assert_eq!(sanitize_patch(&format!("```diff\n{}```", DIFF)), DIFF);
        assert_eq!(sanitize_patch(&format!("BEGIN_PATCH\n{}END_PATCH\n", DIFF)), DIFF);
        assert_eq!(sanitize_patch(&format!("{}```", DIFF)), DIFF);
        assert_eq!(sanitize_patch(&format!("BEGIN_PATCH\n{}", DIFF)), DIFF);
        assert_eq!(sanitize_patch(DIFF), DIFF);
        assert_eq!(sanitize_patch(""), "");
    }

    #[test]
    fn test_sanitize_file_counts_changes_and_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("preds.jsonl");
        let rows = [
            serde_json::json!({"instance_id": "t1", "model_name_or_path": "p:m", "model_patch": DIFF, "status": "ok"}),
            serde_json::json!({"instance_id": "t2", "model_name_or_path": "p:m", "model_patch": format!("```diff\n{}```", DIFF)}),
        ];
        let text: String = rows.iter().map(|r| format!("{}\n", r)).collect();
        std::fs::write(&input, text).unwrap();

        let report = sanitize_file(&input, None).unwrap();
        assert_eq!(report.output, dir.path().join("preds.sanitized.jsonl"));
        assert_eq!((report.changed, report.total), (1, 2));

        let out = std::fs::read_to_string(&report.output).unwrap();
        let values: Vec<Value> = out.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(values[0]["status"], "ok");
        assert_eq!(values[1]["model_patch"], DIFF);
    }

    #[test]
    fn test_baseline_writes_empty_patches_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RunPaths::new(dir.path(), "baseline-1");
        let ids = vec!["t1".to_string(), "t2".to_string()];

        write_baseline(&ids, Path::new("instances.jsonl"), &paths, "baseline-1", "baseline_no_patch")
            .unwrap();

        let preds = std::fs::read_to_string(&paths.predictions).unwrap();
        assert!(validate_predictions(&preds).is_empty());
        let first: Value = serde_json::from_str(preds.lines().next().unwrap()).unwrap();
        assert_eq!(first["model_patch"], "");
        assert_eq!(first["patch"], "");

        let manifest: Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.manifest).unwrap()).unwrap();
        assert_eq!(manifest["model_name_or_path"], "baseline_no_patch");
        assert!(manifest["note"].as_str().unwrap().starts_with("Baseline run"));
    }
}
