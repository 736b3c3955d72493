//! Per-repository path rewrites for models that forget a source layout
//! (e.g. `src/_pytest/` written as `_pytest/`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rewrite paths starting with `from` to start with `to` instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    pub from: String,
    pub to: String,
}

impl PathRewrite {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    fn apply(&self, path: &str) -> Option<String> {
        if path.starts_with(&self.to) || !path.starts_with(&self.from) {
            return None;
        }
        Some(format!("{}{}", self.to, &path[self.from.len()..]))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathFixups {
    rules: HashMap<String, Vec<PathRewrite>>,
}

impl PathFixups {
    /// Known layouts from the benchmark's repositories.
    pub fn builtin() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            "pytest-dev/pytest".to_string(),
            vec![
                PathRewrite::new("_pytest/", "src/_pytest/"),
                PathRewrite::new("pytest/", "src/pytest/"),
            ],
        );
        rules.insert(
            "matplotlib/matplotlib".to_string(),
            vec![
                PathRewrite::new("matplotlib/", "lib/matplotlib/"),
                PathRewrite::new("mpl_toolkits/", "lib/mpl_toolkits/"),
            ],
        );
        Self { rules }
    }

    /// Add (or replace) the rules for each repository in `extra`.
    pub fn with_overrides(mut self, extra: HashMap<String, Vec<PathRewrite>>) -> Self {
        self.rules.extend(extra);
        self
    }

    pub fn rules_for(&self, repo: &str) -> &[PathRewrite] {
        self.rules.get(repo).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Rewrite a repo-relative path (no `a/` or `b/` prefix). First matching rule wins.
    pub fn rewrite_path(&self, repo: &str, path: &str) -> String {
        self.rules_for(repo)
            .iter()
            .find_map(|rule| rule.apply(path))
            .unwrap_or_else(|| path.to_string())
    }

    /// Rewrite the path tokens of `diff --git`, `--- ` and `+++ ` header lines.
    /// Hunk bodies are never touched.
    pub fn apply(&self, repo: &str, diff: &str) -> String {
        if self.rules_for(repo).is_empty() {
            return diff.to_string();
        }

        let mut in_header = true;
        let mut out: Vec<String> = Vec::new();
        for line in diff.lines() {
            if let Some(rest) = line.strip_prefix("diff --git ") {
                in_header = true;
                out.push(self.rewrite_git_header(repo, rest).unwrap_or_else(|| line.to_string()));
                continue;
            }
            if line.starts_with("@@") {
                in_header = false;
            }
            if in_header {
                if let Some(rest) = line.strip_prefix("--- ") {
                    out.push(format!("--- {}", self.rewrite_side(repo, rest, "a/")));
                    continue;
                }
                if let Some(rest) = line.strip_prefix("+++ ") {
                    out.push(format!("+++ {}", self.rewrite_side(repo, rest, "b/")));
                    continue;
                }
            }
            out.push(line.to_string());
        }

        let mut result = out.join("\n");
        if diff.ends_with('\n') {
            result.push('\n');
        }
        result
    }

    fn rewrite_git_header(&self, repo: &str, rest: &str) -> Option<String> {
        let (a, b) = super::normalize::parse_git_header(&format!("diff --git {}", rest))?;
        Some(format!(
            "diff --git a/{} b/{}",
            self.rewrite_path(repo, &a),
            self.rewrite_path(repo, &b)
        ))
    }

    fn rewrite_side(&self, repo: &str, token: &str, prefix: &str) -> String {
        match token.strip_prefix(prefix) {
            Some(path) => format!("{}{}", prefix, self.rewrite_path(repo, path)),
            None => token.to_string(),
        }
    }
}
