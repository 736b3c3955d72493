//! File-path hints mined from an issue's text, checked against the
//! repository's tracked files when a listing is available.

use crate::diff::PathFixups;
use crate::task::Task;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

pub const MAX_HINTS: usize = 2;
const MIN_KEYWORD_CHARS: usize = 4;
const HINT_EXTENSIONS: [&str; 8] = ["py", "pyi", "pyx", "rst", "cfg", "toml", "ini", "txt"];

static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9_.\-/]*/[A-Za-z0-9_.\-]+\.(?:py|pyi|pyx|rst|cfg|toml|ini|txt)\b")
        .expect("path regex")
});

static MODULE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)+\b").expect("module regex")
});

/// Top-level package names a repository's modules are likely rooted at.
fn package_roots(repo: &str) -> Vec<String> {
    let name = repo.rsplit('/').next().unwrap_or(repo).to_ascii_lowercase();
    let base = match name.as_str() {
        "scikit-learn" => "sklearn".to_string(),
        other => other.replace('-', "_"),
    };
    vec![base.clone(), format!("_{}", base)]
}

/// Up to [`MAX_HINTS`] repo-relative paths for the task, rewritten through
/// `fixups`.
///
/// Paths and module names mentioned in the title or problem text come first,
/// in order of mention. With a non-empty `repo_files` listing, mentions that
/// match no tracked file are dropped and any remaining slots go to files whose
/// name matches a word of the issue text.
pub fn file_hints(task: &Task, fixups: &PathFixups, repo_files: &[String]) -> Vec<String> {
    let text = match task.title.as_deref() {
        Some(title) => format!("{}\n{}", title, task.problem_statement),
        None => task.problem_statement.clone(),
    };
    let mentioned = mentioned_paths(&text, task, fixups);
    if repo_files.is_empty() {
        return mentioned.into_iter().take(MAX_HINTS).collect();
    }

    let mut hints: Vec<String> = Vec::new();
    let located = mentioned
        .iter()
        .filter_map(|path| locate(path, repo_files))
        .chain(keyword_matches(&text, repo_files));
    for path in located {
        if hints.len() >= MAX_HINTS {
            break;
        }
        if !hints.iter().any(|h| h == path) {
            hints.push(path.to_string());
        }
    }
    hints
}

/// Every distinct path mentioned in `text`, in order of first mention.
fn mentioned_paths(text: &str, task: &Task, fixups: &PathFixups) -> Vec<String> {
    let roots = package_roots(&task.repo);

    let mut found: Vec<(usize, String)> = Vec::new();
    for m in PATH_RE.find_iter(text) {
        if let Some(path) = clean_path(m.as_str(), &roots) {
            found.push((m.start(), path));
        }
    }
    for m in MODULE_RE.find_iter(text) {
        if let Some(path) = module_to_path(m.as_str(), &roots) {
            found.push((m.start(), path));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut paths: Vec<String> = Vec::new();
    for (_, path) in found {
        let path = fixups.rewrite_path(&task.repo, &path);
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// The tracked file `path` refers to: an exact match, or the only file that
/// ends with `/<path>` (a package moved under `src/`, say).
fn locate<'a>(path: &str, repo_files: &'a [String]) -> Option<&'a str> {
    if let Some(exact) = repo_files.iter().find(|f| *f == path) {
        return Some(exact.as_str());
    }
    let suffix = format!("/{}", path);
    let mut matches = repo_files.iter().filter(|f| f.ends_with(&suffix));
    match (matches.next(), matches.next()) {
        (Some(only), None) => Some(only.as_str()),
        _ => None,
    }
}

/// Hintable files whose stem is a word of `text`, best first. Directory
/// names that are also words add to the score.
fn keyword_matches<'a>(text: &str, repo_files: &'a [String]) -> Vec<&'a str> {
    let words: HashSet<String> = text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| w.len() >= MIN_KEYWORD_CHARS)
        .map(str::to_ascii_lowercase)
        .collect();

    let mut scored: Vec<(usize, &str)> = repo_files
        .iter()
        .filter_map(|file| {
            let (dirs, name) = match file.rsplit_once('/') {
                Some((dirs, name)) => (dirs, name),
                None => ("", file.as_str()),
            };
            let (stem, ext) = name.rsplit_once('.')?;
            if !HINT_EXTENSIONS.contains(&ext) || !words.contains(&stem.to_ascii_lowercase()) {
                return None;
            }
            let dir_hits = dirs
                .split('/')
                .filter(|d| words.contains(&d.to_ascii_lowercase()))
                .count();
            Some((1 + dir_hits, file.as_str()))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.len().cmp(&b.1.len())).then(a.1.cmp(b.1)));
    scored.into_iter().map(|(_, file)| file).collect()
}

/// Strip diff prefixes and installation directories (tracebacks often show
/// `/usr/lib/python3/site-packages/<pkg>/...`).
fn clean_path(raw: &str, roots: &[String]) -> Option<String> {
    let mut path = raw.trim_start_matches("./");
    for prefix in ["a/", "b/"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            path = rest;
        }
    }
    if path.starts_with('/') || path.contains("site-packages/") {
        let parts: Vec<&str> = path.split('/').collect();
        let root_idx = parts.iter().position(|p| roots.iter().any(|r| r == p))?;
        return Some(parts[root_idx..].join("/"));
    }
    if path.split('/').any(|p| p == "..") || path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

/// `pkg.sub.mod.Class` -> `pkg/sub/mod.py`; only for the repository's own package.
fn module_to_path(dotted: &str, roots: &[String]) -> Option<String> {
    let parts: Vec<&str> = dotted.split('.').collect();
    if !roots.iter().any(|r| r == parts[0]) {
        return None;
    }
    let module: Vec<&str> = parts
        .iter()
        .take_while(|p| !p.starts_with(|c: char| c.is_ascii_uppercase()))
        .copied()
        .collect();
    if module.len() < 2 || module.last().is_some_and(|p| *p == "py") {
        return None;
    }
    Some(format!("{}.py", module.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{LocalRemote, PARSE_PY};
    use crate::workspace::WorkspaceProvider;

    fn task(repo: &str, text: &str) -> Task {
        Task::new("t1", repo, text)
    }

    #[test]
    fn test_hints_from_paths_and_modules_in_order() {
        let t = task(
            "acme/widgets",
            "Calling widgets.parse.Parser drops an item; see also widgets/io/reader.py and widgets/extra.py.",
        );
        let hints = file_hints(&t, &PathFixups::default(), &[]);
        assert_eq!(hints, vec!["widgets/parse.py", "widgets/io/reader.py"]);
    }

    #[test]
    fn test_hints_ignore_foreign_modules_and_dedupe() {
        let t = task(
            "acme/widgets",
            "os.path.join fails in widgets/parse.py (widgets/parse.py line 3)",
        );
        let hints = file_hints(&t, &PathFixups::default(), &[]);
        assert_eq!(hints, vec!["widgets/parse.py"]);
    }

    #[test]
    fn test_hints_trim_install_prefixes_and_apply_fixups() {
        let t = task(
            "pytest-dev/pytest",
            "Traceback: /usr/lib/python3.9/site-packages/_pytest/python.py line 10 in _pytest.fixtures.FixtureDef",
        );
        let hints = file_hints(&t, &PathFixups::builtin(), &[]);
        assert_eq!(hints, vec!["src/_pytest/python.py", "src/_pytest/fixtures.py"]);
    }

    #[test]
    fn test_listing_drops_unknown_and_relocates_moved_paths() {
        let files: Vec<String> = ["src/widgets/parse.py", "src/widgets/io.py", "README.rst"]
            .iter()
            .map(|f| f.to_string())
            .collect();
        let t = task(
            "acme/widgets",
            "widgets.legacy.Loader is gone, and widgets/parse.py mangles input.",
        );
        let hints = file_hints(&t, &PathFixups::default(), &files);
        assert_eq!(hints, vec!["src/widgets/parse.py"]);
    }

    #[test]
    fn test_listing_fills_slots_from_issue_words() {
        let files: Vec<String> = [
            "widgets/parse.py",
            "widgets/render.py",
            "tests/test_parse.py",
            "docs/render.rst",
        ]
        .iter()
        .map(|f| f.to_string())
        .collect();
        let t = task(
            "acme/widgets",
            "The widgets parse step drops the first item before render sees it.",
        );
        let hints = file_hints(&t, &PathFixups::default(), &files);
        assert_eq!(hints, vec!["widgets/parse.py", "widgets/render.py"]);
    }

    #[test]
    fn test_hints_grounded_in_mirror_listing() {
        let remote = LocalRemote::with_files(&[
            ("widgets/parse.py", PARSE_PY),
            ("widgets/__init__.py", ""),
        ]);
        let files = remote.provider().list_files("acme/widgets").unwrap();
        let t = task(
            "acme/widgets",
            "widgets/reader.py is missing, and parse() in widgets.parse drops an item.",
        );
        let hints = file_hints(&t, &PathFixups::builtin(), &files);
        assert_eq!(hints, vec!["widgets/parse.py"]);
    }

    #[test]
    fn test_no_hints_from_plain_prose() {
        let t = task("acme/widgets", "The parser is broken. Please fix it.");
        assert!(file_hints(&t, &PathFixups::builtin(), &[]).is_empty());
    }
}
