//! Mechanical repairs that turn a nearly-right diff into a single-file,
//! git-style unified diff.

use super::extract::{BEGIN_MARK, END_MARK};

const DEV_NULL: &str = "/dev/null";

/// Normalize a candidate diff. Empty input stays empty; any other output ends
/// with exactly one newline. Running it twice gives the same text.
pub fn normalize_diff(diff: &str) -> String {
    let stripped = strip_wrappers(diff);
    if stripped.is_empty() {
        return String::new();
    }

    let mut lines: Vec<String> = stripped.lines().map(str::to_string).collect();
    drop_leading_prose(&mut lines);
    synthesize_git_header(&mut lines);
    keep_first_section(&mut lines);
    synthesize_file_headers(&mut lines);

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Remove marker lines and code-fence lines, then trim blank lines at both
/// ends. Hunk lines never start with a backtick, so fence lines are safe to drop.
/// At the tail only truly empty lines go: `" "` is a blank context line.
pub fn strip_wrappers(text: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed != BEGIN_MARK && trimmed != END_MARK && !line.starts_with("```")
        })
        .collect();

    let first = kept.iter().position(|l| !l.trim().is_empty());
    let last = kept.iter().rposition(|l| !l.is_empty());
    match (first, last) {
        (Some(first), Some(last)) => kept[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// Drop chatter before the first header line, if there is a header at all.
fn drop_leading_prose(lines: &mut Vec<String>) {
    let start = lines.iter().enumerate().position(|(i, line)| {
        line.starts_with("diff --git ")
            || (line.starts_with("--- ")
                && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ ")))
    });
    if let Some(start) = start {
        lines.drain(..start);
    }
}

/// Build `diff --git a/X b/Y` from a leading `---`/`+++` pair when missing.
fn synthesize_git_header(lines: &mut Vec<String>) {
    if lines.iter().any(|l| l.starts_with("diff --git ")) {
        return;
    }
    let Some(old_idx) = lines.iter().enumerate().position(|(i, line)| {
        line.starts_with("--- ") && lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "))
    }) else {
        return;
    };

    let old = header_path(&lines[old_idx][4..]);
    let new = header_path(&lines[old_idx + 1][4..]);
    let (a, b) = match (old == DEV_NULL, new == DEV_NULL) {
        (true, _) => (new.clone(), new),
        (_, true) => (old.clone(), old),
        _ => (old, new),
    };
    lines.insert(old_idx, format!("diff --git a/{} b/{}", a, b));
}

/// Single-file policy: everything from the second `diff --git` on is dropped.
fn keep_first_section(lines: &mut Vec<String>) {
    if let Some(second) = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.starts_with("diff --git "))
        .nth(1)
        .map(|(i, _)| i)
    {
        lines.truncate(second);
    }
}

/// Make sure the section has `--- a/<path>` and `+++ b/<path>` lines before
/// its first hunk, derived from the `diff --git` header when absent.
fn synthesize_file_headers(lines: &mut Vec<String>) {
    let Some(header_idx) = lines.iter().position(|l| l.starts_with("diff --git ")) else {
        return;
    };
    let Some((a_path, b_path)) = parse_git_header(&lines[header_idx]) else {
        return;
    };

    let hunk_idx = lines
        .iter()
        .skip(header_idx)
        .position(|l| l.starts_with("@@"))
        .map(|i| i + header_idx)
        .unwrap_or(lines.len());
    let preamble = &lines[header_idx + 1..hunk_idx];
    let new_file = preamble.iter().any(|l| l.starts_with("new file mode"));
    let deleted = preamble.iter().any(|l| l.starts_with("deleted file mode"));

    let old_line = if new_file {
        format!("--- {}", DEV_NULL)
    } else {
        format!("--- a/{}", a_path)
    };
    let new_line = if deleted {
        format!("+++ {}", DEV_NULL)
    } else {
        format!("+++ b/{}", b_path)
    };

    let old_pos = (header_idx + 1..hunk_idx).find(|&i| lines[i].starts_with("--- "));
    let new_pos = (header_idx + 1..hunk_idx).find(|&i| lines[i].starts_with("+++ "));

    match (old_pos, new_pos) {
        (None, None) => {
            lines.insert(hunk_idx, new_line);
            lines.insert(hunk_idx, old_line);
        }
        (Some(old), None) => {
            lines[old] = with_prefix(&lines[old], "--- ", "a/");
            lines.insert(old + 1, new_line);
        }
        (None, Some(new)) => {
            lines[new] = with_prefix(&lines[new], "+++ ", "b/");
            lines.insert(new, old_line);
        }
        (Some(old), Some(new)) => {
            lines[old] = with_prefix(&lines[old], "--- ", "a/");
            lines[new] = with_prefix(&lines[new], "+++ ", "b/");
        }
    }
}

/// Re-add the `a/` or `b/` prefix git expects on a `---`/`+++` line.
fn with_prefix(line: &str, marker: &str, prefix: &str) -> String {
    let rest = &line[marker.len()..];
    let path = rest.split('\t').next().unwrap_or(rest).trim_end();
    if path == DEV_NULL || path.starts_with("a/") || path.starts_with("b/") {
        return line.to_string();
    }
    format!("{}{}{}", marker, prefix, path)
}

/// Path from a `---`/`+++` line: drop any timestamp suffix and `a/`/`b/` prefix.
fn header_path(raw: &str) -> String {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == DEV_NULL {
        return path.to_string();
    }
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
        .to_string()
}

/// Split `diff --git a/X b/Y` into `(X, Y)`.
pub(crate) fn parse_git_header(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("diff --git ")?;
    let rest = rest.strip_prefix("a/").unwrap_or(rest);
    let (a, b) = match rest.find(" b/") {
        Some(idx) => (&rest[..idx], &rest[idx + 3..]),
        None => rest.split_once(' ')?,
    };
    Some((a.trim().to_string(), b.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTION: &str = concat!(
        "diff --git a/pkg/parse.py b/pkg/parse.py\n",
        "--- a/pkg/parse.py\n",
        "+++ b/pkg/parse.py\n",
        "@@ -1,2 +1,2 @@\n",
        " def parse(items):\n",
        "-    return items[1:]\n",
        "+    return items[0:]\n",
    );

    #[test]
    fn test_normalize_empty_stays_empty() {
        assert_eq!(normalize_diff(""), "");
        assert_eq!(normalize_diff("\n\n"), "");
        assert_eq!(normalize_diff("```diff\n```"), "");
    }

    #[test]
    fn test_normalize_adds_trailing_newline_once() {
        let without = SECTION.trim_end_matches('\n');
        assert_eq!(normalize_diff(without), SECTION);
        assert_eq!(normalize_diff(SECTION), SECTION);
    }

    #[test]
    fn test_normalize_strips_fences_and_markers() {
        let wrapped = format!("BEGIN_PATCH\n```diff\n{}```\nEND_PATCH\n", SECTION);
        assert_eq!(normalize_diff(&wrapped), SECTION);
    }

    #[test]
    fn test_normalize_keeps_only_first_section() {
        let second = "diff --git a/other.py b/other.py\n--- a/other.py\n+++ b/other.py\n@@ -1 +1 @@\n-a\n+b\n";
        let combined = format!("{}{}", SECTION, second);
        assert_eq!(normalize_diff(&combined), SECTION);
    }

    #[test]
    fn test_normalize_synthesizes_git_header_from_file_lines() {
        let bare = SECTION
            .lines()
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(normalize_diff(&bare), SECTION);
    }

    #[test]
    fn test_normalize_synthesizes_file_lines_from_git_header() {
        let bare: Vec<&str> = SECTION
            .lines()
            .filter(|l| !l.starts_with("--- ") && !l.starts_with("+++ "))
            .collect();
        assert_eq!(normalize_diff(&bare.join("\n")), SECTION);
    }

    #[test]
    fn test_normalize_uses_dev_null_for_new_files() {
        let diff = "diff --git a/pkg/new.py b/pkg/new.py\nnew file mode 100644\n@@ -0,0 +1 @@\n+x = 1\n";
        let normalized = normalize_diff(diff);
        assert!(normalized.contains("--- /dev/null\n+++ b/pkg/new.py\n"));

        let bare = "--- /dev/null\n+++ b/pkg/new.py\n@@ -0,0 +1 @@\n+x = 1\n";
        assert!(normalize_diff(bare).starts_with("diff --git a/pkg/new.py b/pkg/new.py\n"));
    }

    #[test]
    fn test_normalize_adds_missing_path_prefixes() {
        let diff = "diff --git a/x.py b/x.py\n--- x.py\n+++ x.py\n@@ -1 +1 @@\n-a\n+b\n";
        let normalized = normalize_diff(diff);
        assert!(normalized.contains("--- a/x.py\n+++ b/x.py\n"), "{}", normalized);
    }

    #[test]
    fn test_normalize_drops_leading_prose() {
        let text = format!("Here is the fix:\n\n{}", SECTION);
        assert_eq!(normalize_diff(&text), SECTION);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            SECTION.to_string(),
            format!("```\n{}```", SECTION),
            "--- a/q.py\n+++ b/q.py\n@@ -1 +1 @@\n-a\n+b".to_string(),
            "not a diff at all".to_string(),
        ];
        for input in inputs {
            let once = normalize_diff(&input);
            assert_eq!(normalize_diff(&once), once);
        }
    }

    #[test]
    fn test_normalize_keeps_trailing_blank_context_line() {
        let diff = concat!(
            "diff --git a/t.py b/t.py\n",
            "--- a/t.py\n",
            "+++ b/t.py\n",
            "@@ -1,3 +1,3 @@\n",
            " a\n",
            "-b\n",
            "+B\n",
            " \n",
        );
        assert_eq!(normalize_diff(diff), diff);
        assert_eq!(normalize_diff(&format!("{}\n\n", diff)), diff);
        assert_eq!(normalize_diff(&format!("BEGIN_PATCH\n{}END_PATCH\n", diff)), diff);
    }

    #[test]
    fn test_normalized_workspace_diff_still_applies() {
        use crate::test_support::LocalRemote;
        use crate::workspace::WorkspaceProvider;

        let remote = LocalRemote::with_files(&[("widgets/table.py", "a = 1\nb = 2\nc = 3\n\nd = 4\n")]);
        let provider = remote.provider();

        let edited = provider.materialize("acme/widgets", None).unwrap();
        std::fs::write(
            edited.path().join("widgets/table.py"),
            "a = 10\nb = 2\nc = 3\n\nd = 4\n",
        )
        .unwrap();
        let exported = edited.diff_since_snapshot().unwrap();
        assert!(exported.ends_with(" c = 3\n \n"), "{:?}", exported);

        let normalized = normalize_diff(&exported);
        assert_eq!(normalized, exported);

        let fresh = provider.materialize("acme/widgets", None).unwrap();
        let check = fresh.check_apply(&normalized);
        assert!(check.ok, "{}", check.stderr);
    }

    #[test]
    fn test_parse_git_header() {
        assert_eq!(
            parse_git_header("diff --git a/src/a.py b/src/a.py"),
            Some(("src/a.py".to_string(), "src/a.py".to_string()))
        );
        assert_eq!(parse_git_header("--- a/x"), None);
    }
}
