//! Structural checks a unified diff must pass before we bother applying it.

use crate::error::StructuralDiffError;
use crate::util::truncate;

/// The `diff --git` header must appear within this many leading lines.
pub const HEADER_WINDOW: usize = 5;

/// How far past the `diff --git` line the `--- ` line may sit (index/mode lines).
const OLD_FILE_WINDOW: usize = 6;

const QUOTED_LINE_CHARS: usize = 80;

/// Check that `diff` is a well-formed git-style unified diff.
///
/// Each file section needs a `diff --git` line, a `--- ` line shortly after
/// it, a `+++ ` line directly after that, and at least one `@@` hunk whose
/// body lines all start with ' ', '+', '-' (or are a "\ No newline" marker).
pub fn validate_diff(diff: &str) -> Result<(), StructuralDiffError> {
    if diff.trim().is_empty() {
        return Err(StructuralDiffError::Empty);
    }
    let lines: Vec<&str> = diff.lines().collect();

    let mut header = lines
        .iter()
        .take(HEADER_WINDOW)
        .position(|line| is_git_header(line))
        .ok_or(StructuralDiffError::MissingGitHeader {
            window: HEADER_WINDOW,
        })?;

    loop {
        let body_start = check_file_headers(&lines, header)?;
        match check_hunks(&lines, body_start)? {
            Some(next) => header = next,
            None => return Ok(()),
        }
    }
}

fn is_git_header(line: &str) -> bool {
    line.starts_with("diff --git ")
}

/// Returns the index of the first line after the `+++ ` line.
fn check_file_headers(lines: &[&str], header: usize) -> Result<usize, StructuralDiffError> {
    let window_end = (header + 1 + OLD_FILE_WINDOW).min(lines.len());
    let old = (header + 1..window_end)
        .take_while(|&i| !lines[i].starts_with("@@") && !is_git_header(lines[i]))
        .find(|&i| lines[i].starts_with("--- "))
        .ok_or(StructuralDiffError::MissingOldFile { line: header + 1 })?;

    match lines.get(old + 1) {
        Some(line) if line.starts_with("+++ ") => Ok(old + 2),
        _ => Err(StructuralDiffError::MissingNewFile { line: old + 1 }),
    }
}

/// Walks the hunks of one file section. Returns the index of the next
/// `diff --git` line, if any.
fn check_hunks(lines: &[&str], start: usize) -> Result<Option<usize>, StructuralDiffError> {
    match lines.get(start) {
        None => return Err(StructuralDiffError::NoHunks),
        Some(line) if is_git_header(line) => return Err(StructuralDiffError::NoHunks),
        Some(line) if !line.starts_with("@@") => {
            return Err(StructuralDiffError::ContentBeforeHunk {
                line: start + 1,
                text: truncate(line, QUOTED_LINE_CHARS),
            });
        }
        Some(_) => {}
    }

    for (i, line) in lines.iter().enumerate().skip(start + 1) {
        if is_git_header(line) {
            return Ok(Some(i));
        }
        let ok = line.starts_with("@@")
            || line.starts_with(' ')
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with("\\ No newline");
        if !ok {
            return Err(StructuralDiffError::BadHunkLine {
                line: i + 1,
                text: truncate(line, QUOTED_LINE_CHARS),
            });
        }
    }
    Ok(None)
}
