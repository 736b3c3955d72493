use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Truncate to `max` characters, marking the cut with an ellipsis (Unicode-safe).
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Keep the first `max` characters verbatim, without any marker.
pub fn head_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug)]
pub struct CommandRunResult {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }
}

/// Run a command to completion, killing it once `timeout` elapses.
///
/// Output is drained on helper threads so a chatty child can never block on
/// a full pipe while we poll for exit.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("Failed to start command: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Failed to capture stdout".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Failed to capture stderr".to_string())?;

    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_end(&mut buf);
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        let mut reader = BufReader::new(stderr);
        let _ = reader.read_to_end(&mut buf);
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    match child.wait() {
                        Ok(status) => break Some(status),
                        Err(_) => break None,
                    }
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(format!("Failed to wait for command: {}", e)),
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandRunResult {
        status,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        timed_out,
    })
}

/// A path inside a sandbox root, in both absolute and root-relative form.
#[derive(Debug, Clone)]
pub struct ConfinedPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Resolve `candidate` against `root`, refusing anything that could land
/// outside it: absolute paths, `..` components, symlinked parents pointing
/// elsewhere, and the `.git` metadata entry. The target itself may not exist.
pub fn resolve_confined_path(root: &Path, candidate: &str) -> Result<ConfinedPath, String> {
    let candidate_path = Path::new(candidate);
    if candidate.trim().is_empty() {
        return Err("Path is empty".to_string());
    }
    if candidate_path.is_absolute() {
        return Err(format!("Absolute paths are not allowed: {}", candidate));
    }

    let mut relative = PathBuf::new();
    for component in candidate_path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => relative.push(part),
            Component::ParentDir => {
                return Err(format!("path escapes workspace: {}", candidate));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("Absolute paths are not allowed: {}", candidate));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(format!("Path does not name a file: {}", candidate));
    }
    if relative
        .components()
        .next()
        .is_some_and(|c| c.as_os_str() == ".git")
    {
        return Err(format!("Access to .git is not allowed: {}", candidate));
    }

    let root = root
        .canonicalize()
        .map_err(|e| format!("Failed to resolve workspace root: {}", e))?;
    let joined = root.join(&relative);
    let parent = joined
        .parent()
        .ok_or_else(|| format!("Invalid path: {}", candidate))?;
    let parent_canon = canonicalize_existing_parent(parent)?;
    if !parent_canon.starts_with(&root) {
        return Err(format!("path escapes workspace: {}", candidate));
    }
    if joined.exists() {
        let target = joined
            .canonicalize()
            .map_err(|e| format!("Failed to resolve path {}: {}", candidate, e))?;
        if !target.starts_with(&root) {
            return Err(format!("path escapes workspace: {}", candidate));
        }
    }

    Ok(ConfinedPath {
        absolute: joined,
        relative,
    })
}

fn canonicalize_existing_parent(path: &Path) -> Result<PathBuf, String> {
    let mut current = path.to_path_buf();
    while !current.exists() {
        if !current.pop() {
            return Err("Path has no existing parent".to_string());
        }
    }
    current
        .canonicalize()
        .map_err(|e| format!("Failed to resolve path {}: {}", current.display(), e))
}

/// Render a root-relative path with forward slashes regardless of platform.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
