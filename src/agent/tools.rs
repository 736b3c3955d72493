//! The four verbs the edit agent may call against its workspace.
//!
//! Every verb returns a structured [`ToolResult`]; failures (bad arguments,
//! sandbox violations, I/O errors) become `{"ok": false, "error": ...}` so the
//! conversation can carry on.

use crate::error::ToolError;
use crate::util::{head_chars, resolve_confined_path, slash_path};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use walkdir::WalkDir;

pub const TOOL_NAMES: [&str; 4] = ["LIST_TREE", "GREP", "READ", "WRITE"];

/// Longest line excerpt returned in a grep hit.
const GREP_TEXT_CHARS: usize = 240;

fn default_tree_limit() -> usize {
    500
}
fn default_pattern() -> String {
    ".".to_string()
}
fn default_glob() -> String {
    "**/*.py".to_string()
}
fn default_max_hits() -> usize {
    50
}
fn default_max_bytes() -> usize {
    20_000
}
fn default_encoding() -> String {
    "utf-8".to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
//  CALLS AND RESULTS
// ═══════════════════════════════════════════════════════════════════════════

/// A parsed `{"tool": ..., ...args}` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "tool")]
pub enum ToolCall {
    #[serde(rename = "LIST_TREE")]
    ListTree {
        #[serde(default = "default_tree_limit")]
        limit: usize,
    },
    #[serde(rename = "GREP")]
    Grep {
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_glob")]
        glob: String,
        #[serde(default = "default_max_hits")]
        max_hits: usize,
    },
    #[serde(rename = "READ")]
    Read {
        path: String,
        #[serde(default = "default_max_bytes")]
        max_bytes: usize,
    },
    #[serde(rename = "WRITE")]
    Write {
        path: String,
        content: String,
        #[serde(default = "default_encoding")]
        encoding: String,
    },
}

impl ToolCall {
    /// Parse a call object. Tool names are matched case-insensitively.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ToolError> {
        let name = value
            .get("tool")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'tool' field".to_string()))?
            .to_ascii_uppercase();
        if !TOOL_NAMES.contains(&name.as_str()) {
            return Err(ToolError::InvalidArguments(format!("unknown tool: {}", name)));
        }

        let mut normalized = value.clone();
        if let Some(obj) = normalized.as_object_mut() {
            obj.insert("tool".to_string(), serde_json::Value::String(name));
        }
        serde_json::from_value(normalized).map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ListTree { .. } => "LIST_TREE",
            ToolCall::Grep { .. } => "GREP",
            ToolCall::Read { .. } => "READ",
            ToolCall::Write { .. } => "WRITE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub bytes: u64,
    pub ext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepHit {
    pub path: String,
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Tree {
        entries: Vec<TreeEntry>,
        truncated: bool,
    },
    Grep {
        hits: Vec<GrepHit>,
        truncated: bool,
    },
    Read {
        content: String,
        truncated: bool,
        encoding: &'static str,
    },
    Write {
        bytes: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(flatten)]
    pub output: Option<ToolOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_s: f64,
}

impl ToolResult {
    pub fn success(output: ToolOutput) -> Self {
        Self {
            ok: true,
            output: Some(output),
            error: None,
            duration_s: 0.0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error.into()),
            duration_s: 0.0,
        }
    }

    fn timed(mut self, start: Instant) -> Self {
        self.duration_s = (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"ok":false,"error":"unserializable result: {}"}}"#, e))
    }
}

/// Parse and run one call object against `root`.
pub fn execute(root: &Path, call: &serde_json::Value) -> ToolResult {
    let start = Instant::now();
    let result = match ToolCall::from_value(call).and_then(|call| run(root, &call)) {
        Ok(output) => ToolResult::success(output),
        Err(err) => ToolResult::failure(err.to_string()),
    };
    result.timed(start)
}

pub fn run(root: &Path, call: &ToolCall) -> Result<ToolOutput, ToolError> {
    match call {
        ToolCall::ListTree { limit } => list_tree(root, *limit),
        ToolCall::Grep {
            pattern,
            glob,
            max_hits,
        } => grep(root, pattern, glob, *max_hits),
        ToolCall::Read { path, max_bytes } => read(root, path, *max_bytes),
        ToolCall::Write {
            path,
            content,
            encoding,
        } => write(root, path, content, encoding),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  LIST_TREE / GREP
// ═══════════════════════════════════════════════════════════════════════════

/// Files under `root` in sorted order, never descending into `.git`.
fn walk_files(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
}

fn relative(root: &Path, path: &Path) -> String {
    slash_path(path.strip_prefix(root).unwrap_or(path))
}

pub fn list_tree(root: &Path, limit: usize) -> Result<ToolOutput, ToolError> {
    let mut entries = Vec::new();
    let mut truncated = false;
    for entry in walk_files(root) {
        if entries.len() >= limit {
            truncated = true;
            break;
        }
        let path = entry.path();
        let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        entries.push(TreeEntry {
            path: relative(root, path),
            bytes,
            ext,
        });
    }
    Ok(ToolOutput::Tree { entries, truncated })
}

pub fn grep(root: &Path, pattern: &str, glob: &str, max_hits: usize) -> Result<ToolOutput, ToolError> {
    let regex = regex::Regex::new(pattern).map_err(|e| ToolError::InvalidRegex(e.to_string()))?;
    let glob = glob::Pattern::new(glob).map_err(|e| ToolError::InvalidGlob(e.to_string()))?;

    let mut hits = Vec::new();
    for entry in walk_files(root) {
        let rel = relative(root, entry.path());
        if !glob.matches(&rel) {
            continue;
        }
        let Ok(bytes) = fs::read(entry.path()) else {
            continue;
        };
        let text = String::from_utf8_lossy(&bytes);
        for (idx, line) in text.lines().enumerate() {
            if !regex.is_match(line) {
                continue;
            }
            if hits.len() >= max_hits {
                return Ok(ToolOutput::Grep {
                    hits,
                    truncated: true,
                });
            }
            hits.push(GrepHit {
                path: rel.clone(),
                line: idx + 1,
                text: head_chars(line.trim(), GREP_TEXT_CHARS).to_string(),
            });
        }
    }
    Ok(ToolOutput::Grep {
        hits,
        truncated: false,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  READ / WRITE
// ═══════════════════════════════════════════════════════════════════════════

pub fn read(root: &Path, path: &str, max_bytes: usize) -> Result<ToolOutput, ToolError> {
    let target = resolve_confined_path(root, path).map_err(ToolError::SandboxViolation)?;
    let data = fs::read(&target.absolute)
        .map_err(|e| ToolError::Io(format!("failed to read {}: {}", path, e)))?;
    let end = data.len().min(max_bytes);
    Ok(ToolOutput::Read {
        content: String::from_utf8_lossy(&data[..end]).into_owned(),
        truncated: data.len() > max_bytes,
        encoding: "utf-8",
    })
}

/// Create or replace a file via a sibling temp file and an atomic rename.
pub fn write(root: &Path, path: &str, content: &str, encoding: &str) -> Result<ToolOutput, ToolError> {
    if !matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8") {
        return Err(ToolError::UnsupportedEncoding(encoding.to_string()));
    }
    let target = resolve_confined_path(root, path).map_err(ToolError::SandboxViolation)?;
    let parent = target
        .absolute
        .parent()
        .ok_or_else(|| ToolError::SandboxViolation(format!("invalid path: {}", path)))?;
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = fs::metadata(&target.absolute) {
        // Keep the executable bit of files we overwrite.
        fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(&target.absolute)
        .map_err(|e| ToolError::Io(format!("failed to write {}: {}", path, e.error)))?;

    Ok(ToolOutput::Write {
        bytes: content.len(),
    })
}
