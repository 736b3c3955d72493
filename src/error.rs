//! Typed errors for the places where callers branch on the failure kind.
//!
//! Everything else flows through `anyhow` with context attached at the I/O
//! boundary.

use thiserror::Error;

/// Failure talking to a chat-completion endpoint. Aborts the current attempt only.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid JSON from provider: {message}; raw={preview}")]
    InvalidJson { message: String, preview: String },

    #[error("unexpected provider response (no choices[0].message.content): {preview}")]
    MissingContent { preview: String },
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// Why a candidate diff failed structural validation. The `Display` text is
/// quoted back to the model verbatim in the corrective re-prompt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralDiffError {
    #[error("empty diff")]
    Empty,

    #[error("missing 'diff --git' header in the first {window} lines")]
    MissingGitHeader { window: usize },

    #[error("missing '--- a/<path>' line after 'diff --git' header (line {line})")]
    MissingOldFile { line: usize },

    #[error("missing '+++ b/<path>' line after '---' line (line {line})")]
    MissingNewFile { line: usize },

    #[error("no '@@' hunk header found")]
    NoHunks,

    #[error("unexpected content before the first '@@' hunk (line {line}): {text}")]
    ContentBeforeHunk { line: usize, text: String },

    #[error("hunk line {line} does not start with ' ', '+' or '-': {text}")]
    BadHunkLine { line: usize, text: String },
}

/// A tool call that could not be carried out. Surfaced to the model as
/// `{"ok": false, "error": ...}`; the agent loop keeps going.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("{0}")]
    SandboxViolation(String),

    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    #[error("invalid glob: {0}")]
    InvalidGlob(String),

    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::Io(err.to_string())
    }
}

/// Task input problems. These are hard failures raised before any work starts.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("line {line}: invalid JSON: {message}")]
    InvalidLine { line: usize, message: String },

    #[error("line {line}: missing 'instance_id'")]
    MissingInstanceId { line: usize },

    #[error("Missing instances in dataset: {0:?}")]
    MissingInstances(Vec<String>),
}
