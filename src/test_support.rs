//! Fixtures shared by unit tests: a scripted gateway and throwaway git remotes.

use crate::error::GatewayError;
use crate::llm::{ChatGateway, ChatMessage, ChatReply, SamplingParams, Usage};
use crate::workspace::GitWorkspaceProvider;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub const PARSE_PY: &str = "def parse(items):\n    return items[1:]\n";

pub const FIX_DIFF: &str = concat!(
    "diff --git a/widgets/parse.py b/widgets/parse.py\n",
    "--- a/widgets/parse.py\n",
    "+++ b/widgets/parse.py\n",
    "@@ -1,2 +1,2 @@\n",
    " def parse(items):\n",
    "-    return items[1:]\n",
    "+    return items[0:]\n",
);

/// Replays scripted replies in order, repeating the last one once exhausted.
/// A reply of `"!error"` fails the call with a transport error.
pub struct ScriptedGateway {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    pub seen: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Duration,
}

impl ScriptedGateway {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Content of the last message of the `n`th request.
    pub fn last_prompt(&self, n: usize) -> String {
        self.seen.lock().unwrap()[n]
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(
        &self,
        transcript: &[ChatMessage],
        _params: &SamplingParams,
    ) -> Result<ChatReply, GatewayError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().unwrap().push(transcript.to_vec());
        let text = {
            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.replies.lock().unwrap().pop_front() {
                *last = next;
            }
            last.clone()
        };
        if text == "!error" {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        Ok(ChatReply {
            text,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                ..Default::default()
            },
        })
    }
}

pub fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(repo)
        .args(args)
        .status()
        .expect("git command failed to start");
    assert!(status.success(), "git {:?} failed", args);
}

/// A local "remote" hosting `acme/widgets`, by default with just
/// `widgets/parse.py`.
pub struct LocalRemote {
    pub remote: TempDir,
    pub cache: TempDir,
    pub head: String,
    source: PathBuf,
}

impl LocalRemote {
    pub fn new() -> Self {
        Self::with_files(&[("widgets/parse.py", PARSE_PY)])
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let remote = tempfile::tempdir().unwrap();
        let source = remote.path().join("acme").join("widgets.git");
        std::fs::create_dir_all(&source).unwrap();
        git(&source, &["init"]);
        git(&source, &["config", "user.email", "test@example.com"]);
        git(&source, &["config", "user.name", "Test"]);
        git(&source, &["config", "uploadpack.allowAnySHA1InWant", "true"]);
        let mut fixture = Self {
            remote,
            cache: tempfile::tempdir().unwrap(),
            head: String::new(),
            source,
        };
        fixture.commit(files);
        fixture
    }

    /// Write `files` into the remote and commit them; returns the new head.
    pub fn commit(&mut self, files: &[(&str, &str)]) -> String {
        for (path, content) in files {
            let target = self.source.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(target, content).unwrap();
        }
        git(&self.source, &["add", "."]);
        git(&self.source, &["commit", "-m", "update"]);
        let out = Command::new("git")
            .current_dir(&self.source)
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        self.head = String::from_utf8_lossy(&out.stdout).trim().to_string();
        self.head.clone()
    }

    pub fn provider(&self) -> GitWorkspaceProvider {
        GitWorkspaceProvider::new(
            self.cache.path(),
            format!("file://{}", self.remote.path().display()),
        )
    }
}
