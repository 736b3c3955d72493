//! Disposable, version-controlled checkouts of task repositories.
//!
//! Each repository is cloned once into a shallow mirror under the cache
//! root. Every workspace is a detached `git worktree` of that mirror in the
//! system temp dir, removed again when the [`Workspace`] is dropped.
//!
//! Git commands that change a mirror (clone, fetch, worktree add) run under an
//! exclusive `<mirror>.lock` file lock, so concurrent tasks and processes on
//! the same repository take turns.

use crate::util::{run_command_with_timeout, truncate};
use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use git2::{DiffFormat, DiffOptions, IndexAddOption, Oid, Repository};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

const ERROR_PREVIEW_CHARS: usize = 240;
const FETCH_ATTEMPTS: usize = 2;

/// Environment applied to every git subprocess so nothing ever waits on a prompt.
pub fn git_env_overrides() -> [(&'static str, &'static str); 2] {
    [("GIT_TERMINAL_PROMPT", "0"), ("GCM_INTERACTIVE", "never")]
}

#[derive(Debug, Clone, Copy)]
pub struct GitTimeouts {
    pub clone: Duration,
    pub fetch: Duration,
    pub checkout: Duration,
    pub apply: Duration,
}

impl Default for GitTimeouts {
    fn default() -> Self {
        Self {
            clone: Duration::from_secs(1_200),
            fetch: Duration::from_secs(600),
            checkout: Duration::from_secs(120),
            apply: Duration::from_secs(60),
        }
    }
}

/// Outcome of a dry-run `git apply --check`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCheck {
    pub ok: bool,
    pub stderr: String,
}

/// Something that can hand out private checkouts of a repository.
pub trait WorkspaceProvider: Send + Sync {
    /// Check out `repo` (an `owner/name` identifier) at `revision`, falling
    /// back to the default branch head if the revision can't be resolved.
    fn materialize(&self, repo: &str, revision: Option<&str>) -> Result<Workspace>;

    /// Tracked paths at the default branch head. Empty when the provider has
    /// no way to list them.
    fn list_files(&self, _repo: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Exclusive advisory lock on `<mirror>.lock`, released on drop.
struct MirrorLock {
    file: File,
}

impl MirrorLock {
    fn acquire(mirror: &Path) -> Result<Self> {
        let name = mirror
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("Invalid mirror path '{}'", mirror.display()))?;
        let path = mirror.with_file_name(format!("{}.lock", name));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create '{}'", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open mirror lock '{}'", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock '{}'", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for MirrorLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct GitWorkspaceProvider {
    cache_root: PathBuf,
    remote_base: String,
    timeouts: GitTimeouts,
    refreshed: Mutex<HashSet<PathBuf>>,
}

impl GitWorkspaceProvider {
    pub fn new(cache_root: impl Into<PathBuf>, remote_base: impl Into<String>) -> Self {
        Self {
            cache_root: cache_root.into(),
            remote_base: remote_base.into().trim_end_matches('/').to_string(),
            timeouts: GitTimeouts::default(),
            refreshed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_timeouts(mut self, timeouts: GitTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Path of the shared mirror for `repo`, without touching the filesystem.
    pub fn mirror_path(&self, repo: &str) -> Result<PathBuf> {
        let (owner, name) = split_repo_identifier(repo)?;
        Ok(self.cache_root.join(owner).join(name))
    }

    /// Clone the mirror if it doesn't exist yet, otherwise refresh it once per
    /// process. A failed refresh leaves the stale mirror in place. The caller
    /// holds the mirror lock.
    fn ensure_mirror(&self, repo: &str, mirror: &Path) -> Result<()> {
        if !mirror.join(".git").exists() {
            self.clone_mirror(repo, mirror)?;
            self.mark_refreshed(mirror);
            return Ok(());
        }

        if self.mark_refreshed(mirror) {
            let (ok, _stdout, stderr) = run_git(
                mirror,
                &["fetch", "--depth", "1", "origin"],
                self.timeouts.fetch,
            )?;
            if !ok {
                tracing::warn!(
                    repo,
                    error = %truncate(stderr.trim(), ERROR_PREVIEW_CHARS),
                    "mirror refresh failed; using cached snapshot"
                );
            }
        }
        Ok(())
    }

    /// Make `rev` available in the shallow mirror. Returns false if it still
    /// can't be resolved after every fetch attempt.
    fn fetch_revision(&self, repo: &str, mirror: &Path, rev: &str) -> Result<bool> {
        if has_commit(mirror, rev) {
            return Ok(true);
        }
        for attempt in 1..=FETCH_ATTEMPTS {
            let (ok, _stdout, stderr) = run_git(
                mirror,
                &["fetch", "--depth", "1", "origin", rev],
                self.timeouts.fetch,
            )?;
            if ok && has_commit(mirror, rev) {
                return Ok(true);
            }
            tracing::warn!(
                repo,
                rev,
                attempt,
                error = %truncate(stderr.trim(), ERROR_PREVIEW_CHARS),
                "fetch of base revision failed"
            );
        }
        Ok(false)
    }

    /// Returns true the first time it sees `mirror`.
    fn mark_refreshed(&self, mirror: &Path) -> bool {
        match self.refreshed.lock() {
            Ok(mut seen) => seen.insert(mirror.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().insert(mirror.to_path_buf()),
        }
    }

    /// Clone into a scratch directory and rename into place, so an
    /// interrupted clone never leaves a half-written mirror behind.
    fn clone_mirror(&self, repo: &str, mirror: &Path) -> Result<()> {
        let parent = mirror
            .parent()
            .ok_or_else(|| anyhow!("Invalid mirror path '{}'", mirror.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create mirror parent '{}'", parent.display()))?;

        let scratch = parent.join(format!(
            ".{}.clone-{}",
            mirror
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            uuid::Uuid::new_v4()
        ));
        let url = format!("{}/{}.git", self.remote_base, repo);
        let scratch_str = scratch.to_string_lossy().to_string();

        tracing::info!(repo, url = %url, "cloning mirror");
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", &url, &scratch_str]);
        for (k, v) in git_env_overrides() {
            cmd.env(k, v);
        }
        let output = run_command_with_timeout(&mut cmd, self.timeouts.clone)
            .map_err(|e| anyhow!("Failed to start git clone: {}", e))?;
        if !output.success() {
            let _ = std::fs::remove_dir_all(&scratch);
            if mirror.join(".git").exists() {
                return Ok(());
            }
            return Err(anyhow!(
                "git clone failed for {}: {}",
                url,
                truncate(output.stderr.trim(), ERROR_PREVIEW_CHARS)
            ));
        }

        if let Err(err) = std::fs::rename(&scratch, mirror) {
            let _ = std::fs::remove_dir_all(&scratch);
            if mirror.join(".git").exists() {
                // Lost the race to another task; its clone is just as good.
                return Ok(());
            }
            return Err(anyhow!(
                "Failed to move clone into '{}': {}",
                mirror.display(),
                err
            ));
        }
        Ok(())
    }

    fn add_worktree(&self, repo: &str, mirror: &Path, revision: Option<&str>) -> Result<PathBuf> {
        let dir = std::env::temp_dir().join(format!(
            "patchbench-ws-{}-{}",
            sanitize_component(repo),
            uuid::Uuid::new_v4()
        ));
        let dir_str = dir.to_string_lossy().to_string();

        let mut candidates: Vec<&str> = Vec::new();
        if let Some(rev) = revision.map(str::trim).filter(|r| !r.is_empty()) {
            // Shallow mirrors rarely contain the base commit; ask for it explicitly.
            if self.fetch_revision(repo, mirror, rev)? {
                candidates.push(rev);
            }
        }
        candidates.extend(["origin/HEAD", "HEAD"]);

        let mut last_error = String::new();
        for candidate in &candidates {
            let (ok, _stdout, stderr) = run_git(
                mirror,
                &["worktree", "add", "--detach", &dir_str, candidate],
                self.timeouts.checkout,
            )?;
            if ok {
                if revision.is_some_and(|r| r.trim() != *candidate) {
                    tracing::warn!(
                        repo,
                        requested = revision.unwrap_or_default(),
                        used = candidate,
                        "base revision unavailable; fell back"
                    );
                }
                return Ok(dir);
            }
            last_error = stderr;
            let _ = std::fs::remove_dir_all(&dir);
        }

        Err(anyhow!(
            "git worktree add failed for {}: {}",
            repo,
            truncate(last_error.trim(), ERROR_PREVIEW_CHARS)
        ))
    }
}

impl WorkspaceProvider for GitWorkspaceProvider {
    fn materialize(&self, repo: &str, revision: Option<&str>) -> Result<Workspace> {
        let mirror = self.mirror_path(repo)?;
        let root = {
            let _lock = MirrorLock::acquire(&mirror)?;
            self.ensure_mirror(repo, &mirror)?;
            self.add_worktree(repo, &mirror, revision)?
        };
        let mut workspace = Workspace {
            root,
            mirror,
            base: String::new(),
            apply_timeout: self.timeouts.apply,
            removed: false,
        };
        let base = rev_parse_head(&workspace.root)?;
        workspace.base = base;
        tracing::debug!(repo, base = %workspace.base, root = %workspace.root.display(), "workspace ready");
        Ok(workspace)
    }

    fn list_files(&self, repo: &str) -> Result<Vec<String>> {
        let mirror = self.mirror_path(repo)?;
        {
            let _lock = MirrorLock::acquire(&mirror)?;
            self.ensure_mirror(repo, &mirror)?;
        }
        let repository = Repository::open(&mirror)
            .with_context(|| format!("Failed to open mirror '{}'", mirror.display()))?;
        let index = repository.index()?;
        Ok(index
            .iter()
            .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
            .collect())
    }
}

/// One private checkout. Owned by exactly one attempt; removed on drop.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    mirror: PathBuf,
    base: String,
    apply_timeout: Duration,
    removed: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Commit checked out at materialization.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Stage everything in the working tree and return the unified diff
    /// against the base commit (3 lines of context).
    pub fn diff_since_snapshot(&self) -> Result<String> {
        let repo = Repository::open(&self.root)
            .with_context(|| format!("Failed to open workspace '{}'", self.root.display()))?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let base_tree = repo.find_commit(Oid::from_str(&self.base)?)?.tree()?;
        let mut opts = DiffOptions::new();
        opts.context_lines(3);
        let diff = repo.diff_tree_to_index(Some(&base_tree), Some(&index), Some(&mut opts))?;

        let mut out: Vec<u8> = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                out.push(line.origin() as u8);
            }
            out.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Dry-run apply tolerant of whitespace differences. Never modifies the tree.
    pub fn check_apply(&self, patch: &str) -> ApplyCheck {
        match self.try_check_apply(patch) {
            Ok(check) => check,
            Err(err) => ApplyCheck {
                ok: false,
                stderr: format!("{:#}", err),
            },
        }
    }

    fn try_check_apply(&self, patch: &str) -> Result<ApplyCheck> {
        let mut file = tempfile::Builder::new()
            .prefix("patchbench-")
            .suffix(".diff")
            .tempfile()
            .context("Failed to create patch temp file")?;
        file.write_all(patch.as_bytes())?;
        file.flush()?;
        let patch_path = file.path().to_string_lossy().to_string();

        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root).args([
            "apply",
            "--check",
            "--ignore-space-change",
            "--ignore-whitespace",
            &patch_path,
        ]);
        for (k, v) in git_env_overrides() {
            cmd.env(k, v);
        }
        let output = run_command_with_timeout(&mut cmd, self.apply_timeout)
            .map_err(|e| anyhow!("Failed to start git apply: {}", e))?;
        if output.timed_out {
            return Ok(ApplyCheck {
                ok: false,
                stderr: "git apply --check timed out".to_string(),
            });
        }
        Ok(ApplyCheck {
            ok: output.success(),
            stderr: output.stderr,
        })
    }

    /// Remove the worktree registration and the directory. Safe to call twice.
    pub fn cleanup(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        let root = self.root.to_string_lossy().to_string();
        let _ = run_git(
            &self.mirror,
            &["worktree", "remove", "--force", &root],
            Duration::from_secs(60),
        );
        if self.root.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.root) {
                tracing::warn!(root = %self.root.display(), error = %err, "failed to remove workspace");
            }
            let _ = run_git(&self.mirror, &["worktree", "prune"], Duration::from_secs(60));
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn run_git(repo_dir: &Path, args: &[&str], timeout: Duration) -> Result<(bool, String, String)> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_dir).args(args);
    for (k, v) in git_env_overrides() {
        cmd.env(k, v);
    }
    let output = run_command_with_timeout(&mut cmd, timeout)
        .map_err(|e| anyhow!("Failed to start git command: {}", e))?;
    Ok((output.success(), output.stdout, output.stderr))
}

fn has_commit(repo_dir: &Path, rev: &str) -> bool {
    let Ok(repo) = Repository::open(repo_dir) else {
        return false;
    };
    let found = repo
        .revparse_single(rev)
        .and_then(|object| object.peel_to_commit())
        .is_ok();
    found
}

fn rev_parse_head(repo_dir: &Path) -> Result<String> {
    let (ok, stdout, stderr) = run_git(repo_dir, &["rev-parse", "HEAD"], Duration::from_secs(30))?;
    if !ok {
        return Err(anyhow!(
            "git rev-parse HEAD failed in {}: {}",
            repo_dir.display(),
            truncate(stderr.trim(), ERROR_PREVIEW_CHARS)
        ));
    }
    Ok(stdout.trim().to_string())
}

/// Split `owner/name`, refusing anything that could escape the cache root.
fn split_repo_identifier(repo: &str) -> Result<(&str, &str)> {
    let valid = |part: &str| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    match repo.split_once('/') {
        Some((owner, name)) if valid(owner) && valid(name) => Ok((owner, name)),
        _ => Err(anyhow!(
            "Invalid repository identifier '{}' (expected owner/name)",
            repo
        )),
    }
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
