//! Worktree manager for isolated agent working copies
//!
//! Wraps the git CLI to create and destroy worktrees sibling to the target
//! clone. Implement runs get a fresh `fix/issue-{N}` branch off the base
//! branch; fix runs check out the PR's branch and hard-reset it to origin.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for worktree and repo-local git operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Base branch '{0}' is not fast-forwardable: {1}")]
    NotFastForward(String, String),

    #[error("Git command failed: {0}")]
    GitError(String),
}

/// Configuration for the worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Path to the target repository clone
    pub repo_root: PathBuf,

    /// Base directory for worktrees, sibling to the clone
    pub base_dir: PathBuf,

    /// Branch implement runs fork from
    pub base_branch: String,
}

/// Manager for git worktrees on the target repository
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        debug!(?config, "WorktreeManager::new: called");
        Self { config }
    }

    /// Branch name for an implement run on an issue
    pub fn implement_branch(issue_number: i64) -> String {
        format!("fix/issue-{issue_number}")
    }

    /// Worktree path for an implement run
    pub fn implement_path(&self, issue_number: i64) -> PathBuf {
        self.config.base_dir.join(format!("issue-{issue_number}"))
    }

    /// Worktree path for a fix run
    pub fn fix_path(&self, pr_number: i64) -> PathBuf {
        self.config.base_dir.join(format!("pr-fix-{pr_number}"))
    }

    /// Fetch origin and fast-forward the base branch
    ///
    /// Fails closed when the base has diverged; a non-fast-forwardable base
    /// is surfaced, never auto-resolved.
    pub async fn ensure_repo_updated(&self) -> Result<(), WorktreeError> {
        let base = &self.config.base_branch;
        debug!(%base, "ensure_repo_updated: fetching origin");

        let output = self.git(&["fetch", "origin", base]).await?;
        if !output.status.success() {
            return Err(WorktreeError::FetchFailed(stderr_of(&output)));
        }

        // Updating the ref via fetch refspec works unless the base branch is
        // checked out in the clone; fall back to an ff-only merge there.
        let refspec = format!("{base}:{base}");
        let output = self.git(&["fetch", "origin", &refspec]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if !stderr.contains("refusing to fetch into") && !stderr.contains("checked out") {
            return Err(WorktreeError::NotFastForward(base.clone(), stderr));
        }

        let origin_base = format!("origin/{base}");
        let output = self.git(&["merge", "--ff-only", &origin_base]).await?;
        if !output.status.success() {
            return Err(WorktreeError::NotFastForward(base.clone(), stderr_of(&output)));
        }
        Ok(())
    }

    /// Create a worktree for an implement run
    ///
    /// Deletes any stale `fix/issue-{N}` branch first, then creates the
    /// worktree on a fresh branch forked from the base branch.
    pub async fn create_for_implement(&self, issue_number: i64) -> Result<PathBuf, WorktreeError> {
        let branch = Self::implement_branch(issue_number);
        let path = self.implement_path(issue_number);
        debug!(issue_number, %branch, path = %path.display(), "create_for_implement: called");

        self.ensure_base_dir().await?;

        // Clear remnants of a previous attempt: worktree first, then branch
        self.remove_worktree(&path).await?;
        let _ = self.git(&["branch", "-D", &branch]).await;

        let output = self
            .git(&[
                "worktree",
                "add",
                path_str(&path),
                "-b",
                &branch,
                &self.config.base_branch,
            ])
            .await?;
        if !output.status.success() {
            return Err(WorktreeError::CreateFailed(stderr_of(&output)));
        }

        info!(issue_number, %branch, path = %path.display(), "created implement worktree");
        Ok(path)
    }

    /// Create a worktree for a fix run on an existing PR branch
    ///
    /// Checks out the PR's branch and hard-resets the working copy to
    /// `origin/{branch}` so the agent always starts from the pushed state.
    pub async fn create_for_fix(&self, pr_number: i64, branch_name: &str) -> Result<PathBuf, WorktreeError> {
        let path = self.fix_path(pr_number);
        debug!(pr_number, branch = %branch_name, path = %path.display(), "create_for_fix: called");

        self.ensure_base_dir().await?;
        self.remove_worktree(&path).await?;

        let output = self.git(&["fetch", "origin", branch_name]).await?;
        if !output.status.success() {
            return Err(WorktreeError::FetchFailed(stderr_of(&output)));
        }

        let output = self.git(&["worktree", "add", path_str(&path), branch_name]).await?;
        if !output.status.success() {
            return Err(WorktreeError::CreateFailed(stderr_of(&output)));
        }

        let origin_branch = format!("origin/{branch_name}");
        let output = Command::new("git")
            .args(["reset", "--hard", &origin_branch])
            .current_dir(&path)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            // Undo the half-made worktree so the caller never sees partial state
            let _ = self.remove_worktree(&path).await;
            return Err(WorktreeError::CreateFailed(stderr_of(&output)));
        }

        info!(pr_number, branch = %branch_name, path = %path.display(), "created fix worktree");
        Ok(path)
    }

    /// Force-remove a worktree, tolerating already-removed state
    pub async fn cleanup(&self, path: &Path) -> Result<(), WorktreeError> {
        debug!(path = %path.display(), "cleanup: called");
        self.remove_worktree(path).await?;
        let _ = self.git(&["worktree", "prune"]).await;
        Ok(())
    }

    /// List worktree directories currently present under the base dir
    pub async fn list_paths(&self) -> Result<Vec<PathBuf>, WorktreeError> {
        let mut paths = Vec::new();
        if !self.config.base_dir.exists() {
            return Ok(paths);
        }

        let mut entries = tokio::fs::read_dir(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?
        {
            if entry.path().is_dir() {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    /// True when the branch exists on origin (already pushed)
    pub async fn has_remote_branch(&self, branch: &str) -> Result<bool, WorktreeError> {
        let refspec = format!("refs/heads/{branch}");
        let output = self.git(&["ls-remote", "--heads", "origin", &refspec]).await?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(stderr_of(&output)));
        }
        Ok(!output.stdout.is_empty())
    }

    /// True when the worktree has local commits not present on origin
    pub async fn has_unpushed_commits(&self, worktree: &Path, branch: &str) -> Result<bool, WorktreeError> {
        let range = format!("origin/{branch}..{branch}");
        let output = Command::new("git")
            .args(["rev-list", "--count", &range])
            .current_dir(worktree)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            // No upstream yet; any local commit beyond the base counts
            let range = format!("{}..{branch}", self.config.base_branch);
            let output = Command::new("git")
                .args(["rev-list", "--count", &range])
                .current_dir(worktree)
                .output()
                .await
                .map_err(|e| WorktreeError::GitError(e.to_string()))?;
            if !output.status.success() {
                return Err(WorktreeError::GitError(stderr_of(&output)));
            }
            return Ok(parse_count(&output.stdout) > 0);
        }
        Ok(parse_count(&output.stdout) > 0)
    }

    /// Push a branch from a worktree to origin
    pub async fn push_branch(&self, worktree: &Path, branch: &str) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["push", "-u", "origin", branch])
            .current_dir(worktree)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(stderr_of(&output)));
        }
        info!(%branch, "pushed branch to origin");
        Ok(())
    }

    async fn ensure_base_dir(&self) -> Result<(), WorktreeError> {
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(format!("failed to create base dir: {e}")))
    }

    async fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        if !path.exists() {
            return Ok(());
        }
        let output = self.git(&["worktree", "remove", path_str(path), "--force"]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::RemoveFailed(stderr));
            }
            // Registered nowhere; remove the directory itself
            warn!(path = %path.display(), "directory was not a registered worktree, removing directly");
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| WorktreeError::RemoveFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.config.repo_root)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_default()
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn parse_count(stdout: &[u8]) -> u64 {
    String::from_utf8_lossy(stdout).trim().parse().unwrap_or(0)
}
