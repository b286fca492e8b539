//! Worktree management

use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::commands::{branch_exists, git_command, git_command_checked, is_git_repository};
use crate::error::{Result, WorktreeError};

/// One git worktree as reported by `git worktree list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeRecord {
    /// Absolute path with symbolic links resolved (when the directory exists)
    pub path: PathBuf,
    /// Checked-out branch, empty for a detached HEAD
    pub branch: String,
    /// Commit hash at HEAD
    pub head: String,
    /// Whether this is the repository's main working tree
    pub is_main: bool,
    /// Git marked the entry prunable (its directory is gone)
    pub prunable: bool,
}

/// A worktree living directly under the manager's root, keyed by run ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedWorktree {
    pub run_id: String,
    pub record: WorktreeRecord,
}

/// Result of merging a run branch back into the main checkout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Merge commit created
    Merged { commit: String },
    /// Merge stopped on conflicts and was aborted
    Conflict { message: String },
}

/// Manages per-run git worktrees under a single root directory
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    /// Path to the main repository
    repo_path: PathBuf,
    /// Directory holding one worktree per run
    worktree_root: PathBuf,
}

impl WorktreeManager {
    /// Bind to a repository and the directory under which run worktrees live
    pub async fn new_at(
        repo_path: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let repo_path = repo_path.into();

        // Verify it's a git repository
        if !is_git_repository(&repo_path).await? {
            return Err(WorktreeError::NotAGitRepository { path: repo_path });
        }

        Ok(Self {
            repo_path,
            worktree_root: worktree_root.into(),
        })
    }

    /// Get the repository path
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Get the worktree root
    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Where the worktree for `run_id` lives (whether or not it exists)
    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.worktree_root.join(run_id)
    }

    /// Create a worktree for a run at `<worktree_root>/<run_id>` on `branch`.
    ///
    /// The branch is created from the current HEAD when it does not exist yet.
    /// Fails with [`WorktreeError::WorktreeExists`] if anything already
    /// occupies the target path.
    pub async fn create(&self, run_id: &str, branch: &str) -> Result<WorktreeRecord> {
        check_run_id(run_id)?;
        let path = self.path_for(run_id);

        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            return Err(WorktreeError::WorktreeExists { path });
        }

        tokio::fs::create_dir_all(&self.worktree_root).await?;

        info!(run_id, branch, path = %path.display(), "Creating worktree");

        if branch_exists(&self.repo_path, branch).await? {
            git_command_checked(
                &self.repo_path,
                [
                    OsStr::new("worktree"),
                    OsStr::new("add"),
                    path.as_os_str(),
                    OsStr::new(branch),
                ],
            )
            .await?;
        } else {
            debug!("Branch {} does not exist, creating it from HEAD", branch);
            git_command_checked(
                &self.repo_path,
                [
                    OsStr::new("worktree"),
                    OsStr::new("add"),
                    OsStr::new("-b"),
                    OsStr::new(branch),
                    path.as_os_str(),
                ],
            )
            .await?;
        }

        let head = git_command_checked(&path, ["rev-parse", "HEAD"]).await?;

        Ok(WorktreeRecord {
            path: resolve(&path).await,
            branch: branch.to_string(),
            head: head.trim().to_string(),
            is_main: false,
            prunable: false,
        })
    }

    /// List every worktree of the repository, paths resolved through symlinks
    pub async fn list(&self) -> Result<Vec<WorktreeRecord>> {
        let output =
            git_command_checked(&self.repo_path, ["worktree", "list", "--porcelain"]).await?;

        let mut worktrees = Vec::new();
        for mut record in parse_porcelain(&output) {
            record.path = resolve(&record.path).await;
            worktrees.push(record);
        }
        Ok(worktrees)
    }

    /// Worktrees whose directory sits directly under the worktree root.
    ///
    /// The directory name is the run ID. Both sides of the comparison are
    /// resolved, so a symlinked root still matches what git reports.
    pub async fn list_managed(&self) -> Result<Vec<ManagedWorktree>> {
        let root = resolve(&self.worktree_root).await;
        let worktrees = self.list().await?;

        Ok(worktrees
            .into_iter()
            .filter(|wt| !wt.is_main)
            .filter_map(|record| {
                let parent = record.path.parent()?;
                if parent != root.as_path() && parent != self.worktree_root.as_path() {
                    return None;
                }
                let run_id = record.path.file_name()?.to_str()?.to_string();
                Some(ManagedWorktree { run_id, record })
            })
            .collect())
    }

    /// Find the registered worktree for a run
    pub async fn find(&self, run_id: &str) -> Result<Option<WorktreeRecord>> {
        let managed = self.list_managed().await?;
        Ok(managed
            .into_iter()
            .find(|m| m.run_id == run_id)
            .map(|m| m.record))
    }

    /// Remove the worktree for a run and prune git's metadata.
    ///
    /// Idempotent: a missing worktree is a successful no-op. Returns whether
    /// anything was actually removed.
    pub async fn remove(&self, run_id: &str) -> Result<bool> {
        check_run_id(run_id)?;
        let path = self.path_for(run_id);
        let mut removed = false;

        if let Some(record) = self.find(run_id).await? {
            info!(run_id, path = %record.path.display(), "Removing worktree");
            let output = git_command(
                &self.repo_path,
                [
                    OsStr::new("worktree"),
                    OsStr::new("remove"),
                    OsStr::new("--force"),
                    record.path.as_os_str(),
                ],
            )
            .await?;
            if !output.success {
                warn!(
                    run_id,
                    "git worktree remove failed, deleting directory: {}",
                    output.stderr.trim()
                );
            }
            removed = true;
        }

        // Whatever git left behind (or an unregistered directory) goes too
        if tokio::fs::symlink_metadata(&path).await.is_ok() {
            debug!("Deleting leftover worktree directory {:?}", path);
            tokio::fs::remove_dir_all(&path).await?;
            removed = true;
        }

        self.prune().await?;
        Ok(removed)
    }

    /// Prune stale worktree information
    pub async fn prune(&self) -> Result<()> {
        git_command_checked(&self.repo_path, ["worktree", "prune"]).await?;
        Ok(())
    }

    /// Check if there are uncommitted changes in a worktree
    pub async fn has_uncommitted_changes(&self, worktree_path: &Path) -> Result<bool> {
        let output = git_command_checked(worktree_path, ["status", "--porcelain"]).await?;
        Ok(!output.trim().is_empty())
    }

    /// Commit all changes in a worktree
    pub async fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        // Stage all changes
        git_command_checked(worktree_path, ["add", "-A"]).await?;

        // Commit
        git_command_checked(worktree_path, ["commit", "-m", message]).await?;

        // Get the new commit hash
        let output = git_command_checked(worktree_path, ["rev-parse", "HEAD"]).await?;
        Ok(output.trim().to_string())
    }

    /// Merge `branch` into whatever the main checkout has checked out.
    ///
    /// Always creates a merge commit. On conflict the merge is aborted so the
    /// main checkout is left as it was.
    pub async fn merge_branch(&self, branch: &str, message: &str) -> Result<MergeOutcome> {
        info!(branch, "Merging run branch");
        let output = git_command(
            &self.repo_path,
            ["merge", "--no-ff", "-m", message, branch],
        )
        .await?;

        if output.success {
            let head = git_command_checked(&self.repo_path, ["rev-parse", "HEAD"]).await?;
            return Ok(MergeOutcome::Merged {
                commit: head.trim().to_string(),
            });
        }

        let detail = if output.stdout.trim().is_empty() {
            output.stderr.trim().to_string()
        } else {
            output.stdout.trim().to_string()
        };
        let abort = git_command(&self.repo_path, ["merge", "--abort"]).await?;
        if !abort.success {
            debug!("git merge --abort: {}", abort.stderr.trim());
        }

        let message = detail
            .lines()
            .find(|l| l.starts_with("CONFLICT"))
            .unwrap_or(detail.as_str())
            .to_string();
        Ok(MergeOutcome::Conflict { message })
    }
}

fn check_run_id(run_id: &str) -> Result<()> {
    let ok = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && !run_id.contains(['/', '\\'])
        && !run_id.contains('\0');
    if ok {
        Ok(())
    } else {
        Err(WorktreeError::InvalidRunId {
            run_id: run_id.to_string(),
        })
    }
}

/// Resolve symlinks; paths that no longer exist are returned unchanged
async fn resolve(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}

fn parse_porcelain(output: &str) -> Vec<WorktreeRecord> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeRecord> = None;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            // Save previous worktree if exists
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            current = Some(WorktreeRecord {
                path: PathBuf::from(path),
                branch: String::new(),
                head: String::new(),
                is_main: false,
                prunable: false,
            });
        } else if let Some(ref mut wt) = current {
            if let Some(head) = line.strip_prefix("HEAD ") {
                wt.head = head.to_string();
            } else if let Some(branch) = line.strip_prefix("branch ") {
                wt.branch = branch.trim_start_matches("refs/heads/").to_string();
            } else if line == "bare" {
                wt.is_main = true;
            } else if line == "prunable" || line.starts_with("prunable ") {
                wt.prunable = true;
            }
        }
    }

    if let Some(wt) = current {
        worktrees.push(wt);
    }

    // The first entry is always the main working tree
    if let Some(first) = worktrees.first_mut() {
        first.is_main = true;
    }

    worktrees
}
