use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorktreeError>;

#[derive(Debug, Error)]
pub enum WorktreeError {
    /// `git` could not be started at all
    #[error("Cannot run git: {0}")]
    GitUnavailable(#[source] std::io::Error),

    /// `git` ran and exited non-zero
    #[error("`git {command}` failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Worktree already exists at {path}")]
    WorktreeExists { path: PathBuf },

    #[error("Not a git repository: {path}")]
    NotAGitRepository { path: PathBuf },

    /// The run ID is not usable as a single directory name
    #[error("Invalid run id for worktree: {run_id:?}")]
    InvalidRunId { run_id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
