use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Worktree error: {0}")]
    Worktree(#[from] git_worktree::WorktreeError),

    /// Store, persistence or configuration failure
    #[error(transparent)]
    Core(#[from] agtop_core::Error),

    #[error("Cannot start agent `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child came up without a pid or one of its pipes
    #[error("Agent process has no {0}")]
    Incomplete(&'static str),

    /// The run already has live workers
    #[error("Run {run_id} is already running")]
    AlreadyRunning { run_id: String },

    /// No new agent may be spawned for a run that already ended
    #[error("Run {run_id} already ended as {state}")]
    RunEnded {
        run_id: String,
        state: agtop_core::run::RunState,
    },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: i32, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
