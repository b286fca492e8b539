//! Git worktree management for agtop
//!
//! Every run gets its own working directory at `<worktree_root>/<run_id>`,
//! checked out to a dedicated branch. The manager never caches worktree
//! state: listings always come from `git worktree list`.

mod commands;
mod error;
mod worktree;

pub use commands::{branch_exists, current_branch, delete_branch, is_git_repository};
pub use error::{Result, WorktreeError};
pub use worktree::{ManagedWorktree, MergeOutcome, WorktreeManager, WorktreeRecord};
