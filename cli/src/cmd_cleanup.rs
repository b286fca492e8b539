use std::process::ExitCode;

use tracing::warn;

use agent_runner::{OsProcessProbe, Reconciler};
use agtop_core::run::SessionStore;
use agtop_core::AgtopConfig;
use git_worktree::WorktreeManager;

/// Standalone cleanup against a previous crash: there is no live store, so
/// every session is judged by its file and the OS process table alone.
pub async fn execute(config: &AgtopConfig, dry_run: bool) -> anyhow::Result<ExitCode> {
    let sessions = SessionStore::new(config.sessions_dir());
    let worktrees = match WorktreeManager::new_at(&config.project_root, &config.worktree_root).await
    {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!("Skipping worktree sweep: {}", e);
            None
        }
    };

    let probe = OsProcessProbe;
    let mut reconciler =
        Reconciler::new(&sessions, &probe).with_stale_after(config.stale_after);
    if let Some(worktrees) = &worktrees {
        reconciler = reconciler.with_worktrees(worktrees);
    }

    let report = reconciler.cleanup(dry_run).await;
    println!("{}", report);
    Ok(ExitCode::SUCCESS)
}
