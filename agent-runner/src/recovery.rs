//! Crash recovery: reconcile session files, the live store, process
//! liveness and the worktree listing

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use agtop_core::run::{persistence::remove_file_if_exists, RunStore, SessionFile, SessionStore};
use git_worktree::WorktreeManager;

use crate::signal;

/// OS process-liveness check
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: i32) -> bool;
}

/// Asks the operating system (signal 0 on unix)
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl ProcessProbe for OsProcessProbe {
    fn is_alive(&self, pid: i32) -> bool {
        signal::is_alive(pid)
    }
}

/// Summary of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions_removed: usize,
    pub worktrees_removed: usize,
    pub dry_run: bool,
    /// One line per removal, performed or intended
    pub actions: Vec<String>,
    /// Failures that did not stop the sweep
    pub warnings: Vec<String>,
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.dry_run { "Would remove" } else { "Removed" };
        for action in &self.actions {
            writeln!(f, "  {}", action)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning: {}", warning)?;
        }
        write!(
            f,
            "{} {} session(s) and {} worktree(s)",
            verb, self.sessions_removed, self.worktrees_removed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Stale,
    Dead,
    Active,
}

/// Repairs state left behind by crashed or abandoned runs
pub struct Reconciler<'a> {
    sessions: &'a SessionStore,
    worktrees: Option<&'a WorktreeManager>,
    store: Option<&'a RunStore>,
    probe: &'a dyn ProcessProbe,
    stale_after: Duration,
    now: DateTime<Utc>,
}

impl<'a> Reconciler<'a> {
    pub fn new(sessions: &'a SessionStore, probe: &'a dyn ProcessProbe) -> Self {
        Self {
            sessions,
            worktrees: None,
            store: None,
            probe,
            stale_after: Duration::from_secs(7 * 24 * 60 * 60),
            now: Utc::now(),
        }
    }

    /// Sweep orphaned worktrees of this manager too
    pub fn with_worktrees(mut self, worktrees: &'a WorktreeManager) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    /// Reconcile against a live in-process store
    pub fn with_store(mut self, store: &'a RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Pin "now"; used for age comparisons
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn classify(&self, session: &SessionFile) -> Verdict {
        let run = &session.run;
        if run.is_terminal() {
            let age = run
                .saved_at
                .map(|saved| self.now.signed_duration_since(saved))
                .and_then(|age| age.to_std().ok());
            // A terminal session that was never stamped is treated as fresh
            match age {
                Some(age) if age > self.stale_after => Verdict::Stale,
                _ => Verdict::Active,
            }
        } else if run.pid <= 0 || !self.probe.is_alive(run.pid) {
            Verdict::Dead
        } else {
            Verdict::Active
        }
    }

    /// Run one cleanup pass.
    ///
    /// In dry-run mode nothing is touched; the report lists what would go.
    /// Individual failures become warnings and the sweep continues.
    pub async fn cleanup(&self, dry_run: bool) -> CleanupReport {
        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };
        let mut in_use: HashSet<String> = HashSet::new();

        // Runs the live store still drives are in use whatever their files say
        if let Some(store) = self.store {
            for run in store.list().await {
                if !run.is_terminal() {
                    in_use.insert(run.id);
                }
            }
        }

        let sessions = match self.sessions.load() {
            Ok(sessions) => sessions,
            Err(e) => {
                report.warnings.push(format!("cannot load sessions: {}", e));
                Vec::new()
            }
        };

        for session in &sessions {
            let run_id = session.run_id().to_string();
            if in_use.contains(&run_id) {
                continue;
            }

            let verdict = self.classify(session);
            let reason = match verdict {
                Verdict::Active => {
                    in_use.insert(run_id);
                    continue;
                }
                Verdict::Stale => "stale",
                Verdict::Dead => "dead",
            };

            report
                .actions
                .push(format!("session {} ({}, {})", run_id, reason, session.run.state));

            if dry_run {
                report.sessions_removed += 1;
                continue;
            }

            info!(run_id = %run_id, reason, "Removing session");
            if let Err(e) = self.sessions.remove(&run_id) {
                // The session stays, so its logs, live run and worktree stay too
                report
                    .warnings
                    .push(format!("session {}: {}", run_id, e));
                in_use.insert(run_id);
                continue;
            }
            report.sessions_removed += 1;
            for path in session.log_paths() {
                if let Err(e) = remove_file_if_exists(path) {
                    report
                        .warnings
                        .push(format!("log {}: {}", path.display(), e));
                }
            }
            if let Some(store) = self.store {
                store.remove(&run_id).await;
            }
        }

        if let Some(worktrees) = self.worktrees {
            self.sweep_worktrees(worktrees, &in_use, &mut report).await;
        }

        info!(
            dry_run,
            sessions = report.sessions_removed,
            worktrees = report.worktrees_removed,
            "Cleanup finished"
        );
        report
    }

    /// Remove worktrees under the managed root whose run is not in use
    async fn sweep_worktrees(
        &self,
        worktrees: &WorktreeManager,
        in_use: &HashSet<String>,
        report: &mut CleanupReport,
    ) {
        let managed = match worktrees.list_managed().await {
            Ok(managed) => managed,
            Err(e) => {
                warn!("Cannot list worktrees: {}", e);
                report.warnings.push(format!("cannot list worktrees: {}", e));
                return;
            }
        };

        for worktree in managed {
            if in_use.contains(&worktree.run_id) {
                continue;
            }
            report.actions.push(format!(
                "worktree {} ({})",
                worktree.run_id,
                worktree.record.path.display()
            ));

            if report.dry_run {
                report.worktrees_removed += 1;
                continue;
            }

            match worktrees.remove(&worktree.run_id).await {
                Ok(_) => report.worktrees_removed += 1,
                Err(e) => {
                    warn!(run_id = %worktree.run_id, "Failed to remove worktree: {}", e);
                    report
                        .warnings
                        .push(format!("worktree {}: {}", worktree.run_id, e));
                }
            }
        }
    }
}
