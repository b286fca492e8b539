//! Run registry
//!
//! Holds the authoritative copy of every known run. Reads hand out clones
//! and every mutation goes through a method here, so concurrent supervisors
//! serialize on the registry lock instead of racing on shared references.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::run_model::{validate_run_id, Run};
use super::state::RunState;
use crate::notify::ChangeNotifier;
use crate::{Error, Result};

/// Thread-safe in-memory run registry
#[derive(Clone, Default)]
pub struct RunStore {
    runs: Arc<RwLock<Vec<Run>>>,
    notifier: ChangeNotifier,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that shares an existing notifier
    pub fn with_notifier(notifier: ChangeNotifier) -> Self {
        Self {
            runs: Arc::new(RwLock::new(Vec::new())),
            notifier,
        }
    }

    /// Insert a new run. IDs must be unique.
    pub async fn add(&self, run: Run) -> Result<()> {
        validate_run_id(&run.id)?;
        {
            let mut runs = self.runs.write().await;
            if runs.iter().any(|r| r.id == run.id) {
                return Err(Error::DuplicateRun(run.id));
            }
            debug!(run_id = %run.id, state = %run.state, "Run added");
            runs.push(run);
        }
        self.notifier.notify();
        Ok(())
    }

    /// Snapshot of every run in insertion order
    pub async fn list(&self) -> Vec<Run> {
        self.runs.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Run> {
        self.runs.read().await.iter().find(|r| r.id == id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.runs.read().await.iter().any(|r| r.id == id)
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    pub async fn remove(&self, id: &str) -> Option<Run> {
        let removed = {
            let mut runs = self.runs.write().await;
            let index = runs.iter().position(|r| r.id == id)?;
            runs.remove(index)
        };
        self.notifier.notify();
        Some(removed)
    }

    /// Move a run to `next`, enforcing the state machine.
    ///
    /// Returns `Ok(false)` when the run is already in `next`.
    pub async fn update_state(&self, id: &str, next: RunState) -> Result<bool> {
        self.mutate(id, |run| {
            if run.state == next {
                return Ok(false);
            }
            if !run.state.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    run_id: run.id.clone(),
                    from: run.state,
                    to: next,
                });
            }

            debug!(run_id = %run.id, from = %run.state, to = %next, "Run state changed");
            run.state = next;

            let now = Utc::now();
            if next == RunState::Running && run.started_at.is_none() {
                run.started_at = Some(now);
            }
            if next.is_terminal() {
                run.completed_at = Some(now);
                run.pid = 0;
            }
            Ok(true)
        })
        .await
    }

    /// Record the current subprocess ID. Ignored for terminal runs.
    pub async fn set_pid(&self, id: &str, pid: i32) -> Result<bool> {
        self.mutate(id, |run| {
            if run.is_terminal() || run.pid == pid {
                return Ok(false);
            }
            run.pid = pid;
            Ok(true)
        })
        .await
    }

    pub async fn set_worktree(&self, id: &str, path: PathBuf, branch: &str) -> Result<bool> {
        self.mutate(id, |run| {
            run.worktree = Some(path);
            run.branch = branch.to_string();
            Ok(true)
        })
        .await
    }

    pub async fn set_command(&self, id: &str, command: &str, model: &str) -> Result<bool> {
        self.mutate(id, |run| {
            run.command = command.to_string();
            run.model = model.to_string();
            Ok(true)
        })
        .await
    }

    pub async fn set_workflow(&self, id: &str, workflow: &str, skill_total: u32) -> Result<bool> {
        self.mutate(id, |run| {
            run.workflow = workflow.to_string();
            run.skill_total = skill_total;
            Ok(true)
        })
        .await
    }

    /// Record which skill is executing (1-based index)
    pub async fn set_skill(&self, id: &str, skill: &str, index: u32, total: u32) -> Result<bool> {
        self.mutate(id, |run| {
            run.current_skill = skill.to_string();
            run.skill_index = index;
            run.skill_total = total;
            Ok(true)
        })
        .await
    }

    /// Add token and cost deltas, attributed to `skill`
    pub async fn append_cost(
        &self,
        id: &str,
        skill: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    ) -> Result<bool> {
        if tokens_in == 0 && tokens_out == 0 && cost == 0.0 {
            return Ok(false);
        }
        self.mutate(id, |run| {
            run.add_cost(skill, tokens_in, tokens_out, cost);
            Ok(true)
        })
        .await
    }

    pub async fn set_error(&self, id: &str, error: impl Into<String>) -> Result<bool> {
        let error = error.into();
        self.mutate(id, |run| {
            run.error = Some(error);
            Ok(true)
        })
        .await
    }

    pub async fn add_follow_up(&self, id: &str, prompt: impl Into<String>) -> Result<bool> {
        let prompt = prompt.into();
        self.mutate(id, |run| {
            if run.is_terminal() {
                return Err(Error::InvalidInput(format!(
                    "Run {} is {} and takes no follow-ups",
                    run.id, run.state
                )));
            }
            run.follow_up_prompts.push(prompt);
            Ok(true)
        })
        .await
    }

    pub async fn set_merge_status(&self, id: &str, status: impl Into<String>) -> Result<bool> {
        let status = status.into();
        self.mutate(id, |run| {
            run.merge_status = Some(status);
            Ok(true)
        })
        .await
    }

    pub async fn set_pr_url(&self, id: &str, url: impl Into<String>) -> Result<bool> {
        let url = url.into();
        self.mutate(id, |run| {
            run.pr_url = Some(url);
            Ok(true)
        })
        .await
    }

    pub async fn set_dev_server_url(&self, id: &str, url: impl Into<String>) -> Result<bool> {
        let url = url.into();
        self.mutate(id, |run| {
            run.dev_server_url = Some(url);
            Ok(true)
        })
        .await
    }

    /// Stamp the last persistence write. Does not notify.
    pub async fn mark_saved(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::RunNotFound(id.to_string()))?;
        run.saved_at = Some(at);
        Ok(())
    }

    /// Cost over every held run, terminal ones included
    pub async fn total_cost(&self) -> f64 {
        self.runs.read().await.iter().map(|r| r.cost).sum()
    }

    pub async fn total_tokens(&self) -> u64 {
        self.runs.read().await.iter().map(|r| r.tokens()).sum()
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    async fn mutate<F>(&self, id: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Run) -> Result<bool>,
    {
        let changed = {
            let mut runs = self.runs.write().await;
            let run = runs
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| Error::RunNotFound(id.to_string()))?;
            f(run)?
        };

        if changed {
            self.notifier.notify();
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(ids: &[&str]) -> RunStore {
        let store = RunStore::new();
        for id in ids {
            store.add(Run::with_id(*id, "prompt")).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_add_and_list_in_insertion_order() {
        let store = store_with(&["c", "a", "b"]).await;
        let ids: Vec<_> = store.list().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = store_with(&["a"]).await;
        let result = store.add(Run::with_id("a", "again")).await;
        assert!(matches!(result, Err(Error::DuplicateRun(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_returns_copy() {
        let store = store_with(&["a"]).await;
        let mut copy = store.get("a").await.unwrap();
        copy.cost = 99.0;
        copy.state = RunState::Failed;

        let fresh = store.get("a").await.unwrap();
        assert_eq!(fresh.cost, 0.0);
        assert_eq!(fresh.state, RunState::Queued);
        assert!(store.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_update_state_enforces_machine() {
        let store = store_with(&["a"]).await;
        assert!(store.update_state("a", RunState::Routing).await.unwrap());
        assert!(!store.update_state("a", RunState::Routing).await.unwrap());
        assert!(matches!(
            store.update_state("a", RunState::Completed).await,
            Err(Error::InvalidTransition { .. })
        ));

        store.update_state("a", RunState::Running).await.unwrap();
        let run = store.get("a").await.unwrap();
        assert!(run.started_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = store_with(&["a"]).await;
        store.set_pid("a", 4242).await.unwrap();
        store.update_state("a", RunState::Failed).await.unwrap();

        let run = store.get("a").await.unwrap();
        assert!(run.completed_at.is_some());
        assert_eq!(run.pid, 0);

        assert!(store.update_state("a", RunState::Running).await.is_err());
        assert!(!store.set_pid("a", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_totals_include_terminal_runs() {
        let store = store_with(&["a", "b"]).await;
        store.append_cost("a", "plan", 100, 50, 0.25).await.unwrap();
        store.append_cost("b", "build", 10, 5, 0.5).await.unwrap();
        store.update_state("b", RunState::Failed).await.unwrap();

        assert!((store.total_cost().await - 0.75).abs() < 1e-9);
        assert_eq!(store.total_tokens().await, 165);

        store.remove("b").await.unwrap();
        assert_eq!(store.total_tokens().await, 150);
    }

    #[tokio::test]
    async fn test_mutation_notifies_subscribers() {
        let store = store_with(&["a"]).await;
        let mut rx = store.subscribe();
        let _ = rx.borrow_and_update();

        assert!(!store.append_cost("a", "plan", 0, 0, 0.0).await.unwrap());
        assert!(!rx.has_changed().unwrap());

        store.set_error("a", "boom").await.unwrap();
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_race() {
        let store = store_with(&["a", "b"]).await;
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            let id = if i % 2 == 0 { "a" } else { "b" };
            handles.push(tokio::spawn(async move {
                store.append_cost(id, "skill", 1, 1, 0.01).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.total_tokens().await, 100);
        assert_eq!(store.get("a").await.unwrap().tokens(), 50);
    }

    #[tokio::test]
    async fn test_follow_up_rejected_on_terminal_run() {
        let store = store_with(&["a"]).await;
        store.add_follow_up("a", "also add tests").await.unwrap();
        store.update_state("a", RunState::Rejected).await.unwrap();
        assert!(store.add_follow_up("a", "more").await.is_err());
        assert_eq!(store.get("a").await.unwrap().follow_up_prompts, vec!["also add tests"]);
    }

    #[tokio::test]
    async fn test_links_recorded() {
        let store = store_with(&["a"]).await;
        store.set_merge_status("a", "merged").await.unwrap();
        store
            .set_pr_url("a", "https://example.com/pull/7")
            .await
            .unwrap();
        store
            .set_dev_server_url("a", "http://localhost:3000")
            .await
            .unwrap();

        let run = store.get("a").await.unwrap();
        assert_eq!(run.merge_status.as_deref(), Some("merged"));
        assert_eq!(run.pr_url.as_deref(), Some("https://example.com/pull/7"));
        assert_eq!(run.dev_server_url.as_deref(), Some("http://localhost:3000"));
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let store = RunStore::new();
        assert!(matches!(
            store.update_state("nope", RunState::Routing).await,
            Err(Error::RunNotFound(_))
        ));
    }
}
