//! Process supervisor - owns the agent subprocesses of every active run

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agtop_core::buffer::RunLogs;
use agtop_core::run::{Run, RunState, RunStore, SessionFile, SessionStore};
use agtop_core::AgtopConfig;
use git_worktree::{MergeOutcome, WorktreeError, WorktreeManager};

use crate::error::{Result, SupervisorError};
use crate::parser::create_parser;
use crate::process::{AgentProcess, CommandSpec, OutputReaderHandle, OutputSink};
use crate::recovery::{CleanupReport, OsProcessProbe, Reconciler};
use crate::signal;
use crate::workflow::{follow_up_prompt, WorkflowSpec, FOLLOW_UP_SKILL};

/// Skill name used for the supervisor's own log lines
const SUPERVISOR_SKILL: &str = "agtop";

/// Live workers of one run
struct Worker {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

/// Output views of one run
#[derive(Clone)]
struct RunBuffers {
    logs: Arc<RunLogs>,
    /// Set once the agent itself printed anything
    output_seen: Arc<AtomicBool>,
}

/// The worker's side of a registered run
struct WorkerHandle {
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    done: watch::Sender<bool>,
}

enum SkillResult {
    Finished,
    Cancelled,
    Failed(String),
}

struct Inner {
    config: AgtopConfig,
    store: RunStore,
    sessions: SessionStore,
    worktrees: WorktreeManager,
    workers: RwLock<HashMap<String, Worker>>,
    buffers: RwLock<HashMap<String, RunBuffers>>,
}

/// Spawns agent subprocesses inside run worktrees and drives each run's
/// workflow to a terminal or review state.
///
/// Cloning is cheap; clones share the same workers.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor for the repository at `config.project_root`
    pub async fn new(config: AgtopConfig, store: RunStore) -> Result<Self> {
        let worktrees =
            WorktreeManager::new_at(&config.project_root, &config.worktree_root).await?;
        let sessions = SessionStore::new(config.sessions_dir());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                sessions,
                worktrees,
                workers: RwLock::new(HashMap::new()),
                buffers: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    pub fn config(&self) -> &AgtopConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.inner.worktrees
    }

    /// Register a new run for `prompt` and persist it. Returns the run ID.
    pub async fn submit(&self, prompt: impl Into<String>) -> Result<String> {
        self.submit_run(Run::new(prompt)).await
    }

    /// Register a prepared run and persist it
    pub async fn submit_run(&self, run: Run) -> Result<String> {
        let id = run.id.clone();
        self.inner.store.add(run).await?;
        self.inner.persist(&id).await;
        info!(run_id = %id, "Run submitted");
        Ok(id)
    }

    /// Log buffers of a run, created on first use
    pub async fn logs(&self, run_id: &str) -> Arc<RunLogs> {
        self.inner.logs_for(run_id).await
    }

    /// Whether the run currently has live workers
    pub async fn is_active(&self, run_id: &str) -> bool {
        self.inner.workers.read().await.contains_key(run_id)
    }

    /// IDs of runs with live workers
    pub async fn active_runs(&self) -> Vec<String> {
        self.inner.workers.read().await.keys().cloned().collect()
    }

    /// Start executing `workflow` for a queued run.
    ///
    /// Creates the run's worktree when needed, spawns the first skill's
    /// subprocess and returns once it is running; the rest of the workflow
    /// proceeds in the background. Spawn and worktree failures mark the run
    /// `Failed` before the error is returned.
    pub async fn start(&self, run_id: &str, workflow: WorkflowSpec) -> Result<()> {
        let run = self.inner.get(run_id).await?;
        let handle = self.inner.register(run_id).await?;

        let next = if run.state == RunState::Reviewing {
            RunState::Running
        } else {
            RunState::Routing
        };
        let steps = workflow.steps().len() as u32;
        if let Err(e) = self.inner.begin(run_id, &workflow.name, steps, next).await {
            self.inner.release(run_id, handle).await;
            return Err(e);
        }

        let consumed = run.follow_up_prompts.len();
        let prompt = run.prompt.clone();
        Arc::clone(&self.inner)
            .launch(run, workflow, prompt, consumed, handle)
            .await
    }

    /// Stop the run's agent. Pausing a terminal or already paused run is a
    /// no-op and returns `Ok(false)`.
    pub async fn pause(&self, run_id: &str) -> Result<bool> {
        let run = self.inner.get(run_id).await?;
        if run.is_terminal() || run.state == RunState::Paused {
            return Ok(false);
        }

        self.inner.store.update_state(run_id, RunState::Paused).await?;

        if let Some(worker) = self.inner.workers.read().await.get(run_id) {
            worker.paused.send_replace(true);
        }
        // Without suspension the gate above only holds back the next skill
        if signal::CAN_SUSPEND && run.has_pid() {
            if let Err(e) = signal::suspend(run.pid) {
                warn!(run_id, "Could not suspend agent: {}", e);
            }
        }

        self.inner.logs_for(run_id).await.push_event(SUPERVISOR_SKILL, "paused");
        self.inner.persist(run_id).await;
        Ok(true)
    }

    /// Continue a paused run. Resuming anything else is a no-op.
    pub async fn resume(&self, run_id: &str) -> Result<bool> {
        let run = self.inner.get(run_id).await?;
        if run.state != RunState::Paused {
            return Ok(false);
        }

        if signal::CAN_SUSPEND && run.has_pid() {
            if let Err(e) = signal::resume(run.pid) {
                warn!(run_id, "Could not resume agent: {}", e);
            }
        }
        self.inner.store.update_state(run_id, RunState::Running).await?;
        if let Some(worker) = self.inner.workers.read().await.get(run_id) {
            worker.paused.send_replace(false);
        }

        self.inner.logs_for(run_id).await.push_event(SUPERVISOR_SKILL, "resumed");
        self.inner.persist(run_id).await;
        Ok(true)
    }

    /// Terminate the run's agent and wait for its workers to retire.
    ///
    /// The run ends `Rejected` if it produced output and `Failed` otherwise.
    /// Its worktree is left in place. Cancelling a terminal run is a no-op,
    /// and so is cancelling a merge in progress: merges run to completion.
    pub async fn cancel(&self, run_id: &str) -> Result<bool> {
        let run = self.inner.get(run_id).await?;
        if run.is_terminal() || run.state == RunState::Merging {
            return Ok(false);
        }

        let done = {
            let workers = self.inner.workers.read().await;
            workers.get(run_id).map(|w| {
                w.cancel.cancel();
                w.done.clone()
            })
        };

        match done {
            Some(done) => {
                info!(run_id, "Cancelling run");
                wait_done(done).await;
            }
            None => self.inner.finish_cancelled(run_id).await,
        }
        Ok(true)
    }

    /// Add a follow-up prompt.
    ///
    /// A run in review is re-entered with a single follow-up pass; a run
    /// still executing picks the prompt up once its workflow finishes.
    /// Returns whether a new pass was started.
    pub async fn follow_up(&self, run_id: &str, prompt: impl Into<String>) -> Result<bool> {
        self.inner.store.add_follow_up(run_id, prompt).await?;
        self.inner.persist(run_id).await;

        if self.inner.get(run_id).await?.state != RunState::Reviewing {
            return Ok(false);
        }
        // A live worker picks the prompt up before it retires
        let handle = match self.inner.register(run_id).await {
            Ok(handle) => handle,
            Err(SupervisorError::AlreadyRunning { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        let run = match self.inner.get(run_id).await {
            Ok(run) if run.state == RunState::Reviewing => run,
            other => {
                self.inner.release(run_id, handle).await;
                return other.map(|_| false);
            }
        };

        let model = self.inner.config.model.clone();
        let workflow = WorkflowSpec::follow_up(Some(run.model.clone()).filter(|m| !m.is_empty()).or(model));
        if let Err(e) = self
            .inner
            .begin(run_id, FOLLOW_UP_SKILL, 1, RunState::Running)
            .await
        {
            self.inner.release(run_id, handle).await;
            return Err(e);
        }

        let prompt = follow_up_prompt(&run.prompt, &run.follow_up_prompts);
        let consumed = run.follow_up_prompts.len();
        Arc::clone(&self.inner)
            .launch(run, workflow, prompt, consumed, handle)
            .await?;
        Ok(true)
    }

    /// Accept a reviewed run
    pub async fn accept(&self, run_id: &str) -> Result<()> {
        self.inner.store.update_state(run_id, RunState::Accepted).await?;
        self.inner.persist(run_id).await;
        Ok(())
    }

    /// Reject a reviewed run
    pub async fn reject(&self, run_id: &str) -> Result<()> {
        let run = self.inner.get(run_id).await?;
        if run.state != RunState::Reviewing {
            return Err(agtop_core::Error::InvalidTransition {
                run_id: run_id.to_string(),
                from: run.state,
                to: RunState::Rejected,
            }
            .into());
        }
        self.inner.store.update_state(run_id, RunState::Rejected).await?;
        self.inner.persist(run_id).await;
        Ok(())
    }

    /// Merge a reviewed run's branch into the main checkout
    pub async fn merge(&self, run_id: &str) -> Result<RunState> {
        let run = self.inner.get(run_id).await?;
        if self.is_active(run_id).await {
            return Err(SupervisorError::AlreadyRunning {
                run_id: run_id.to_string(),
            });
        }
        if run.state != RunState::Reviewing {
            return Err(agtop_core::Error::InvalidTransition {
                run_id: run_id.to_string(),
                from: run.state,
                to: RunState::Merging,
            }
            .into());
        }
        Ok(self.inner.merge_run(run_id).await)
    }

    /// Wait until the run's workers retire, then return the run
    pub async fn wait(&self, run_id: &str) -> Result<Run> {
        let done = self
            .inner
            .workers
            .read()
            .await
            .get(run_id)
            .map(|w| w.done.clone());
        if let Some(done) = done {
            wait_done(done).await;
        }
        self.inner.get(run_id).await
    }

    /// Reconcile persisted sessions and worktrees against this live store
    pub async fn cleanup(&self, dry_run: bool) -> CleanupReport {
        let report = Reconciler::new(&self.inner.sessions, &OsProcessProbe)
            .with_worktrees(&self.inner.worktrees)
            .with_store(&self.inner.store)
            .with_stale_after(self.inner.config.stale_after)
            .cleanup(dry_run)
            .await;

        if !dry_run {
            let mut buffers = self.inner.buffers.write().await;
            let mut dropped = Vec::new();
            for run_id in buffers.keys() {
                if !self.inner.store.contains(run_id).await {
                    dropped.push(run_id.clone());
                }
            }
            for run_id in dropped {
                buffers.remove(&run_id);
            }
        }
        report
    }

    /// Cancel every active run
    pub async fn shutdown(&self) {
        for run_id in self.active_runs().await {
            if let Err(e) = self.cancel(&run_id).await {
                warn!(run_id = %run_id, "Failed to cancel during shutdown: {}", e);
            }
        }
    }
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    // A dropped sender means the worker is gone too
    let _ = done.wait_for(|finished| *finished).await;
}

impl Inner {
    async fn get(&self, run_id: &str) -> Result<Run> {
        self.store
            .get(run_id)
            .await
            .ok_or_else(|| agtop_core::Error::RunNotFound(run_id.to_string()).into())
    }

    /// Claim the run for a new worker
    async fn register(&self, run_id: &str) -> Result<WorkerHandle> {
        let mut workers = self.workers.write().await;
        if workers.contains_key(run_id) {
            return Err(SupervisorError::AlreadyRunning {
                run_id: run_id.to_string(),
            });
        }

        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        workers.insert(
            run_id.to_string(),
            Worker {
                cancel: cancel.clone(),
                paused: paused_tx,
                done: done_rx,
            },
        );
        Ok(WorkerHandle {
            cancel,
            paused: paused_rx,
            done: done_tx,
        })
    }

    /// Drop the run's worker and wake anyone waiting on it
    async fn release(&self, run_id: &str, handle: WorkerHandle) {
        self.workers.write().await.remove(run_id);
        let _ = handle.done.send(true);
        debug!(run_id, "Run workers retired");
    }

    /// Record the workflow about to run and move the run into `next`
    async fn begin(&self, run_id: &str, workflow: &str, steps: u32, next: RunState) -> Result<()> {
        self.store.set_workflow(run_id, workflow, steps).await?;
        self.store.update_state(run_id, next).await?;
        Ok(())
    }

    /// Called when a worker's workflow is over. Follow-ups that arrived
    /// after the run reached review send it back to `Running` and keep the
    /// worker; otherwise the worker is removed. Returns the number of
    /// follow-ups consumed so far when the worker stays.
    async fn reopen_or_retire(&self, run_id: &str, reviewed: Option<usize>) -> Option<usize> {
        let mut workers = self.workers.write().await;
        if let (Some(consumed), Some(run)) = (reviewed, self.store.get(run_id).await) {
            if run.state == RunState::Reviewing && run.follow_up_prompts.len() > consumed {
                match self.store.update_state(run_id, RunState::Running).await {
                    Ok(_) => return Some(consumed),
                    Err(e) => warn!(run_id, "Cannot reopen run for follow-ups: {}", e),
                }
            }
        }
        workers.remove(run_id);
        None
    }

    async fn buffers_for(&self, run_id: &str) -> RunBuffers {
        if let Some(buffers) = self.buffers.read().await.get(run_id) {
            return buffers.clone();
        }
        let mut buffers = self.buffers.write().await;
        buffers
            .entry(run_id.to_string())
            .or_insert_with(|| RunBuffers {
                logs: Arc::new(RunLogs::new(
                    self.config.ring_capacity,
                    self.config.entry_capacity,
                    self.store.notifier().clone(),
                )),
                output_seen: Arc::new(AtomicBool::new(false)),
            })
            .clone()
    }

    async fn logs_for(&self, run_id: &str) -> Arc<RunLogs> {
        self.buffers_for(run_id).await.logs
    }

    /// Whether the agent ever printed anything for this run, in this
    /// process or (via its log files) in an earlier one
    async fn produced_output(&self, run_id: &str) -> bool {
        if self.buffers_for(run_id).await.output_seen.load(Ordering::Relaxed) {
            return true;
        }
        [
            self.config.stdout_log_path(run_id),
            self.config.stderr_log_path(run_id),
        ]
        .iter()
        .any(|path| std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false))
    }

    /// Write the run's session file. Failures are logged, never fatal.
    async fn persist(&self, run_id: &str) {
        let Some(mut run) = self.store.get(run_id).await else {
            return;
        };
        let now = Utc::now();
        run.saved_at = Some(now);

        let session = SessionFile::new(run).with_logs(
            self.config.stdout_log_path(run_id),
            self.config.stderr_log_path(run_id),
        );
        match self.sessions.save(&session) {
            Ok(()) => {
                if let Err(e) = self.store.mark_saved(run_id, now).await {
                    debug!(run_id, "Saved session for a run no longer held: {}", e);
                }
            }
            Err(e) => warn!(run_id, "Failed to persist session: {}", e),
        }
    }

    /// Record a failure on the run and move it to `Failed`
    async fn fail(&self, run_id: &str, message: &str) {
        error!(run_id, "Run failed: {}", message);
        self.logs_for(run_id)
            .await
            .push_event(SUPERVISOR_SKILL, &format!("failed: {}", message));
        if let Err(e) = self.store.set_error(run_id, message).await {
            warn!(run_id, "Failed to record error: {}", e);
        }
        if let Err(e) = self.store.update_state(run_id, RunState::Failed).await {
            warn!(run_id, "Failed to mark run failed: {}", e);
        }
        self.persist(run_id).await;
    }

    async fn finish_cancelled(&self, run_id: &str) {
        if self.store.get(run_id).await.map_or(true, |run| run.is_terminal()) {
            return;
        }
        let state = if self.produced_output(run_id).await {
            RunState::Rejected
        } else {
            RunState::Failed
        };
        self.logs_for(run_id)
            .await
            .push_event(SUPERVISOR_SKILL, "cancelled");

        if state == RunState::Failed {
            if let Err(e) = self.store.set_error(run_id, "cancelled").await {
                warn!(run_id, "Failed to record error: {}", e);
            }
        }
        if let Err(e) = self.store.update_state(run_id, state).await {
            warn!(run_id, "Failed to mark run cancelled: {}", e);
        }
        self.persist(run_id).await;
        info!(run_id, state = %state, "Run cancelled");
    }

    /// Worktree for the run, created on first start
    async fn ensure_worktree(&self, run: &Run) -> Result<PathBuf> {
        if let Some(path) = &run.worktree {
            if path.is_dir() {
                return Ok(path.clone());
            }
        }

        let branch = if run.branch.is_empty() {
            format!("agtop/{}", run.id)
        } else {
            run.branch.clone()
        };

        let record = match self.worktrees.create(&run.id, &branch).await {
            Ok(record) => record,
            Err(WorktreeError::WorktreeExists { path }) => self
                .worktrees
                .find(&run.id)
                .await?
                .ok_or(WorktreeError::WorktreeExists { path })?,
            Err(e) => return Err(e.into()),
        };

        self.store
            .set_worktree(&run.id, record.path.clone(), &record.branch)
            .await?;
        Ok(record.path)
    }

    /// Prepare the worktree, spawn the first skill and hand the rest of the
    /// workflow to a background task
    async fn launch(
        self: Arc<Self>,
        run: Run,
        workflow: WorkflowSpec,
        prompt: String,
        consumed_follow_ups: usize,
        handle: WorkerHandle,
    ) -> Result<()> {
        let run_id = run.id.clone();

        let worktree = match self.ensure_worktree(&run).await {
            Ok(path) => path,
            Err(e) => {
                self.fail(&run_id, &e.to_string()).await;
                self.release(&run_id, handle).await;
                return Err(e);
            }
        };
        if handle.cancel.is_cancelled() {
            self.finish_cancelled(&run_id).await;
            self.release(&run_id, handle).await;
            return Ok(());
        }

        let steps = workflow.steps();
        let Some(first_skill) = steps.first() else {
            self.release(&run_id, handle).await;
            return Ok(());
        };
        let first = match self
            .spawn_skill(&run_id, &workflow, 0, first_skill, &prompt, &worktree)
            .await
        {
            Ok(reader) => reader,
            Err(SupervisorError::RunEnded { .. }) => {
                self.release(&run_id, handle).await;
                return Ok(());
            }
            Err(e) => {
                self.fail(&run_id, &e.to_string()).await;
                self.release(&run_id, handle).await;
                return Err(e);
            }
        };
        self.persist(&run_id).await;

        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            let WorkerHandle {
                cancel,
                mut paused,
                done,
            } = handle;
            let mut reviewed = inner
                .drive(
                    &run_id,
                    &workflow,
                    &prompt,
                    &worktree,
                    first,
                    consumed_follow_ups,
                    &cancel,
                    &mut paused,
                )
                .await;
            while let Some(consumed) = inner.reopen_or_retire(&run_id, reviewed).await {
                reviewed = inner
                    .conclude(&run_id, &workflow, &worktree, consumed, &cancel, &mut paused)
                    .await;
            }
            let _ = done.send(true);
            debug!(run_id = %run_id, "Run workers retired");
        });

        Ok(())
    }

    /// Spawn the subprocess for one skill and start its readers
    async fn spawn_skill(
        &self,
        run_id: &str,
        workflow: &WorkflowSpec,
        index: usize,
        skill: &str,
        prompt: &str,
        worktree: &Path,
    ) -> Result<OutputReaderHandle> {
        if let Some(run) = self.store.get(run_id).await {
            if run.is_terminal() {
                return Err(SupervisorError::RunEnded {
                    run_id: run_id.to_string(),
                    state: run.state,
                });
            }
        }
        let total = workflow.steps().len() as u32;
        self.store
            .set_skill(run_id, skill, index as u32 + 1, total)
            .await?;

        let model = workflow.model.clone().or_else(|| self.config.model.clone());
        let spec = CommandSpec::for_runtime(
            &self.config.runtime,
            self.config.program(),
            model.as_deref(),
            &workflow.skill_prompt(skill, prompt),
            worktree,
        )
        .with_env("AGTOP_RUN_ID", run_id)
        .with_env("AGTOP_SKILL", skill);
        self.store
            .set_command(run_id, &spec.display(), model.as_deref().unwrap_or(""))
            .await?;

        let process = AgentProcess::spawn(&spec)?;
        let pid = process.pid();
        self.store.set_pid(run_id, pid).await?;

        if let Some(run) = self.store.get(run_id).await {
            if run.state == RunState::Routing {
                self.store.update_state(run_id, RunState::Running).await?;
            }
        }

        let buffers = self.buffers_for(run_id).await;
        buffers
            .logs
            .push_event(skill, &format!("started (pid {})", pid));

        let sink = OutputSink {
            run_id: run_id.to_string(),
            skill: skill.to_string(),
            store: self.store.clone(),
            logs: buffers.logs,
            output_seen: buffers.output_seen,
            stdout_log: Some(self.config.stdout_log_path(run_id)),
            stderr_log: Some(self.config.stderr_log_path(run_id)),
        };
        process.start_output_reader(sink, create_parser(&self.config.runtime))
    }

    async fn await_skill(
        &self,
        run_id: &str,
        skill: &str,
        handle: OutputReaderHandle,
        cancel: &CancellationToken,
    ) -> SkillResult {
        let result = handle
            .wait_or_cancel(cancel.clone(), self.config.cancel_grace)
            .await;
        if let Err(e) = self.store.set_pid(run_id, 0).await {
            debug!(run_id, "Failed to clear pid: {}", e);
        }

        match result {
            Ok((_, true)) => SkillResult::Cancelled,
            Ok((outcome, false)) if outcome.succeeded() => {
                self.logs_for(run_id).await.push_event(skill, "finished");
                SkillResult::Finished
            }
            Ok((outcome, false)) => SkillResult::Failed(outcome.failure_message()),
            Err(e) => SkillResult::Failed(e.to_string()),
        }
    }

    /// Block while the run is paused between skills. False when cancelled.
    async fn wait_unpaused(
        &self,
        cancel: &CancellationToken,
        paused: &mut watch::Receiver<bool>,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            res = paused.wait_for(|p| !*p) => res.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }

    /// Run one skill to completion, spawning it unless already spawned
    #[allow(clippy::too_many_arguments)]
    async fn run_skill(
        &self,
        run_id: &str,
        workflow: &WorkflowSpec,
        index: usize,
        skill: &str,
        prompt: &str,
        worktree: &Path,
        spawned: Option<OutputReaderHandle>,
        cancel: &CancellationToken,
        paused: &mut watch::Receiver<bool>,
    ) -> SkillResult {
        let handle = match spawned {
            Some(handle) => handle,
            None => {
                if !self.wait_unpaused(cancel, paused).await {
                    return SkillResult::Cancelled;
                }
                match self
                    .spawn_skill(run_id, workflow, index, skill, prompt, worktree)
                    .await
                {
                    Ok(handle) => handle,
                    Err(SupervisorError::RunEnded { .. }) => return SkillResult::Cancelled,
                    Err(e) => return SkillResult::Failed(e.to_string()),
                }
            }
        };
        self.await_skill(run_id, skill, handle, cancel).await
    }

    /// Background part of a run: remaining skills, queued follow-ups, then
    /// review or merge. Returns the consumed follow-up count when the run
    /// ended up in review.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run_id: &str,
        workflow: &WorkflowSpec,
        prompt: &str,
        worktree: &Path,
        first: OutputReaderHandle,
        consumed_follow_ups: usize,
        cancel: &CancellationToken,
        paused: &mut watch::Receiver<bool>,
    ) -> Option<usize> {
        let mut spawned = Some(first);
        for (index, skill) in workflow.steps().iter().enumerate() {
            let result = self
                .run_skill(
                    run_id,
                    workflow,
                    index,
                    skill,
                    prompt,
                    worktree,
                    spawned.take(),
                    cancel,
                    paused,
                )
                .await;
            if !self.settle(run_id, result).await {
                return None;
            }
        }

        self.conclude(run_id, workflow, worktree, consumed_follow_ups, cancel, paused)
            .await
    }

    /// Follow-ups that arrived while the workflow was executing, then
    /// review or merge
    async fn conclude(
        &self,
        run_id: &str,
        workflow: &WorkflowSpec,
        worktree: &Path,
        mut consumed_follow_ups: usize,
        cancel: &CancellationToken,
        paused: &mut watch::Receiver<bool>,
    ) -> Option<usize> {
        loop {
            let Some(run) = self.store.get(run_id).await else {
                return None;
            };
            if run.follow_up_prompts.len() <= consumed_follow_ups {
                break;
            }
            consumed_follow_ups = run.follow_up_prompts.len();

            let pass = WorkflowSpec::follow_up(workflow.model.clone());
            let pass_prompt = follow_up_prompt(&run.prompt, &run.follow_up_prompts);
            let result = self
                .run_skill(
                    run_id,
                    &pass,
                    0,
                    FOLLOW_UP_SKILL,
                    &pass_prompt,
                    worktree,
                    None,
                    cancel,
                    paused,
                )
                .await;
            if !self.settle(run_id, result).await {
                return None;
            }
        }

        if cancel.is_cancelled() {
            self.finish_cancelled(run_id).await;
            return None;
        }
        if workflow.auto_merge {
            self.merge_run(run_id).await;
            return None;
        }

        if let Err(e) = self.store.update_state(run_id, RunState::Reviewing).await {
            warn!(run_id, "Failed to move run to review: {}", e);
            return None;
        }
        self.logs_for(run_id)
            .await
            .push_event(SUPERVISOR_SKILL, "ready for review");
        self.persist(run_id).await;
        Some(consumed_follow_ups)
    }

    /// Apply a skill result. True when the workflow should continue.
    async fn settle(&self, run_id: &str, result: SkillResult) -> bool {
        match result {
            SkillResult::Finished => {
                self.persist(run_id).await;
                true
            }
            SkillResult::Cancelled => {
                self.finish_cancelled(run_id).await;
                false
            }
            SkillResult::Failed(message) => {
                self.fail(run_id, &message).await;
                false
            }
        }
    }

    /// Commit leftovers in the run worktree and merge its branch.
    ///
    /// Ends `Completed` on success, `Failed` on conflict.
    async fn merge_run(&self, run_id: &str) -> RunState {
        if let Err(e) = self.store.update_state(run_id, RunState::Merging).await {
            warn!(run_id, "Cannot merge: {}", e);
            return self
                .store
                .get(run_id)
                .await
                .map(|r| r.state)
                .unwrap_or(RunState::Failed);
        }
        let logs = self.logs_for(run_id).await;
        logs.push_event(SUPERVISOR_SKILL, "merging");
        self.persist(run_id).await;

        let outcome = match self.store.get(run_id).await {
            Some(run) => self.merge_branch(&run).await,
            None => return RunState::Failed,
        };

        let final_state = match outcome {
            Ok(MergeOutcome::Merged { commit }) => {
                logs.push_event(SUPERVISOR_SKILL, &format!("merged as {}", commit));
                let _ = self.store.set_merge_status(run_id, "merged").await;
                RunState::Completed
            }
            Ok(MergeOutcome::Conflict { message }) => {
                logs.push_event(SUPERVISOR_SKILL, &format!("merge conflict: {}", message));
                let _ = self
                    .store
                    .set_merge_status(run_id, format!("conflict: {}", message))
                    .await;
                let _ = self
                    .store
                    .set_error(run_id, format!("merge conflict: {}", message))
                    .await;
                RunState::Failed
            }
            Err(e) => {
                logs.push_event(SUPERVISOR_SKILL, &format!("merge failed: {}", e));
                let _ = self.store.set_error(run_id, e.to_string()).await;
                RunState::Failed
            }
        };

        if let Err(e) = self.store.update_state(run_id, final_state).await {
            warn!(run_id, "Failed to finish merge: {}", e);
        }
        self.persist(run_id).await;
        final_state
    }

    async fn merge_branch(&self, run: &Run) -> Result<MergeOutcome> {
        if let Some(worktree) = &run.worktree {
            if self.worktrees.has_uncommitted_changes(worktree).await? {
                let message = format!("agtop: {}", run.prompt_preview(60));
                self.worktrees.commit_all(worktree, &message).await?;
            }
        }
        let message = format!("Merge agtop run {}", run.id);
        Ok(self.worktrees.merge_branch(&run.branch, &message).await?)
    }
}
