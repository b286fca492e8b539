use std::process::ExitCode;

use anyhow::Context;
use tracing::warn;

use agent_runner::{Supervisor, WorkflowSpec};
use agtop_core::buffer::RunLogs;
use agtop_core::run::{Run, RunState, RunStore};
use agtop_core::AgtopConfig;

pub struct RunParams {
    pub prompt: String,
    pub workflow: String,
    pub skills: Vec<String>,
    pub model: Option<String>,
    pub auto_merge: bool,
    pub task_id: Option<String>,
}

impl RunParams {
    fn workflow(&self) -> WorkflowSpec {
        let workflow = WorkflowSpec::single(self.workflow.as_str())
            .with_skills(self.skills.iter().map(String::as_str))
            .with_auto_merge(self.auto_merge);
        match &self.model {
            Some(model) => workflow.with_model(model.as_str()),
            None => workflow,
        }
    }
}

pub async fn execute(config: AgtopConfig, params: RunParams) -> anyhow::Result<ExitCode> {
    let supervisor = Supervisor::new(config, RunStore::new())
        .await
        .context("Failed to start supervisor")?;

    let mut run = Run::new(params.prompt.as_str());
    if let Some(task_id) = &params.task_id {
        run = run.with_task_id(task_id.as_str());
    }
    let run_id = supervisor.submit_run(run).await?;
    println!("run {} started", run_id);

    let logs = supervisor.logs(&run_id).await;
    let mut changes = supervisor.store().subscribe();
    let mut printed = 0u64;

    if let Err(e) = supervisor.start(&run_id, params.workflow()).await {
        print_new_lines(&logs, &mut printed);
        return Err(e).context("Failed to start run");
    }

    let mut waiter = {
        let supervisor = supervisor.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { supervisor.wait(&run_id).await })
    };

    let run = loop {
        tokio::select! {
            finished = &mut waiter => {
                print_new_lines(&logs, &mut printed);
                break finished.context("Run supervisor task failed")??;
            }
            Ok(()) = changes.changed() => print_new_lines(&logs, &mut printed),
            _ = tokio::signal::ctrl_c() => {
                warn!(run_id = %run_id, "Interrupted, cancelling run");
                supervisor.cancel(&run_id).await?;
            }
        }
    };

    println!("{}", summary(&run));
    Ok(exit_code(run.state))
}

/// Print lines appended since the last call, skipping any already evicted
fn print_new_lines(logs: &RunLogs, printed: &mut u64) {
    let lines = logs.lines();
    let evicted = logs.ring().total_evicted();
    for line in &lines[unseen_from(lines.len(), evicted, *printed)..] {
        println!("{}", line);
    }
    *printed = evicted + lines.len() as u64;
}

/// Index into the current window of the first line not yet printed
fn unseen_from(window: usize, evicted: u64, printed: u64) -> usize {
    (printed.saturating_sub(evicted) as usize).min(window)
}

fn summary(run: &Run) -> String {
    let mut out = format!(
        "run {} {} ({} tokens, ${:.4})",
        run.id,
        run.state,
        run.tokens(),
        run.cost
    );
    if let Some(status) = &run.merge_status {
        out.push_str(&format!("\nmerge: {}", status));
    }
    if let Some(error) = &run.error {
        out.push_str(&format!("\nerror: {}", error));
    }
    if let Some(worktree) = &run.worktree {
        out.push_str(&format!("\nworktree: {}", worktree.display()));
    }
    out
}

fn exit_code(state: RunState) -> ExitCode {
    match state {
        RunState::Reviewing | RunState::Completed | RunState::Accepted => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
