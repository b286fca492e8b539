//! agtop - run supervision for coding agents
//!
//! Headless entry point: cleanup, guard management, single supervised runs
//! and session listing. Logs go to stderr; command output goes to stdout.

mod cmd_cleanup;
mod cmd_guard;
mod cmd_run;
mod cmd_sessions;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agtop_core::AgtopConfig;

const DEFAULT_LOG_FILTER: &str = "agtop=info,agent_runner=info,git_worktree=warn,agtop_core=info";

#[derive(Parser)]
#[command(name = "agtop", version, about = "Supervise coding agents in isolated worktrees")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remove stale and dead sessions and orphaned worktrees
    Cleanup {
        /// Report what would be removed without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage the command safety guard
    Guard {
        #[command(subcommand)]
        action: GuardCommand,
    },
    /// Supervise one run to completion, streaming its output
    Run {
        /// Task prompt for the agent
        prompt: String,
        /// Workflow name
        #[arg(long, default_value = "default")]
        workflow: String,
        /// Skills to run in order (repeatable)
        #[arg(long = "skill")]
        skills: Vec<String>,
        /// Model override
        #[arg(long)]
        model: Option<String>,
        /// Merge the run branch when the workflow succeeds
        #[arg(long)]
        auto_merge: bool,
        /// External ticket key
        #[arg(long)]
        task: Option<String>,
    },
    /// List persisted sessions
    Sessions {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GuardCommand {
    /// Write the guard script and register it with the agent runtime
    Install,
    /// Check a command against the configured patterns (exit 2 when blocked)
    Check {
        /// Command line to check
        command: String,
    },
    /// Print the generated guard script
    Script,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(project: Option<PathBuf>) -> anyhow::Result<AgtopConfig> {
    let root = match project {
        Some(root) => root,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    Ok(AgtopConfig::for_project(root, env!("CARGO_PKG_VERSION")).apply_env())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();
    let config = load_config(cli.project)?;

    match cli.cmd {
        Command::Cleanup { dry_run } => cmd_cleanup::execute(&config, dry_run).await,
        Command::Guard { action } => match action {
            GuardCommand::Install => cmd_guard::install(&config),
            GuardCommand::Check { command } => cmd_guard::check(&config, &command),
            GuardCommand::Script => cmd_guard::script(&config),
        },
        Command::Run {
            prompt,
            workflow,
            skills,
            model,
            auto_merge,
            task,
        } => {
            let params = cmd_run::RunParams {
                prompt,
                workflow,
                skills,
                model,
                auto_merge,
                task_id: task,
            };
            cmd_run::execute(config, params).await
        }
        Command::Sessions { json } => cmd_sessions::execute(&config, json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_skills() {
        let cli = Cli::try_parse_from([
            "agtop", "run", "fix the bug", "--skill", "plan", "--skill", "code", "--auto-merge",
        ])
        .unwrap();
        match cli.cmd {
            Command::Run {
                prompt,
                skills,
                auto_merge,
                workflow,
                ..
            } => {
                assert_eq!(prompt, "fix the bug");
                assert_eq!(skills, vec!["plan", "code"]);
                assert!(auto_merge);
                assert_eq!(workflow, "default");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_global_project_after_subcommand() {
        let cli = Cli::try_parse_from(["agtop", "cleanup", "--dry-run", "--project", "/tmp/x"]).unwrap();
        assert_eq!(cli.project, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.cmd, Command::Cleanup { dry_run: true }));
    }
}
