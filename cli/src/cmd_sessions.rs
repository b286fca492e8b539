use std::process::ExitCode;

use anyhow::Context;

use agtop_core::run::{SessionFile, SessionStore};
use agtop_core::AgtopConfig;

pub fn execute(config: &AgtopConfig, json: bool) -> anyhow::Result<ExitCode> {
    println!("{}", render(config, json)?);
    Ok(ExitCode::SUCCESS)
}

/// Persisted sessions of the project, as a table or a JSON array of runs
fn render(config: &AgtopConfig, json: bool) -> anyhow::Result<String> {
    let store = SessionStore::new(config.sessions_dir());
    let sessions = store
        .load()
        .with_context(|| format!("Failed to load sessions from {}", store.dir().display()))?;

    if json {
        let runs: Vec<_> = sessions.iter().map(|s| &s.run).collect();
        return Ok(serde_json::to_string_pretty(&runs)?);
    }
    if sessions.is_empty() {
        return Ok("No sessions.".to_string());
    }
    Ok(sessions
        .iter()
        .map(format_session)
        .collect::<Vec<_>>()
        .join("\n"))
}

fn format_session(session: &SessionFile) -> String {
    let run = &session.run;
    let saved = run
        .saved_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<10} {:<10} {:>8} ${:<7.2} {}  {}",
        run.id,
        run.state.as_str(),
        run.tokens(),
        run.cost,
        saved,
        run.prompt_preview(50)
    )
}
