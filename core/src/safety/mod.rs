//! Command safety guard
//!
//! Gates destructive shell commands an agent may attempt. The same pattern
//! list drives the in-process [`SafetyGuard`] and the generated hook script
//! the agent runtime executes before each shell tool call.

mod guard;
mod script;
mod settings;

pub use guard::{SafetyGuard, Verdict};
pub use script::{
    generate_script, is_script_safe, partition_patterns, ALLOWED_EXIT_CODE, BLOCKED_EXIT_CODE,
};
pub use settings::{
    generate_opencode_settings, generate_settings, merge_settings, ClaudePermissions,
    ClaudeSettings, HookCommand, HookMatcher, OpenCodePermission, OpenCodeSettings, PRE_TOOL_USE,
};

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::AgtopConfig;
use crate::run::AgentRuntime;
use crate::{Error, Result};

/// Patterns blocked unless the user configures otherwise
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"rm\s+-[a-z]*[rf][a-z]*\s+(/|~)",
    r"git\s+push\s+.*(--force|-f\b)",
    r"git\s+reset\s+--hard",
    r"DROP\s+(TABLE|DATABASE)",
    r"mkfs(\.|\s)",
    r"dd\s+.*of=/dev/",
    r"chmod\s+(-R\s+)?777\s+/",
    r"(curl|wget)\s.*\|\s*(sudo\s+)?(ba|z)?sh\b",
    r":\(\)\s*\{\s*:\|:&\s*\};:",
];

/// What [`install`] wrote
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub script_path: PathBuf,
    pub settings_path: Option<PathBuf>,
    /// Patterns left out of the script (still enforced in-process)
    pub dropped_patterns: Vec<String>,
}

/// Write the guard script and register it with the configured runtime.
pub fn install(config: &AgtopConfig) -> Result<InstallReport> {
    let script_path = config.guard_script_path();
    let (_, dropped) = partition_patterns(config.safety_patterns.as_slice());
    for pattern in &dropped {
        warn!("Safety pattern {:?} is not shell-safe; enforced in-process only", pattern);
    }

    write_script(&script_path, &generate_script(config.safety_patterns.as_slice()))?;
    info!("Installed safety guard at {}", script_path.display());

    let settings_path = match &config.runtime {
        AgentRuntime::ClaudeCode => {
            let path = config.project_root.join(".claude").join("settings.json");
            let command = script_command(config, &script_path);
            install_claude_settings(&path, &generate_settings(&command))?;
            Some(path)
        }
        AgentRuntime::OpenCode => {
            let path = config.project_root.join("opencode.json");
            if path.exists() {
                info!("Leaving existing {} untouched", path.display());
                None
            } else {
                let data = serde_json::to_vec_pretty(&generate_opencode_settings())?;
                fs::write(&path, data)?;
                Some(path)
            }
        }
        AgentRuntime::Custom { .. } => None,
    };

    Ok(InstallReport {
        script_path,
        settings_path,
        dropped_patterns: dropped.into_iter().map(String::from).collect(),
    })
}

/// Path the runtime should invoke, relative to the project when possible
fn script_command(config: &AgtopConfig, script_path: &Path) -> String {
    script_path
        .strip_prefix(&config.project_root)
        .unwrap_or(script_path)
        .display()
        .to_string()
}

fn write_script(path: &Path, script: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn install_claude_settings(path: &Path, ours: &ClaudeSettings) -> Result<()> {
    let existing = if path.exists() {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::storage(path, format!("Refusing to overwrite unparseable settings: {}", e))
        })?
    } else {
        ClaudeSettings::default()
    };

    let merged = merge_settings(existing, ours);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec_pretty(&merged)?)?;
    Ok(())
}
