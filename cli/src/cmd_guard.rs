use std::process::ExitCode;

use anyhow::Context;
use tracing::warn;

use agtop_core::safety::{self, SafetyGuard, BLOCKED_EXIT_CODE};
use agtop_core::AgtopConfig;

pub fn install(config: &AgtopConfig) -> anyhow::Result<ExitCode> {
    let report = safety::install(config).context("Failed to install safety guard")?;

    println!("Guard script: {}", report.script_path.display());
    if let Some(path) = &report.settings_path {
        println!("Runtime settings: {}", path.display());
    }
    for pattern in &report.dropped_patterns {
        println!("  not embedded in script (in-process only): {}", pattern);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn check(config: &AgtopConfig, command: &str) -> anyhow::Result<ExitCode> {
    let (guard, err) = SafetyGuard::compile(&config.safety_patterns);
    if let Some(e) = err {
        warn!("{}", e);
    }

    match guard.check(command).matched_pattern() {
        Some(pattern) => {
            println!("blocked: matches {}", pattern);
            Ok(ExitCode::from(BLOCKED_EXIT_CODE as u8))
        }
        None => {
            println!("allowed");
            Ok(ExitCode::SUCCESS)
        }
    }
}

pub fn script(config: &AgtopConfig) -> anyhow::Result<ExitCode> {
    print!("{}", safety::generate_script(config.safety_patterns.as_slice()));
    Ok(ExitCode::SUCCESS)
}
