//! Events extracted from agent output

use serde::{Deserialize, Serialize};

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One thing a parser found in a line of agent output
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    /// Line to store exactly as received
    Raw(String),
    /// Message to store as a `[HH:MM:SS skill] message` line
    Message(String),
    /// Supplementary content attached to the newest entry
    Detail(String),
    /// Token and cost accounting for the current skill
    Usage {
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    },
    /// Structured completion signal from the agent
    Completed {
        success: bool,
        summary: Option<String>,
    },
}

/// What a finished skill process reported about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub success: bool,
    pub summary: Option<String>,
}

/// Outcome of one agent subprocess, combining exit status and output
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
    /// Last completion signal seen on stdout
    pub completion: Option<Completion>,
}

impl ProcessOutcome {
    /// A structured completion signal wins over the exit status
    pub fn succeeded(&self) -> bool {
        match &self.completion {
            Some(c) => c.success && self.exit_code.map_or(true, |code| code == 0),
            None => self.exit_code == Some(0),
        }
    }

    /// Human-readable failure reason
    pub fn failure_message(&self) -> String {
        if let Some(Completion {
            success: false,
            summary: Some(summary),
        }) = &self.completion
        {
            return summary.clone();
        }
        match self.exit_code {
            Some(code) => format!("agent exited with status {}", code),
            None => "agent terminated by signal".to_string(),
        }
    }
}
