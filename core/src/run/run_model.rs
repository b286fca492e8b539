//! Run - one attempted agent task
//!
//! The registry holds the authoritative copy; everything handed out is a
//! clone, and the same struct is what lands in a session file.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::state::RunState;
use crate::{Error, Result};

/// Token and cost totals attributed to one skill
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SkillCost {
    pub name: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}

impl SkillCost {
    pub fn tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Run {
    /// Stable run ID; also the worktree directory name
    pub id: String,

    /// External ticket key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    pub state: RunState,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time this run was written to its session file
    pub saved_at: Option<DateTime<Utc>>,

    pub branch: String,
    pub worktree: Option<PathBuf>,
    /// OS process ID of the current agent subprocess; `<= 0` means none
    pub pid: i32,
    pub command: String,
    pub workflow: String,
    pub current_skill: String,
    pub skill_index: u32,
    pub skill_total: u32,
    pub model: String,

    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub skill_costs: Vec<SkillCost>,

    pub prompt: String,
    pub follow_up_prompts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_server_url: Option<String>,
}

impl Run {
    /// Create a queued run with a fresh ID
    pub fn new(prompt: impl Into<String>) -> Self {
        Self::with_id(generate_run_id(), prompt)
    }

    /// Create a queued run with a specific ID
    pub fn with_id(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            branch: format!("agtop/{}", id),
            id,
            prompt: prompt.into(),
            created_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the run claims a live subprocess
    pub fn has_pid(&self) -> bool {
        !self.is_terminal() && self.pid > 0
    }

    /// Total tokens in both directions
    pub fn tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }

    /// Wall-clock time since start, frozen at completion
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(started).max(Duration::zero()))
    }

    /// Prompt shortened for one-line listings
    pub fn prompt_preview(&self, max_chars: usize) -> String {
        let first_line = self.prompt.lines().next().unwrap_or_default();
        if first_line.chars().count() > max_chars {
            let cut: String = first_line.chars().take(max_chars).collect();
            format!("{}...", cut)
        } else {
            first_line.to_string()
        }
    }

    pub(crate) fn add_cost(&mut self, skill: &str, tokens_in: u64, tokens_out: u64, cost: f64) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self.cost += cost;

        match self.skill_costs.iter_mut().find(|s| s.name == skill) {
            Some(entry) => {
                entry.tokens_in += tokens_in;
                entry.tokens_out += tokens_out;
                entry.cost += cost;
            }
            None => self.skill_costs.push(SkillCost {
                name: skill.to_string(),
                tokens_in,
                tokens_out,
                cost,
            }),
        }
    }
}

/// Short random ID: the first eight hex digits of a v4 UUID
pub fn generate_run_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Run IDs double as file and directory names.
pub fn validate_run_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid run ID: {:?}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_queued() {
        let run = Run::new("Fix the login bug");
        assert_eq!(run.state, RunState::Queued);
        assert_eq!(run.id.len(), 8);
        assert_eq!(run.branch, format!("agtop/{}", run.id));
        assert!(!run.is_terminal());
        assert!(!run.has_pid());
    }

    #[test]
    fn test_add_cost_merges_by_skill() {
        let mut run = Run::new("x");
        run.add_cost("plan", 100, 20, 0.01);
        run.add_cost("build", 50, 5, 0.02);
        run.add_cost("plan", 10, 2, 0.005);

        assert_eq!(run.tokens(), 187);
        assert!((run.cost - 0.035).abs() < 1e-9);
        assert_eq!(run.skill_costs.len(), 2);
        assert_eq!(run.skill_costs[0].name, "plan");
        assert_eq!(run.skill_costs[0].tokens(), 132);
        assert_eq!(run.skill_costs[1].name, "build");
    }

    #[test]
    fn test_terminal_run_has_no_pid() {
        let mut run = Run::new("x");
        run.pid = 1234;
        assert!(run.has_pid());
        run.state = RunState::Failed;
        assert!(!run.has_pid());
    }

    #[test]
    fn test_validate_run_id() {
        assert!(validate_run_id("a1b2c3d4").is_ok());
        assert!(validate_run_id("run_01-x").is_ok());
        assert!(validate_run_id("").is_err());
        assert!(validate_run_id("../etc").is_err());
        assert!(validate_run_id("a/b").is_err());
        assert!(validate_run_id(".hidden").is_err());
    }

    #[test]
    fn test_prompt_preview() {
        let run = Run::new("abcdefghij\nsecond line");
        assert_eq!(run.prompt_preview(4), "abcd...");
        assert_eq!(run.prompt_preview(20), "abcdefghij");
    }

    #[test]
    fn test_deserialize_tolerates_missing_fields() {
        let run: Run = serde_json::from_str(r#"{"id":"abc","state":"running","pid":42}"#).unwrap();
        assert_eq!(run.id, "abc");
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.pid, 42);
        assert!(run.follow_up_prompts.is_empty());
    }
}
