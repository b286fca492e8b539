//! Workflow description: which skills a run executes, in order

use serde::{Deserialize, Serialize};

/// Name given to the single skill of a follow-up pass
pub const FOLLOW_UP_SKILL: &str = "follow-up";

/// Sequence of skills executed for one run, one subprocess per skill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub auto_merge: bool,
}

impl Default for WorkflowSpec {
    fn default() -> Self {
        Self::single("default")
    }
}

impl WorkflowSpec {
    /// A workflow that runs the prompt once
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skills: Vec::new(),
            model: None,
            auto_merge: false,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_auto_merge(mut self, auto_merge: bool) -> Self {
        self.auto_merge = auto_merge;
        self
    }

    /// The follow-up pass for a run already in review
    pub fn follow_up(model: Option<String>) -> Self {
        Self {
            name: FOLLOW_UP_SKILL.to_string(),
            skills: vec![FOLLOW_UP_SKILL.to_string()],
            model,
            auto_merge: false,
        }
    }

    /// Skills to execute; an empty list runs once under the workflow name
    pub fn steps(&self) -> Vec<String> {
        if self.skills.is_empty() {
            vec![self.name.clone()]
        } else {
            self.skills.clone()
        }
    }

    /// Prompt handed to the agent for one skill
    pub fn skill_prompt(&self, skill: &str, prompt: &str) -> String {
        if self.skills.is_empty() {
            prompt.to_string()
        } else {
            format!("You are running the \"{}\" step of the {} workflow.\n\n{}", skill, self.name, prompt)
        }
    }
}

/// Prompt for a follow-up pass: the original task plus every follow-up so far
pub fn follow_up_prompt(original: &str, follow_ups: &[String]) -> String {
    let mut prompt = format!("Original task:\n{}\n", original);
    for (i, follow_up) in follow_ups.iter().enumerate() {
        prompt.push_str(&format!("\nFollow-up {}:\n{}\n", i + 1, follow_up));
    }
    prompt.push_str("\nAddress the latest follow-up in the current working tree.");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_skills_runs_once() {
        let wf = WorkflowSpec::single("quick");
        assert_eq!(wf.steps(), vec!["quick"]);
        assert_eq!(wf.skill_prompt("quick", "fix it"), "fix it");
    }

    #[test]
    fn test_skill_prompt_frames_skill() {
        let wf = WorkflowSpec::single("build").with_skills(["plan", "code"]);
        assert_eq!(wf.steps(), vec!["plan", "code"]);
        let prompt = wf.skill_prompt("code", "add a flag");
        assert!(prompt.contains("\"code\" step of the build workflow"));
        assert!(prompt.ends_with("add a flag"));
    }

    #[test]
    fn test_follow_up_prompt_lists_all() {
        let prompt = follow_up_prompt("fix bug", &["add test".to_string(), "rename".to_string()]);
        assert!(prompt.starts_with("Original task:\nfix bug"));
        assert!(prompt.contains("Follow-up 1:\nadd test"));
        assert!(prompt.contains("Follow-up 2:\nrename"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let wf: WorkflowSpec = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(wf.skills.is_empty());
        assert!(!wf.auto_merge);
    }
}
