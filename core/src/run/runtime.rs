use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Agent runtime used to execute a run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AgentRuntime {
    #[default]
    ClaudeCode,
    OpenCode,
    /// Arbitrary program; the prompt is passed as the last argument
    Custom { program: String, args: Vec<String> },
}

impl AgentRuntime {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Ok(Self::ClaudeCode),
            "opencode" => Ok(Self::OpenCode),
            _ => Err(Error::InvalidInput(format!("Invalid agent runtime: {}", s))),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::OpenCode => "opencode",
            Self::Custom { program, .. } => program,
        }
    }

    /// Default executable for this runtime
    pub fn program(&self) -> &str {
        match self {
            Self::ClaudeCode => "claude",
            Self::OpenCode => "opencode",
            Self::Custom { program, .. } => program,
        }
    }

    /// Arguments placed before the prompt
    pub fn args(&self, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = match self {
            Self::ClaudeCode => ["-p", "--output-format", "stream-json", "--verbose"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            Self::OpenCode => ["run", "--format", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            Self::Custom { args, .. } => args.clone(),
        };

        if let Some(model) = model.filter(|m| !m.is_empty()) {
            if !matches!(self, Self::Custom { .. }) {
                args.push("--model".to_string());
                args.push(model.to_string());
            }
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_from_str() {
        assert_eq!(AgentRuntime::from_str("claude").unwrap(), AgentRuntime::ClaudeCode);
        assert_eq!(AgentRuntime::from_str("OpenCode").unwrap(), AgentRuntime::OpenCode);
        assert!(AgentRuntime::from_str("unknown").is_err());
    }

    #[test]
    fn test_claude_args_include_model() {
        let args = AgentRuntime::ClaudeCode.args(Some("sonnet"));
        assert_eq!(args.first().map(String::as_str), Some("-p"));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "sonnet"));
    }

    #[test]
    fn test_custom_args_untouched_by_model() {
        let runtime = AgentRuntime::Custom {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo hi".to_string()],
        };
        assert_eq!(runtime.args(Some("sonnet")), vec!["-c", "echo hi"]);
        assert_eq!(runtime.program(), "sh");
    }
}
