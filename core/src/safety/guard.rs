use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::Error;

/// Outcome of checking a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// Carries the first pattern, in input order, that matched
    Blocked { pattern: String },
}

impl Verdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    pub fn matched_pattern(&self) -> Option<&str> {
        match self {
            Self::Blocked { pattern } => Some(pattern),
            Self::Allowed => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    regex: Regex,
}

/// In-process matcher for destructive shell commands
#[derive(Debug, Clone, Default)]
pub struct SafetyGuard {
    rules: Vec<Rule>,
}

impl SafetyGuard {
    /// Compile each pattern as a case-insensitive regex.
    ///
    /// Compilation is best-effort: a pattern that fails is skipped and
    /// reported in the returned error, while every other pattern stays
    /// active in the guard.
    pub fn compile<I, S>(patterns: I) -> (Self, Option<Error>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        let mut failures = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => rules.push(Rule {
                    pattern: pattern.to_string(),
                    regex,
                }),
                Err(e) => {
                    warn!("Skipping invalid safety pattern {:?}: {}", pattern, e);
                    failures.push(format!("{:?}: {}", pattern, e));
                }
            }
        }

        let error = (!failures.is_empty()).then(|| Error::InvalidPatterns(failures));
        (Self { rules }, error)
    }

    pub fn check(&self, command: &str) -> Verdict {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(command))
            .map(|rule| Verdict::Blocked {
                pattern: rule.pattern.clone(),
            })
            .unwrap_or(Verdict::Allowed)
    }

    /// Patterns that compiled, in input order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
