//! Run lifecycle state machine

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
///
/// ```text
/// Queued -> Routing -> Running <-> Paused
/// Running | Paused -> Reviewing -> {Accepted, Rejected}
/// Running -> Merging -> Completed
/// any non-terminal -> Failed | Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Submitted, no subprocess yet
    #[default]
    Queued,
    /// Worktree and command are being prepared
    Routing,
    /// An agent subprocess is executing a skill
    Running,
    /// The agent subprocess is stopped by the user
    Paused,
    /// Work finished, waiting for the user to accept or reject
    Reviewing,
    /// The run branch is being merged back
    Merging,
    Completed,
    Accepted,
    Failed,
    Rejected,
}

impl RunState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Accepted | Self::Failed | Self::Rejected
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Rejected) {
            return true;
        }

        matches!(
            (*self, next),
            (Queued, Routing)
                | (Routing, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Reviewing)
                | (Running, Reviewing)
                | (Running, Merging)
                | (Reviewing, Running)
                | (Reviewing, Merging)
                | (Reviewing, Accepted)
                | (Merging, Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Routing => "routing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Reviewing => "reviewing",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Accepted => "accepted",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RunState; 10] = [
        RunState::Queued,
        RunState::Routing,
        RunState::Running,
        RunState::Paused,
        RunState::Reviewing,
        RunState::Merging,
        RunState::Completed,
        RunState::Accepted,
        RunState::Failed,
        RunState::Rejected,
    ];

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                &RunState::Completed,
                &RunState::Accepted,
                &RunState::Failed,
                &RunState::Rejected
            ]
        );
    }

    #[test]
    fn test_terminal_never_transitions() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_happy_path() {
        assert!(RunState::Queued.can_transition_to(RunState::Routing));
        assert!(RunState::Routing.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Paused));
        assert!(RunState::Paused.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Reviewing));
        assert!(RunState::Paused.can_transition_to(RunState::Reviewing));
        assert!(RunState::Reviewing.can_transition_to(RunState::Accepted));
        assert!(RunState::Running.can_transition_to(RunState::Merging));
        assert!(RunState::Merging.can_transition_to(RunState::Completed));
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        assert!(!RunState::Queued.can_transition_to(RunState::Running));
        assert!(!RunState::Paused.can_transition_to(RunState::Merging));
        assert!(!RunState::Running.can_transition_to(RunState::Completed));
        assert!(!RunState::Queued.can_transition_to(RunState::Accepted));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(RunState::Failed));
            assert!(from.can_transition_to(RunState::Rejected));
        }
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&RunState::Reviewing).unwrap();
        assert_eq!(json, "\"reviewing\"");
        let state: RunState = serde_json::from_str("\"merging\"").unwrap();
        assert_eq!(state, RunState::Merging);
    }
}
