//! Configuration for agtop
//!
//! Everything the supervisor, reconciler and guard need is carried in one
//! typed struct; the binary builds it and passes it down. Nothing here
//! reads ambient globals except [`AgtopConfig::apply_env`], which the caller
//! invokes explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::run::AgentRuntime;
use crate::safety::DEFAULT_PATTERNS;

/// Name of the per-project state directory
pub const STATE_DIR_NAME: &str = ".agtop";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgtopConfig {
    /// Root of the git repository agents work on
    pub project_root: PathBuf,
    /// Sessions, logs and hooks live under here
    pub state_dir: PathBuf,
    /// One worktree per run is created under here
    pub worktree_root: PathBuf,
    pub runtime: AgentRuntime,
    /// Overrides the runtime's default executable
    pub runtime_binary: Option<String>,
    pub model: Option<String>,
    pub ring_capacity: usize,
    pub entry_capacity: usize,
    /// How long a cancelled agent gets between SIGTERM and SIGKILL
    #[serde(with = "duration_secs")]
    pub cancel_grace: Duration,
    /// Terminal sessions older than this are swept by cleanup
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,
    pub safety_patterns: Vec<String>,
    /// Build version, passed in by the binary
    pub version: String,
}

impl Default for AgtopConfig {
    fn default() -> Self {
        Self::for_project(".", "0.0.0")
    }
}

impl AgtopConfig {
    /// Defaults for a project rooted at `root`
    pub fn for_project(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        let project_root = root.into();
        let state_dir = project_root.join(STATE_DIR_NAME);
        Self {
            worktree_root: state_dir.join("worktrees"),
            state_dir,
            project_root,
            runtime: AgentRuntime::default(),
            runtime_binary: None,
            model: None,
            ring_capacity: 5000,
            entry_capacity: 2000,
            cancel_grace: Duration::from_secs(5),
            stale_after: Duration::from_secs(7 * 24 * 60 * 60),
            safety_patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            version: version.into(),
        }
    }

    /// Apply `AGTOP_*` environment overrides
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("AGTOP_STATE_DIR") {
            let dir = PathBuf::from(dir);
            if self.worktree_root == self.state_dir.join("worktrees") {
                self.worktree_root = dir.join("worktrees");
            }
            self.state_dir = dir;
        }
        if let Ok(dir) = std::env::var("AGTOP_WORKTREE_ROOT") {
            self.worktree_root = PathBuf::from(dir);
        }
        if let Ok(runtime) = std::env::var("AGTOP_RUNTIME") {
            match AgentRuntime::from_str(&runtime) {
                Ok(runtime) => self.runtime = runtime,
                Err(e) => warn!("Ignoring AGTOP_RUNTIME: {}", e),
            }
        }
        if let Ok(model) = std::env::var("AGTOP_MODEL") {
            self.model = Some(model).filter(|m| !m.is_empty());
        }
        self
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.state_dir.join("hooks")
    }

    pub fn guard_script_path(&self) -> PathBuf {
        self.hooks_dir().join("safety-guard.sh")
    }

    pub fn stdout_log_path(&self, run_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.stdout.log", run_id))
    }

    pub fn stderr_log_path(&self, run_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.stderr.log", run_id))
    }

    /// Executable to launch for the configured runtime
    pub fn program(&self) -> &str {
        self.runtime_binary
            .as_deref()
            .unwrap_or_else(|| self.runtime.program())
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
