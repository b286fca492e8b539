//! Agent Runner - supervises agent subprocesses in isolated worktrees
//!
//! This crate owns the OS side of a run: spawning the agent inside the
//! run's git worktree, streaming its output into the run's log buffers,
//! signalling it (pause, resume, cancel) and reconciling state left behind
//! by crashed runs.

mod error;
mod event;
pub mod parser;
mod process;
pub mod recovery;
pub mod signal;
mod supervisor;
mod workflow;

pub use error::{Result, SupervisorError};
pub use event::{Completion, OutputEvent, OutputStream, ProcessOutcome};
pub use parser::{create_parser, OutputParser};
pub use process::{AgentProcess, CommandSpec, OutputReaderHandle, OutputSink};
pub use recovery::{CleanupReport, OsProcessProbe, ProcessProbe, Reconciler};
pub use supervisor::Supervisor;
pub use workflow::{follow_up_prompt, WorkflowSpec, FOLLOW_UP_SKILL};
