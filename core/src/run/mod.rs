pub mod persistence;
mod run_model;
mod runtime;
mod state;
mod store;

pub use persistence::{SessionFile, SessionStore};
pub use run_model::{generate_run_id, validate_run_id, Run, SkillCost};
pub use runtime::AgentRuntime;
pub use state::RunState;
pub use store::RunStore;
