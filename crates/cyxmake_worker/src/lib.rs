//! Worker agent for the cyxmake distributed build plane.

pub mod agent;
pub mod executor;
pub mod probe;

pub use agent::{AgentConfig, WorkerAgent};
pub use executor::{run_job, ExecOutcome};
