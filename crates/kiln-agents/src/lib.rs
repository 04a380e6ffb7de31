//! Build orchestration engine: agents, phased scheduling, dispatch and
//! recovery for multi-agent code generation builds.

pub mod classifier;
pub mod consensus;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod output;
pub mod prompts;
pub mod readiness;
pub mod recovery;
pub mod registry;
pub mod roles;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod verify;

pub use dispatcher::{QueuedTask, TaskFailure, TaskResult};
pub use error::{EngineError, Result};
pub use manager::{BuildManager, BuildManagerBuilder};
