pub mod runner;
pub mod tracker;

pub use runner::{CommandOutcome, RunCommandExecutor, RunReport};
pub use tracker::{RunningScript, ScriptExecutionTracker, ScriptOwner};
