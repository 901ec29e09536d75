//! Orchestrates concurrent coding-agent sessions, each in its own git
//! worktree: agent supervision, per-turn execution diffs, and reconciliation
//! of session branches back into main.

pub mod domains;
pub mod errors;
pub mod events;
pub mod infrastructure;
pub mod logging;
pub mod shared;
pub mod startup;

pub use errors::GroveError;
pub use events::EventHub;
pub use startup::{Orchestrator, Storage};
