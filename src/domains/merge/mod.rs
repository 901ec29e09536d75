pub mod service;
pub mod types;

pub use service::compute_rebase_conflicts;
pub use types::{CommitSummary, ConflictCheck, ConflictingCommits, GitOperationReport};
