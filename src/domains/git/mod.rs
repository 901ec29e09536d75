pub mod command;
pub mod diff;
pub mod history;
pub mod worktrees;

pub use command::{DEFAULT_GIT_TIMEOUT, EMPTY_TREE_HASH, GitOutput, GitRunner};
pub use diff::{CapturedDiff, CombinedDiff, DiffStats, GitDiffManager};
pub use history::{CommitHistory, CommitRecord, HistorySource};
pub use worktrees::{WorktreeInfo, WorktreeLayout, WorktreeManager};
