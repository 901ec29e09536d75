pub mod agents;
pub mod execution;
pub mod git;
pub mod merge;
pub mod scripts;
pub mod sessions;
pub mod settings;
