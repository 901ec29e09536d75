//! Lifecycle steps that run on top of [`SessionLifecycleManager`]: archiving,
//! turning agent process events into session state, and reconciling session
//! branches with main.
//!
//! [`SessionLifecycleManager`]: super::service::SessionLifecycleManager

pub mod archive;
pub mod ingest;
pub mod reconcile;

pub use archive::ArchiveReport;
