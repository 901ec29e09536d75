pub mod entity;
pub mod lifecycle;
pub mod prompt_markers;
pub mod repository;
pub mod service;

pub use entity::{
    ConversationMessage, ExecutionDiff, MessageRole, NewExecutionDiff, PromptMarker, Session,
    SessionOutput, SessionStatus, SessionUpdate,
};
pub use lifecycle::ArchiveReport;
pub use repository::{InMemorySessionRepository, SessionRepository};
pub use service::SessionLifecycleManager;
