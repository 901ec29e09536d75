use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domains::git::diff::{CapturedDiff, DiffStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Running,
    Waiting,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Failed
        )
    }

    /// Whether a follow-up message may be sent in this state.
    pub fn accepts_input(&self) -> bool {
        matches!(
            self,
            SessionStatus::Running | SessionStatus::Waiting | SessionStatus::Stopped
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "waiting" => Ok(SessionStatus::Waiting),
            "stopped" => Ok(SessionStatus::Stopped),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            _ => Err(format!("Invalid session status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub worktree_name: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub initial_prompt: Option<String>,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub last_exit_code: Option<i32>,
    /// Agent-side conversation id used to resume after the process exits.
    pub resume_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_viewed_at: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl Session {
    /// Holds a worktree and may still be driven by the user.
    pub fn is_live(&self) -> bool {
        !self.archived
    }
}

/// Partial update applied by [`super::repository::SessionRepository::update_session`].
/// `Some(None)` clears an optional column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub status: Option<SessionStatus>,
    pub pid: Option<Option<u32>>,
    pub last_exit_code: Option<Option<i32>>,
    pub resume_handle: Option<Option<String>>,
    pub last_viewed_at: Option<DateTime<Utc>>,
}

impl SessionUpdate {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, session: &mut Session) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(pid) = self.pid {
            session.pid = pid;
        }
        if let Some(code) = self.last_exit_code {
            session.last_exit_code = code;
        }
        if let Some(handle) = &self.resume_handle {
            session.resume_handle = handle.clone();
        }
        if let Some(viewed) = self.last_viewed_at {
            session.last_viewed_at = Some(viewed);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMarker {
    pub id: i64,
    pub session_id: String,
    pub prompt_text: String,
    pub output_index: i64,
    pub output_line: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            _ => Err(format!("Invalid message role: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutput {
    pub session_id: String,
    pub index: i64,
    pub kind: String,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExecutionDiff {
    pub session_id: String,
    pub prompt_marker_id: Option<i64>,
    pub execution_sequence: i64,
    pub diff: String,
    pub changed_files: Vec<String>,
    pub stats: DiffStats,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDiff {
    pub id: i64,
    pub session_id: String,
    pub prompt_marker_id: Option<i64>,
    pub execution_sequence: i64,
    pub diff: String,
    pub changed_files: Vec<String>,
    pub stats: DiffStats,
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionDiff {
    pub fn from_new(id: i64, new: NewExecutionDiff, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            session_id: new.session_id,
            prompt_marker_id: new.prompt_marker_id,
            execution_sequence: new.execution_sequence,
            diff: new.diff,
            changed_files: new.changed_files,
            stats: new.stats,
            before_hash: new.before_hash,
            after_hash: new.after_hash,
            timestamp,
        }
    }

    pub fn to_captured(&self) -> CapturedDiff {
        CapturedDiff {
            diff: self.diff.clone(),
            stats: self.stats,
            changed_files: self.changed_files.clone(),
            before_hash: self.before_hash.clone(),
            after_hash: self.after_hash.clone(),
        }
    }
}
