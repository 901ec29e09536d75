use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domains::git::diff::DiffStats;
use crate::domains::scripts::tracker::RunningScript;
use crate::domains::sessions::entity::{Session, SessionStatus};
use crate::errors::GroveError;
use crate::infrastructure::events::EventBus;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
    System,
    Json,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Stderr => "stderr",
            OutputKind::System => "system",
            OutputKind::Json => "json",
        }
    }
}

/// One complete line of agent output as exposed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentOutput {
    pub fn new(session_id: &str, kind: OutputKind, data: impl Into<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessEvent {
    Spawned {
        session_id: String,
        pid: Option<u32>,
    },
    Output(AgentOutput),
    /// `system/init` reported the agent's own conversation id.
    AgentInitialized {
        session_id: String,
        agent_session_id: String,
    },
    /// The agent finished a turn but its process is still alive.
    TurnCompleted {
        session_id: String,
    },
    Error {
        session_id: String,
        message: String,
    },
    Exit {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<String>,
        last_output: Vec<String>,
    },
}

impl ProcessEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessEvent::Spawned { .. } => "grove:process-spawned",
            ProcessEvent::Output(_) => "grove:process-output",
            ProcessEvent::AgentInitialized { .. } => "grove:process-agent-initialized",
            ProcessEvent::TurnCompleted { .. } => "grove:process-turn-completed",
            ProcessEvent::Error { .. } => "grove:process-error",
            ProcessEvent::Exit { .. } => "grove:process-exit",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            ProcessEvent::Output(output) => &output.session_id,
            ProcessEvent::Spawned { session_id, .. }
            | ProcessEvent::AgentInitialized { session_id, .. }
            | ProcessEvent::TurnCompleted { session_id }
            | ProcessEvent::Error { session_id, .. }
            | ProcessEvent::Exit { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Added {
        session: Session,
    },
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    PromptMarked {
        session_id: String,
        marker_id: i64,
        output_index: i64,
    },
    Archived {
        session_id: String,
        errors: Vec<String>,
    },
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::Added { .. } => "grove:session-added",
            SessionEvent::StatusChanged { .. } => "grove:session-status-changed",
            SessionEvent::PromptMarked { .. } => "grove:session-prompt-marked",
            SessionEvent::Archived { .. } => "grove:session-archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started {
        session_id: String,
        execution_sequence: i64,
    },
    Completed {
        session_id: String,
        execution_sequence: i64,
        stats: DiffStats,
        persisted: bool,
    },
    Cancelled {
        session_id: String,
        execution_sequence: i64,
    },
}

impl ExecutionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionEvent::Started { .. } => "grove:execution-started",
            ExecutionEvent::Completed { .. } => "grove:execution-completed",
            ExecutionEvent::Cancelled { .. } => "grove:execution-cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptEvent {
    Started {
        script: RunningScript,
    },
    Closing {
        script: RunningScript,
    },
    Stopped {
        script: RunningScript,
    },
    CommandStarted {
        script_id: String,
        index: usize,
        command: String,
    },
    Output {
        script_id: String,
        index: usize,
        #[serde(rename = "stream")]
        kind: OutputKind,
        line: String,
    },
    CommandFinished {
        script_id: String,
        index: usize,
        exit_code: Option<i32>,
    },
}

impl ScriptEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptEvent::Started { .. } => "grove:script-started",
            ScriptEvent::Closing { .. } => "grove:script-closing",
            ScriptEvent::Stopped { .. } => "grove:script-stopped",
            ScriptEvent::CommandStarted { .. } => "grove:script-command-started",
            ScriptEvent::Output { .. } => "grove:script-output",
            ScriptEvent::CommandFinished { .. } => "grove:script-command-finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitEvent {
    OperationStarted {
        session_id: String,
        operation: String,
    },
    OperationCompleted {
        session_id: String,
        operation: String,
        commands: Vec<String>,
    },
    OperationFailed {
        session_id: String,
        operation: String,
        error: GroveError,
    },
}

impl GitEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitEvent::OperationStarted { .. } => "grove:git-operation-started",
            GitEvent::OperationCompleted { .. } => "grove:git-operation-completed",
            GitEvent::OperationFailed { .. } => "grove:git-operation-failed",
        }
    }
}

/// One bus per event category, constructed once and handed to every service.
#[derive(Clone, Default)]
pub struct EventHub {
    pub process: Arc<EventBus<ProcessEvent>>,
    pub session: Arc<EventBus<SessionEvent>>,
    pub execution: Arc<EventBus<ExecutionEvent>>,
    pub script: Arc<EventBus<ScriptEvent>>,
    pub git: Arc<EventBus<GitEvent>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_record_serializes_with_type_field() {
        let output = AgentOutput::new("s1", OutputKind::Json, "{}");
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["type"], "json");
        assert_eq!(value["data"], "{}");
    }

    #[test]
    fn event_names_are_namespaced() {
        let exit = ProcessEvent::Exit {
            session_id: "s".into(),
            exit_code: Some(1),
            signal: None,
            last_output: vec![],
        };
        assert_eq!(exit.as_str(), "grove:process-exit");
        assert_eq!(exit.session_id(), "s");
        let done = ExecutionEvent::Completed {
            session_id: "s".into(),
            execution_sequence: 1,
            stats: DiffStats::default(),
            persisted: false,
        };
        assert_eq!(done.as_str(), "grove:execution-completed");
    }
}
