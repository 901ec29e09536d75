use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::entity::{
    ConversationMessage, ExecutionDiff, MessageRole, NewExecutionDiff, PromptMarker, Session,
    SessionOutput, SessionUpdate,
};

/// Persistence seam for the orchestration layer. Implementations must not
/// leak their storage engine through this interface.
pub trait SessionRepository: Send + Sync {
    fn create_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn get_all_sessions(&self, include_archived: bool) -> Result<Vec<Session>>;
    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<Session>;
    fn archive_session(&self, id: &str) -> Result<()>;
    /// True when a non-archived session already uses `name`.
    fn session_name_exists(&self, name: &str) -> Result<bool>;

    /// Appends one output line and returns its index in the session's log.
    fn add_session_output(&self, session_id: &str, kind: &str, data: &str) -> Result<i64>;
    fn get_session_outputs(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionOutput>>;
    fn session_output_count(&self, session_id: &str) -> Result<i64>;

    fn add_prompt_marker(
        &self,
        session_id: &str,
        prompt_text: &str,
        output_index: i64,
        output_line: Option<i64>,
    ) -> Result<PromptMarker>;
    fn get_prompt_markers(&self, session_id: &str) -> Result<Vec<PromptMarker>>;

    fn add_conversation_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage>;
    fn get_conversation_messages(&self, session_id: &str) -> Result<Vec<ConversationMessage>>;

    fn create_execution_diff(&self, diff: NewExecutionDiff) -> Result<ExecutionDiff>;
    fn get_execution_diffs(&self, session_id: &str) -> Result<Vec<ExecutionDiff>>;
    /// `max(existing) + 1`, starting at 1.
    fn get_next_execution_sequence(&self, session_id: &str) -> Result<i64>;

    fn touch_last_viewed(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_session(
            id,
            &SessionUpdate {
                last_viewed_at: Some(at),
                ..Default::default()
            },
        )
        .map(|_| ())
    }
}

#[derive(Default)]
struct Tables {
    sessions: Vec<Session>,
    outputs: HashMap<String, Vec<SessionOutput>>,
    markers: Vec<PromptMarker>,
    messages: Vec<ConversationMessage>,
    diffs: Vec<ExecutionDiff>,
    next_row_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_row_id += 1;
        self.next_row_id
    }
}

/// Mutex-guarded, process-local repository.
#[derive(Default)]
pub struct InMemorySessionRepository {
    tables: Mutex<Tables>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| anyhow!("session repository lock poisoned"))?;
        f(&mut tables)
    }
}

fn session_not_found(id: &str) -> anyhow::Error {
    anyhow!("Session not found: {id}")
}

impl SessionRepository for InMemorySessionRepository {
    fn create_session(&self, session: &Session) -> Result<()> {
        self.with_tables(|t| {
            if t.sessions.iter().any(|s| s.id == session.id) {
                return Err(anyhow!("Session {} already exists", session.id));
            }
            if t
                .sessions
                .iter()
                .any(|s| !s.archived && s.worktree_path == session.worktree_path)
            {
                return Err(anyhow!(
                    "Worktree {} is already used by a live session",
                    session.worktree_path.display()
                ));
            }
            t.sessions.push(session.clone());
            Ok(())
        })
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.with_tables(|t| Ok(t.sessions.iter().find(|s| s.id == id).cloned()))
    }

    fn get_all_sessions(&self, include_archived: bool) -> Result<Vec<Session>> {
        self.with_tables(|t| {
            let mut sessions: Vec<Session> = t
                .sessions
                .iter()
                .filter(|s| include_archived || !s.archived)
                .cloned()
                .collect();
            sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(sessions)
        })
    }

    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<Session> {
        self.with_tables(|t| {
            let session = t
                .sessions
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| session_not_found(id))?;
            update.apply_to(session);
            session.updated_at = Utc::now();
            Ok(session.clone())
        })
    }

    fn archive_session(&self, id: &str) -> Result<()> {
        self.with_tables(|t| {
            let session = t
                .sessions
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| session_not_found(id))?;
            session.archived = true;
            session.pid = None;
            session.updated_at = Utc::now();
            Ok(())
        })
    }

    fn session_name_exists(&self, name: &str) -> Result<bool> {
        self.with_tables(|t| {
            Ok(t
                .sessions
                .iter()
                .any(|s| !s.archived && (s.name == name || s.worktree_name == name)))
        })
    }

    fn add_session_output(&self, session_id: &str, kind: &str, data: &str) -> Result<i64> {
        self.with_tables(|t| {
            let log = t.outputs.entry(session_id.to_string()).or_default();
            let index = log.len() as i64;
            log.push(SessionOutput {
                session_id: session_id.to_string(),
                index,
                kind: kind.to_string(),
                data: data.to_string(),
                timestamp: Utc::now(),
            });
            Ok(index)
        })
    }

    fn get_session_outputs(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionOutput>> {
        self.with_tables(|t| {
            let log = t.outputs.get(session_id).cloned().unwrap_or_default();
            Ok(match limit {
                Some(limit) if log.len() > limit => log[log.len() - limit..].to_vec(),
                _ => log,
            })
        })
    }

    fn session_output_count(&self, session_id: &str) -> Result<i64> {
        self.with_tables(|t| Ok(t.outputs.get(session_id).map_or(0, |l| l.len() as i64)))
    }

    fn add_prompt_marker(
        &self,
        session_id: &str,
        prompt_text: &str,
        output_index: i64,
        output_line: Option<i64>,
    ) -> Result<PromptMarker> {
        self.with_tables(|t| {
            let marker = PromptMarker {
                id: t.next_id(),
                session_id: session_id.to_string(),
                prompt_text: prompt_text.to_string(),
                output_index,
                output_line,
                timestamp: Utc::now(),
            };
            t.markers.push(marker.clone());
            Ok(marker)
        })
    }

    fn get_prompt_markers(&self, session_id: &str) -> Result<Vec<PromptMarker>> {
        self.with_tables(|t| {
            let mut markers: Vec<_> = t
                .markers
                .iter()
                .filter(|m| m.session_id == session_id)
                .cloned()
                .collect();
            markers.sort_by_key(|m| (m.output_index, m.id));
            Ok(markers)
        })
    }

    fn add_conversation_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage> {
        self.with_tables(|t| {
            let message = ConversationMessage {
                id: t.next_id(),
                session_id: session_id.to_string(),
                role,
                content: content.to_string(),
                timestamp: Utc::now(),
            };
            t.messages.push(message.clone());
            Ok(message)
        })
    }

    fn get_conversation_messages(&self, session_id: &str) -> Result<Vec<ConversationMessage>> {
        self.with_tables(|t| {
            Ok(t.messages
                .iter()
                .filter(|m| m.session_id == session_id)
                .cloned()
                .collect())
        })
    }

    fn create_execution_diff(&self, diff: NewExecutionDiff) -> Result<ExecutionDiff> {
        self.with_tables(|t| {
            if t.diffs.iter().any(|d| {
                d.session_id == diff.session_id && d.execution_sequence == diff.execution_sequence
            }) {
                return Err(anyhow!(
                    "Execution {} already recorded for session {}",
                    diff.execution_sequence,
                    diff.session_id
                ));
            }
            let stored = ExecutionDiff::from_new(t.next_id(), diff, Utc::now());
            t.diffs.push(stored.clone());
            Ok(stored)
        })
    }

    fn get_execution_diffs(&self, session_id: &str) -> Result<Vec<ExecutionDiff>> {
        self.with_tables(|t| {
            let mut diffs: Vec<_> = t
                .diffs
                .iter()
                .filter(|d| d.session_id == session_id)
                .cloned()
                .collect();
            diffs.sort_by_key(|d| d.execution_sequence);
            Ok(diffs)
        })
    }

    fn get_next_execution_sequence(&self, session_id: &str) -> Result<i64> {
        self.with_tables(|t| {
            Ok(t.diffs
                .iter()
                .filter(|d| d.session_id == session_id)
                .map(|d| d.execution_sequence)
                .max()
                .unwrap_or(0)
                + 1)
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domains::sessions::entity::SessionStatus;
    use std::path::PathBuf;

    pub fn sample_session(id: &str, name: &str) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            name: name.to_string(),
            worktree_name: name.to_string(),
            worktree_path: PathBuf::from(format!("/tmp/worktrees/{name}")),
            branch: name.to_string(),
            initial_prompt: Some(format!("work on {name}")),
            status: SessionStatus::Pending,
            pid: None,
            last_exit_code: None,
            resume_handle: None,
            created_at: now,
            updated_at: now,
            last_viewed_at: None,
            archived: false,
        }
    }

    pub fn sample_diff(session_id: &str, sequence: i64, files: &[&str]) -> NewExecutionDiff {
        NewExecutionDiff {
            session_id: session_id.to_string(),
            prompt_marker_id: None,
            execution_sequence: sequence,
            diff: files
                .iter()
                .map(|f| format!("diff --git a/{f} b/{f}\n+line\n"))
                .collect(),
            changed_files: files.iter().map(|f| f.to_string()).collect(),
            stats: crate::domains::git::diff::DiffStats {
                additions: files.len() as u64,
                deletions: 0,
                files_changed: files.len() as u64,
            },
            before_hash: Some("abc".to_string()),
            after_hash: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{sample_diff, sample_session};
    use super::*;
    use crate::domains::sessions::entity::SessionStatus;

    #[test]
    fn execution_sequence_is_max_plus_one() {
        let repo = InMemorySessionRepository::new();
        repo.create_session(&sample_session("s1", "one")).unwrap();

        assert_eq!(repo.get_next_execution_sequence("s1").unwrap(), 1);
        repo.create_execution_diff(sample_diff("s1", 1, &["a"])).unwrap();
        repo.create_execution_diff(sample_diff("s1", 4, &["b"])).unwrap();
        assert_eq!(repo.get_next_execution_sequence("s1").unwrap(), 5);
        assert_eq!(repo.get_next_execution_sequence("other").unwrap(), 1);
        assert!(repo.create_execution_diff(sample_diff("s1", 4, &["c"])).is_err());
    }

    #[test]
    fn archived_sessions_are_hidden_and_free_their_name() {
        let repo = InMemorySessionRepository::new();
        repo.create_session(&sample_session("s1", "foo")).unwrap();
        assert!(repo.session_name_exists("foo").unwrap());

        repo.archive_session("s1").unwrap();
        assert!(!repo.session_name_exists("foo").unwrap());
        assert!(repo.get_all_sessions(false).unwrap().is_empty());
        assert_eq!(repo.get_all_sessions(true).unwrap().len(), 1);
        assert!(repo.get_session("s1").unwrap().unwrap().archived);
    }

    #[test]
    fn output_indices_are_sequential_and_limit_keeps_tail() {
        let repo = InMemorySessionRepository::new();
        for i in 0..5 {
            assert_eq!(repo.add_session_output("s1", "stdout", &format!("line {i}")).unwrap(), i);
        }
        let tail = repo.get_session_outputs("s1", Some(2)).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].data, "line 3");
        assert_eq!(repo.session_output_count("s1").unwrap(), 5);
    }

    #[test]
    fn update_of_missing_session_fails() {
        let repo = InMemorySessionRepository::new();
        let err = repo
            .update_session("nope", &SessionUpdate::status(SessionStatus::Running))
            .unwrap_err();
        assert!(err.to_string().contains("Session not found"));
    }
}
