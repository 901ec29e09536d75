use anyhow::Result;

use super::connection::Database;
use super::db_execution_diffs::ExecutionDiffMethods;
use super::db_outputs::OutputMethods;
use super::db_sessions::SessionMethods;
use crate::domains::sessions::entity::{
    ConversationMessage, ExecutionDiff, MessageRole, NewExecutionDiff, PromptMarker, Session,
    SessionOutput, SessionUpdate,
};
use crate::domains::sessions::repository::SessionRepository;

impl SessionRepository for Database {
    fn create_session(&self, session: &Session) -> Result<()> {
        self.insert_session(session)
    }

    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.find_session(id)
    }

    fn get_all_sessions(&self, include_archived: bool) -> Result<Vec<Session>> {
        self.list_sessions(include_archived)
    }

    fn update_session(&self, id: &str, update: &SessionUpdate) -> Result<Session> {
        self.apply_session_update(id, update)
    }

    fn archive_session(&self, id: &str) -> Result<()> {
        self.mark_session_archived(id)
    }

    fn session_name_exists(&self, name: &str) -> Result<bool> {
        self.live_session_name_exists(name)
    }

    fn add_session_output(&self, session_id: &str, kind: &str, data: &str) -> Result<i64> {
        self.append_output(session_id, kind, data)
    }

    fn get_session_outputs(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionOutput>> {
        self.list_outputs(session_id, limit)
    }

    fn session_output_count(&self, session_id: &str) -> Result<i64> {
        self.count_outputs(session_id)
    }

    fn add_prompt_marker(
        &self,
        session_id: &str,
        prompt_text: &str,
        output_index: i64,
        output_line: Option<i64>,
    ) -> Result<PromptMarker> {
        self.insert_prompt_marker(session_id, prompt_text, output_index, output_line)
    }

    fn get_prompt_markers(&self, session_id: &str) -> Result<Vec<PromptMarker>> {
        self.list_prompt_markers(session_id)
    }

    fn add_conversation_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage> {
        self.insert_conversation_message(session_id, role, content)
    }

    fn get_conversation_messages(&self, session_id: &str) -> Result<Vec<ConversationMessage>> {
        self.list_conversation_messages(session_id)
    }

    fn create_execution_diff(&self, diff: NewExecutionDiff) -> Result<ExecutionDiff> {
        self.insert_execution_diff(diff)
    }

    fn get_execution_diffs(&self, session_id: &str) -> Result<Vec<ExecutionDiff>> {
        self.list_execution_diffs(session_id)
    }

    fn get_next_execution_sequence(&self, session_id: &str) -> Result<i64> {
        self.next_execution_sequence(session_id)
    }
}
