use super::connection::Database;
use super::timestamps::utc_from_epoch_millis_lossy;
use crate::domains::sessions::entity::{
    ConversationMessage, MessageRole, PromptMarker, SessionOutput,
};
use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{Row, params};
use std::str::FromStr;

/// Append-only per-session logs: raw output lines, prompt markers and the
/// user/assistant conversation.
pub trait OutputMethods {
    fn append_output(&self, session_id: &str, kind: &str, data: &str) -> Result<i64>;
    fn list_outputs(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionOutput>>;
    fn count_outputs(&self, session_id: &str) -> Result<i64>;

    fn insert_prompt_marker(
        &self,
        session_id: &str,
        prompt_text: &str,
        output_index: i64,
        output_line: Option<i64>,
    ) -> Result<PromptMarker>;
    fn list_prompt_markers(&self, session_id: &str) -> Result<Vec<PromptMarker>>;

    fn insert_conversation_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage>;
    fn list_conversation_messages(&self, session_id: &str) -> Result<Vec<ConversationMessage>>;
}

impl OutputMethods for Database {
    fn append_output(&self, session_id: &str, kind: &str, data: &str) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(output_index) + 1, 0) FROM session_outputs WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO session_outputs (session_id, output_index, kind, data, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, index, kind, data, Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(index)
    }

    fn list_outputs(&self, session_id: &str, limit: Option<usize>) -> Result<Vec<SessionOutput>> {
        let conn = self.get_conn()?;
        // -1 disables LIMIT in SQLite.
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = conn.prepare(
            "SELECT session_id, output_index, kind, data, timestamp FROM (
                SELECT session_id, output_index, kind, data, timestamp
                FROM session_outputs
                WHERE session_id = ?1
                ORDER BY output_index DESC
                LIMIT ?2
             ) ORDER BY output_index ASC",
        )?;
        let rows = stmt.query_map(params![session_id, limit], row_to_output)?;
        let mut outputs = Vec::new();
        for row in rows {
            outputs.push(row?);
        }
        Ok(outputs)
    }

    fn count_outputs(&self, session_id: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM session_outputs WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn insert_prompt_marker(
        &self,
        session_id: &str,
        prompt_text: &str,
        output_index: i64,
        output_line: Option<i64>,
    ) -> Result<PromptMarker> {
        let conn = self.get_conn()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO prompt_markers (session_id, prompt_text, output_index, output_line, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                prompt_text,
                output_index,
                output_line,
                now.timestamp_millis()
            ],
        )?;
        Ok(PromptMarker {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            prompt_text: prompt_text.to_string(),
            output_index,
            output_line,
            timestamp: utc_from_epoch_millis_lossy(now.timestamp_millis()),
        })
    }

    fn list_prompt_markers(&self, session_id: &str) -> Result<Vec<PromptMarker>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, prompt_text, output_index, output_line, timestamp
             FROM prompt_markers
             WHERE session_id = ?1
             ORDER BY output_index ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], row_to_marker)?;
        let mut markers = Vec::new();
        for row in rows {
            markers.push(row?);
        }
        Ok(markers)
    }

    fn insert_conversation_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<ConversationMessage> {
        let conn = self.get_conn()?;
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO conversation_messages (session_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, now],
        )?;
        Ok(ConversationMessage {
            id: conn.last_insert_rowid(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: utc_from_epoch_millis_lossy(now),
        })
    }

    fn list_conversation_messages(&self, session_id: &str) -> Result<Vec<ConversationMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, role, content, timestamp
             FROM conversation_messages
             WHERE session_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut messages = Vec::new();
        for row in rows {
            let (id, session_id, role, content, timestamp) = row?;
            messages.push(ConversationMessage {
                id,
                session_id,
                role: MessageRole::from_str(&role).map_err(|e| anyhow!(e))?,
                content,
                timestamp: utc_from_epoch_millis_lossy(timestamp),
            });
        }
        Ok(messages)
    }
}

fn row_to_output(row: &Row<'_>) -> rusqlite::Result<SessionOutput> {
    Ok(SessionOutput {
        session_id: row.get(0)?,
        index: row.get(1)?,
        kind: row.get(2)?,
        data: row.get(3)?,
        timestamp: utc_from_epoch_millis_lossy(row.get(4)?),
    })
}

fn row_to_marker(row: &Row<'_>) -> rusqlite::Result<PromptMarker> {
    Ok(PromptMarker {
        id: row.get(0)?,
        session_id: row.get(1)?,
        prompt_text: row.get(2)?,
        output_index: row.get(3)?,
        output_line: row.get(4)?,
        timestamp: utc_from_epoch_millis_lossy(row.get(5)?),
    })
}
