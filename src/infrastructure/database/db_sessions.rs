use super::connection::Database;
use super::timestamps::{to_epoch_millis, utc_from_epoch_millis_lossy, utc_from_epoch_millis_lossy_opt};
use crate::domains::sessions::entity::{Session, SessionStatus, SessionUpdate};
use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use std::path::PathBuf;
use std::str::FromStr;

const SESSION_COLUMNS: &str = "id, name, worktree_name, worktree_path, branch, initial_prompt,
     status, pid, last_exit_code, resume_handle,
     created_at, updated_at, last_viewed_at, archived";

pub trait SessionMethods {
    fn insert_session(&self, session: &Session) -> Result<()>;
    fn find_session(&self, id: &str) -> Result<Option<Session>>;
    fn list_sessions(&self, include_archived: bool) -> Result<Vec<Session>>;
    fn apply_session_update(&self, id: &str, update: &SessionUpdate) -> Result<Session>;
    fn mark_session_archived(&self, id: &str) -> Result<()>;
    fn live_session_name_exists(&self, name: &str) -> Result<bool>;
}

impl SessionMethods for Database {
    fn insert_session(&self, session: &Session) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO sessions ({SESSION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                session.id,
                session.name,
                session.worktree_name,
                session.worktree_path.to_string_lossy(),
                session.branch,
                session.initial_prompt,
                session.status.as_str(),
                session.pid,
                session.last_exit_code,
                session.resume_handle,
                to_epoch_millis(&session.created_at),
                to_epoch_millis(&session.updated_at),
                session.last_viewed_at.as_ref().map(to_epoch_millis),
                session.archived,
            ],
        )?;
        Ok(())
    }

    fn find_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
        ))?;
        let session = stmt.query_row(params![id], row_to_session).optional()?;
        Ok(session)
    }

    fn list_sessions(&self, include_archived: bool) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE ?1 OR archived = 0
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![include_archived], row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn apply_session_update(&self, id: &str, update: &SessionUpdate) -> Result<Session> {
        let mut session = self
            .find_session(id)?
            .ok_or_else(|| anyhow!("Session not found: {id}"))?;
        update.apply_to(&mut session);
        session.updated_at = Utc::now();

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions
             SET status = ?1, pid = ?2, last_exit_code = ?3, resume_handle = ?4,
                 last_viewed_at = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                session.status.as_str(),
                session.pid,
                session.last_exit_code,
                session.resume_handle,
                session.last_viewed_at.as_ref().map(to_epoch_millis),
                to_epoch_millis(&session.updated_at),
                id,
            ],
        )?;
        Ok(session)
    }

    fn mark_session_archived(&self, id: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET archived = TRUE, pid = NULL, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().timestamp_millis(), id],
        )?;
        if changed == 0 {
            return Err(anyhow!("Session not found: {id}"));
        }
        Ok(())
    }

    fn live_session_name_exists(&self, name: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM sessions
                WHERE archived = 0 AND (name = ?1 OR worktree_name = ?1)
            )",
            params![name],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status: String = row.get(6)?;
    let status = SessionStatus::from_str(&status).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;

    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        worktree_name: row.get(2)?,
        worktree_path: PathBuf::from(row.get::<_, String>(3)?),
        branch: row.get(4)?,
        initial_prompt: row.get(5)?,
        status,
        pid: row.get(7)?,
        last_exit_code: row.get(8)?,
        resume_handle: row.get(9)?,
        created_at: utc_from_epoch_millis_lossy(row.get(10)?),
        updated_at: utc_from_epoch_millis_lossy(row.get(11)?),
        last_viewed_at: utc_from_epoch_millis_lossy_opt(row.get(12)?),
        archived: row.get(13)?,
    })
}
