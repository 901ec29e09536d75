use super::connection::Database;
use super::timestamps::utc_from_epoch_millis_lossy;
use crate::domains::git::diff::DiffStats;
use crate::domains::sessions::entity::{ExecutionDiff, NewExecutionDiff};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;

pub trait ExecutionDiffMethods {
    fn insert_execution_diff(&self, diff: NewExecutionDiff) -> Result<ExecutionDiff>;
    fn list_execution_diffs(&self, session_id: &str) -> Result<Vec<ExecutionDiff>>;
    fn next_execution_sequence(&self, session_id: &str) -> Result<i64>;
}

impl ExecutionDiffMethods for Database {
    fn insert_execution_diff(&self, diff: NewExecutionDiff) -> Result<ExecutionDiff> {
        let conn = self.get_conn()?;
        let changed_files = serde_json::to_string(&diff.changed_files)?;
        let now = Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO execution_diffs (
                session_id, prompt_marker_id, execution_sequence, diff, changed_files,
                stats_additions, stats_deletions, stats_files_changed,
                before_hash, after_hash, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                diff.session_id,
                diff.prompt_marker_id,
                diff.execution_sequence,
                diff.diff,
                changed_files,
                diff.stats.additions as i64,
                diff.stats.deletions as i64,
                diff.stats.files_changed as i64,
                diff.before_hash,
                diff.after_hash,
                now,
            ],
        )
        .with_context(|| {
            format!(
                "Failed to record execution {} for session {}",
                diff.execution_sequence, diff.session_id
            )
        })?;
        let id = conn.last_insert_rowid();
        Ok(ExecutionDiff::from_new(id, diff, utc_from_epoch_millis_lossy(now)))
    }

    fn list_execution_diffs(&self, session_id: &str) -> Result<Vec<ExecutionDiff>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, prompt_marker_id, execution_sequence, diff, changed_files,
                    stats_additions, stats_deletions, stats_files_changed,
                    before_hash, after_hash, timestamp
             FROM execution_diffs
             WHERE session_id = ?1
             ORDER BY execution_sequence ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                ExecutionDiff {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    prompt_marker_id: row.get(2)?,
                    execution_sequence: row.get(3)?,
                    diff: row.get(4)?,
                    changed_files: Vec::new(),
                    stats: DiffStats {
                        additions: row.get::<_, i64>(6)?.max(0) as u64,
                        deletions: row.get::<_, i64>(7)?.max(0) as u64,
                        files_changed: row.get::<_, i64>(8)?.max(0) as u64,
                    },
                    before_hash: row.get(9)?,
                    after_hash: row.get(10)?,
                    timestamp: utc_from_epoch_millis_lossy(row.get(11)?),
                },
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut diffs = Vec::new();
        for row in rows {
            let (mut diff, changed_files) = row?;
            diff.changed_files = serde_json::from_str(&changed_files).unwrap_or_else(|e| {
                log::warn!(
                    "Unreadable changed_files for execution {} of {}: {e}",
                    diff.execution_sequence,
                    diff.session_id
                );
                Vec::new()
            });
            diffs.push(diff);
        }
        Ok(diffs)
    }

    fn next_execution_sequence(&self, session_id: &str) -> Result<i64> {
        let conn = self.get_conn()?;
        let next = conn.query_row(
            "SELECT COALESCE(MAX(execution_sequence), 0) + 1 FROM execution_diffs WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(next)
    }
}
