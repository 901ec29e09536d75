use super::connection::Database;
use rusqlite::Connection;

pub fn initialize_schema(db: &Database) -> anyhow::Result<()> {
    let conn = db.get_conn()?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            worktree_name TEXT NOT NULL,
            worktree_path TEXT NOT NULL,
            branch TEXT NOT NULL,
            initial_prompt TEXT,
            status TEXT NOT NULL,  -- 'pending', 'running', 'waiting', 'stopped', 'completed', 'failed'
            pid INTEGER,
            last_exit_code INTEGER,
            resume_handle TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            last_viewed_at INTEGER,
            archived BOOLEAN NOT NULL DEFAULT FALSE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_archived ON sessions(archived, created_at DESC)",
        [],
    )?;

    // Live sessions never share a worktree.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_live_worktree
         ON sessions(worktree_path) WHERE archived = 0",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_outputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            output_index INTEGER NOT NULL,
            kind TEXT NOT NULL,
            data TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            UNIQUE(session_id, output_index),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS prompt_markers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            prompt_text TEXT NOT NULL,
            output_index INTEGER NOT NULL,
            output_line INTEGER,
            timestamp INTEGER NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_prompt_markers_session ON prompt_markers(session_id, output_index)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS conversation_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_conversation_messages_session ON conversation_messages(session_id, id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS execution_diffs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            prompt_marker_id INTEGER,
            execution_sequence INTEGER NOT NULL,
            diff TEXT NOT NULL,
            changed_files TEXT NOT NULL,  -- JSON array of paths
            stats_additions INTEGER NOT NULL DEFAULT 0,
            stats_deletions INTEGER NOT NULL DEFAULT 0,
            stats_files_changed INTEGER NOT NULL DEFAULT 0,
            before_hash TEXT,
            after_hash TEXT,
            timestamp INTEGER NOT NULL,
            UNIQUE(session_id, execution_sequence),
            FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE,
            FOREIGN KEY(prompt_marker_id) REFERENCES prompt_markers(id) ON DELETE SET NULL
        )",
        [],
    )?;

    apply_sessions_migrations(&conn)?;

    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Columns added after the first release; `ALTER TABLE` is skipped when the
/// column is already there.
fn apply_sessions_migrations(conn: &Connection) -> anyhow::Result<()> {
    if !column_exists(conn, "sessions", "resume_handle")? {
        conn.execute("ALTER TABLE sessions ADD COLUMN resume_handle TEXT", [])?;
    }
    if !column_exists(conn, "sessions", "last_viewed_at")? {
        conn.execute("ALTER TABLE sessions ADD COLUMN last_viewed_at INTEGER", [])?;
    }
    Ok(())
}
