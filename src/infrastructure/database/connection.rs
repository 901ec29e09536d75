use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_SIZE: u32 = 4;

/// Opens file-backed SQLite connections for the r2d2 pool with the pragmas
/// every connection needs.
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    path: PathBuf,
}

impl SqliteConnectionManager {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl r2d2::ManageConnection for SqliteConnectionManager {
    type Connection = Connection;
    type Error = rusqlite::Error;

    fn connect(&self) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

#[derive(Clone)]
pub struct Database {
    pool: r2d2::Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the database at `db_path`, or at the
    /// per-user default location, and brings the schema up to date.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(path) => path,
            None => default_db_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let pool = r2d2::Pool::builder()
            .max_size(POOL_SIZE)
            .build(SqliteConnectionManager::file(&path))
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self { pool, path };
        super::db_schema::initialize_schema(&db)?;
        info!("Session database ready at {}", db.path.display());
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_conn(&self) -> Result<PooledConnection> {
        self.pool.get().map_err(|e| {
            debug!("Connection pool exhausted or broken: {e}");
            anyhow!("Failed to get database connection: {e}")
        })
    }
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().ok_or_else(|| anyhow!("No data directory for this user"))?;
    Ok(base.join("grove").join("sessions.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_parent_directories_and_is_reopenable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("grove.db");

        let db = Database::new(Some(path.clone())).unwrap();
        assert_eq!(db.path(), path.as_path());
        assert!(path.exists());
        drop(db);

        let reopened = Database::new(Some(path)).unwrap();
        let conn = reopened.get_conn().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
