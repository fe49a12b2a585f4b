//! SQLite database with Diesel ORM
//!
//! Owns the connection pool shared by both tree stores and the write-ahead
//! log, and the single linear schema migration.

use crate::error::{Context, Error, Result};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var that overrides every other database location
pub const DB_PATH_ENV: &str = "LAZYTODO_DB_PATH";

/// Schema version written by [`Database::migrate`]
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

const MIGRATION_001: &str = r#"
    CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        is_expanded BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        deleted_at TEXT
    );

    CREATE TABLE IF NOT EXISTS workspace_closure (
        ancestor_id TEXT NOT NULL REFERENCES workspaces(id),
        descendant_id TEXT NOT NULL REFERENCES workspaces(id),
        depth INTEGER NOT NULL,
        PRIMARY KEY (ancestor_id, descendant_id)
    );

    CREATE TABLE IF NOT EXISTS todos (
        id TEXT PRIMARY KEY NOT NULL,
        workspace_id TEXT NOT NULL REFERENCES workspaces(id),
        description TEXT NOT NULL,
        position INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        urgency INTEGER NOT NULL DEFAULT 2,
        due_date TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT,
        deleted_at TEXT,
        is_archived BOOLEAN NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS todo_closure (
        ancestor_id TEXT NOT NULL REFERENCES todos(id),
        descendant_id TEXT NOT NULL REFERENCES todos(id),
        depth INTEGER NOT NULL,
        PRIMARY KEY (ancestor_id, descendant_id)
    );

    CREATE TABLE IF NOT EXISTS operation_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
        operation_type TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        applied BOOLEAN NOT NULL DEFAULT 0,
        is_undone BOOLEAN NOT NULL DEFAULT 0,
        undone_at TEXT,
        undo_group_id TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workspace_closure_descendant ON workspace_closure(descendant_id, depth);
    CREATE INDEX IF NOT EXISTS idx_todo_closure_descendant ON todo_closure(descendant_id, depth);
    CREATE INDEX IF NOT EXISTS idx_workspaces_deleted ON workspaces(deleted_at);
    CREATE INDEX IF NOT EXISTS idx_todos_workspace ON todos(workspace_id, deleted_at);
    CREATE INDEX IF NOT EXISTS idx_todos_completed ON todos(status, completed_at);
    CREATE INDEX IF NOT EXISTS idx_operation_log_state ON operation_log(applied, is_undone);
"#;

/// Resolve the database path.
///
/// `LAZYTODO_DB_PATH` wins, then the configured path, then the platform data
/// directory.
pub fn resolve_db_path(configured: Option<&Path>) -> PathBuf {
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Some(path) = configured {
        return path.to_path_buf();
    }
    directories::ProjectDirs::from("", "", "lazytodo")
        .map(|dirs| dirs.data_dir().join("lazytodo.db"))
        .unwrap_or_else(|| PathBuf::from(".lazytodo/lazytodo.db"))
}

// ============================================================================
// Helper structs for raw SQL queries
// ============================================================================

#[derive(QueryableByName, Debug)]
struct VersionRow {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    version: i32,
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pragmas applied to every pooled connection
#[derive(Debug)]
struct ConnectionOptions {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Database connection wrapper with connection pool
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (and migrate) the database at the default location
    pub fn open(configured: Option<&Path>) -> Result<Self> {
        let path = resolve_db_path(configured);
        Self::open_at(path)
    }

    /// Open (and migrate) the database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Connection(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(4)
            .connection_customizer(Box::new(ConnectionOptions {
                busy_timeout: Duration::from_secs(5),
            }))
            .build(manager)
            .map_err(|e| Error::Connection(e.to_string()))?;

        let db = Self { pool, path };
        db.migrate()?;
        tracing::debug!(path = %db.path.display(), "database opened");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Current schema version marker (0 for an empty database)
    pub fn schema_version(&self) -> Result<i32> {
        let mut conn = self.conn()?;
        current_version(&mut conn)
    }

    /// Bring the schema up to [`CURRENT_SCHEMA_VERSION`]
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn()?;
        conn.batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .map_err(|e| Error::Migration(e.to_string()))?;

        let version = current_version(&mut conn)?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(Error::Migration(format!(
                "database schema v{} is newer than supported v{}",
                version, CURRENT_SCHEMA_VERSION
            )));
        }
        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        conn.immediate_transaction::<_, Error, _>(|conn| {
            conn.batch_execute(MIGRATION_001)
                .map_err(|e| Error::Migration(format!("001_initial: {}", e)))?;
            diesel::insert_into(crate::schema::schema_version::table)
                .values((
                    crate::schema::schema_version::version.eq(CURRENT_SCHEMA_VERSION),
                    crate::schema::schema_version::applied_at.eq(crate::model::now()),
                ))
                .execute(conn)
                .map_err(|e| Error::Migration(e.to_string()))?;
            Ok(())
        })?;

        tracing::info!(version = CURRENT_SCHEMA_VERSION, "schema migrated");
        Ok(())
    }
}

fn current_version(conn: &mut SqliteConnection) -> Result<i32> {
    let row: VersionRow =
        diesel::sql_query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_version")
            .get_result(conn)
            .context("read schema version")?;
    Ok(row.version)
}

/// Fresh migrated database in a temp dir, for unit tests
#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open_at(dir.path().join("test.db")).unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_sets_version() {
        let (_dir, db) = test_db();
        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_is_noop() {
        let (dir, db) = test_db();
        drop(db);
        let db = Database::open_at(dir.path().join("test.db")).unwrap();
        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
        db.migrate().unwrap();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b").join("lazytodo.db");
        let db = Database::open_at(&nested).unwrap();
        assert!(nested.exists());
        assert_eq!(db.path(), nested.as_path());
    }

    #[test]
    fn test_newer_schema_rejected() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        conn.batch_execute("INSERT INTO schema_version (version, applied_at) VALUES (99, 'x')")
            .unwrap();
        drop(conn);
        let err = db.migrate().unwrap_err();
        assert!(matches!(err, Error::Migration(_)));
    }
}
