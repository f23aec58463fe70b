//! Mapping from sqlx failures onto checkpoint error kinds.

use agent_graph_checkpoint::CheckpointError;
use thiserror::Error;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT_PRIMARYKEY: i32 = 1555;
const SQLITE_CONSTRAINT_UNIQUE: i32 = 2067;

#[derive(Error, Debug)]
pub enum SqliteError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<SqliteError> for CheckpointError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Database(e) => classify("connect", "*", e),
            SqliteError::Migrate(e) => CheckpointError::unavailable("migrate", "*", e.to_string()),
        }
    }
}

/// Translate a sqlx error raised by `operation` on `thread_id`.
pub(crate) fn classify(operation: &'static str, thread_id: &str, err: sqlx::Error) -> CheckpointError {
    match err {
        sqlx::Error::RowNotFound => CheckpointError::not_found_with_id("row", thread_id),
        sqlx::Error::Database(db) => {
            let code = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .unwrap_or_default();
            match code {
                c if c & 0xff == SQLITE_BUSY || c & 0xff == SQLITE_LOCKED => {
                    CheckpointError::conflict(operation, thread_id, db.message().to_string())
                }
                SQLITE_CONSTRAINT_PRIMARYKEY | SQLITE_CONSTRAINT_UNIQUE => {
                    CheckpointError::conflict(operation, thread_id, db.message().to_string())
                }
                _ => CheckpointError::unavailable(operation, thread_id, db.message().to_string()),
            }
        }
        sqlx::Error::Migrate(e) => CheckpointError::unavailable(operation, thread_id, e.to_string()),
        other => CheckpointError::unavailable(operation, thread_id, other.to_string()),
    }
}

pub(crate) trait SqlxResultExt<T> {
    fn during(self, operation: &'static str, thread_id: &str) -> agent_graph_checkpoint::Result<T>;
}

impl<T> SqlxResultExt<T> for Result<T, sqlx::Error> {
    fn during(self, operation: &'static str, thread_id: &str) -> agent_graph_checkpoint::Result<T> {
        self.map_err(|e| classify(operation, thread_id, e))
    }
}
