//! Error types for the migration engine
//!
//! One taxonomy covers load-time problems (bad sources, duplicate ids),
//! planning problems (cycles), and run-time problems (lock contention,
//! database failures).

use thiserror::Error;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Error, Debug)]
pub enum MigrateError {
    /// A migration source could not be parsed, a declared dependency could
    /// not be resolved, or a migration's steps could not be constructed
    #[error("bad migration {id}: {reason}")]
    BadMigration { id: String, reason: String },

    /// Two migrations in the same working set share an id
    #[error("migration id {0} appears more than once")]
    Conflict(String),

    /// The dependency graph contains a cycle; members are listed in
    /// discovery order
    #[error("circular dependencies among migrations: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// A dependency edge references a node that is not part of the input set
    #[error("dependency graph contains a non-existent node {0}")]
    NonExistentNode(String),

    /// The migration lock could not be acquired within the timeout
    #[error("migration lock held{}; run break_lock to clear a stale lock",
        .holder.as_ref().map(|p| format!(" by process {p}")).unwrap_or_default())]
    LockTimeout { holder: Option<i64> },

    /// Error reported by the underlying database driver
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error while reading migration sources
    #[error("migration source error: {0}")]
    Io(#[from] std::io::Error),

    /// Unusable connection URL or table configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MigrateError {
    pub fn bad_migration(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        MigrateError::BadMigration {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors raised by the database driver. The step executor
    /// consults this when deciding whether an ignore policy or a
    /// best-effort unwind applies.
    pub fn is_database_error(&self) -> bool {
        matches!(self, MigrateError::Database(_))
    }

    pub fn is_bad_migration(&self) -> bool {
        matches!(self, MigrateError::BadMigration { .. })
    }
}
