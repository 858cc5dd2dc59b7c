//! Configuration for the migration engine
//!
//! Holds the names of the engine's own bookkeeping tables. These live in the
//! target database alongside user schema but are managed exclusively by
//! stratum.

use serde::{Deserialize, Serialize};

/// Default name of the applied-migrations table
pub const DEFAULT_MIGRATIONS_TABLE: &str = "_stratum_migrations";

/// Bookkeeping table names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Applied-migration records: (hash, id, applied_at_utc)
    pub migrations_table: String,
    /// Append-only audit log of apply/rollback/mark/unmark operations
    pub log_table: String,
    /// Single-row distributed lock table
    pub lock_table: String,
    /// Internal schema version marker
    pub version_table: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            log_table: "_stratum_log".to_string(),
            lock_table: "stratum_lock".to_string(),
            version_table: "_stratum_version".to_string(),
        }
    }
}

impl Config {
    /// Use a non-default applied-migrations table, keeping the other
    /// bookkeeping tables at their defaults.
    pub fn with_migrations_table(name: impl Into<String>) -> Self {
        Self {
            migrations_table: name.into(),
            ..Self::default()
        }
    }
}
