//! Stratum - dependency-ordered database schema migrations
//!
//! Migrations are SQL files (or code-built definitions) with declared
//! dependencies. Stratum discovers them, plans a dependency-respecting
//! order, and applies or rolls them back transactionally, tracking what
//! has run in hash-keyed bookkeeping tables with a full audit log. A
//! cross-process lock keeps concurrent migrators from racing each other.
//!
//! ```no_run
//! use stratum::{get_backend, read_migrations, Config};
//!
//! # async fn demo() -> stratum::MigrateResult<()> {
//! let migrations = read_migrations(&["migrations".into()])?;
//! let mut backend = get_backend("sqlite:app.db", Config::default()).await?;
//! let pending = backend.to_apply(&migrations).await?;
//! backend.apply_migrations(&pending, false).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod error;
pub mod internal;
pub mod lock;
pub mod migrations;

pub use backend::{get_backend, Backend, TxScope};
pub use backends::core::{Capabilities, Connection, Engine, ParamStyle, Row, Value};
pub use config::Config;
pub use error::{MigrateError, MigrateResult};
pub use lock::DEFAULT_LOCK_TIMEOUT;
pub use migrations::{
    ancestors, descendants, heads, migration_hash, read_migrations, sort_migrations,
    Direction, IgnoreErrors, Migration, MigrationBuilder, MigrationList, Step, StepBody,
};
