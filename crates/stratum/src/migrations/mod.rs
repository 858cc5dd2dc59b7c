//! Migration definitions, filesystem discovery, and dependency planning

pub mod definitions;
pub mod loader;
pub mod sort;

pub use definitions::{
    migration_hash, Direction, IgnoreErrors, Migration, MigrationBuilder, MigrationKind,
    MigrationList, Step, StepBody,
};
pub use loader::{read_migrations, split_sql_statements, TEMPFILE_PREFIX};
pub use sort::{ancestors, descendants, heads, sort_migrations, TopologicalSorter};
