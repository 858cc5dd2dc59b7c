//! Database engine abstraction
//!
//! One [`Engine`] implementation per SQL engine, selected from the
//! connection URL scheme.

use std::sync::Arc;

use crate::error::{MigrateError, MigrateResult};

pub mod core;
pub mod params;
pub mod postgres;
pub mod sqlite;

pub use self::core::{Capabilities, Connection, Engine, ParamStyle, Row, Value};
pub use params::Bound;

/// Select the engine for a connection URL
pub fn engine_for_url(url: &str) -> MigrateResult<Arc<dyn Engine>> {
    if url.starts_with("postgresql://") || url.starts_with("postgres://") {
        Ok(Arc::new(postgres::Postgres))
    } else if url.starts_with("sqlite:") {
        Ok(Arc::new(sqlite::Sqlite))
    } else {
        Err(MigrateError::Configuration(format!(
            "unable to detect database engine from URL: {url}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_detection() {
        assert_eq!(engine_for_url("postgres://u@h/db").unwrap().name(), "postgres");
        assert_eq!(
            engine_for_url("postgresql://u@h/db").unwrap().name(),
            "postgres"
        );
        assert_eq!(engine_for_url("sqlite:test.db").unwrap().name(), "sqlite");
        assert!(engine_for_url("mongodb://h/db").is_err());
    }

    #[test]
    fn default_identifier_quoting() {
        let engine = engine_for_url("sqlite:test.db").unwrap();
        assert_eq!(engine.quote_identifier("plain"), "\"plain\"");
        assert_eq!(engine.quote_identifier("od\"d"), "\"od\"\"d\"");
    }
}
