//! Core database engine traits
//!
//! These traits abstract away engine-specific behavior and give the rest of
//! the crate a single interface to work against. Engine quirks are expressed
//! as capability flags rather than subclass overrides, so callers can branch
//! on what an engine supports instead of on which engine it is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MigrateResult;

/// Parameter placeholder style expected by an engine's driver.
///
/// Bookkeeping SQL is written with `:name` placeholders and rewritten to the
/// engine's style before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `:name` passed through unchanged
    Named,
    /// Positional `?`
    Qmark,
    /// Positional `$1`, `$2`, ...
    Numbered,
    /// Positional `%s`
    Format,
    /// Named `%(name)s`
    PyFormat,
}

impl ParamStyle {
    pub fn is_positional(self) -> bool {
        matches!(
            self,
            ParamStyle::Qmark | ParamStyle::Numbered | ParamStyle::Format
        )
    }
}

/// Engine capability flags consulted by the transaction and lock managers
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Whether `ROLLBACK TO SAVEPOINT` is reliable. Without it, a nested
    /// rollback degrades to rolling back the whole transaction.
    pub savepoints: bool,
    /// Whether primary-key/unique constraints are enforced. Without them,
    /// the lock manager takes a table lock around its check-then-insert.
    pub enforces_unique_constraints: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            savepoints: true,
            enforces_unique_constraints: true,
        }
    }
}

/// Value passed to or read back from the database
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// One result row, decoded into [`Value`]s
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|ix| &self.values[ix])
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A single live driver connection.
///
/// Parameters are positional by the time they reach this trait; the named
/// form is rewritten by the owning [`Backend`](crate::backend::Backend).
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement and return the number of affected rows
    async fn execute(&mut self, sql: &str, params: &[Value]) -> MigrateResult<u64>;

    /// Execute a query and return all result rows
    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> MigrateResult<Vec<Row>>;

    /// Close the connection cleanly
    async fn close(self: Box<Self>) -> MigrateResult<()>;
}

/// Per-engine configuration: how to connect, quote, and bind for one SQL
/// engine. Implemented once per engine and selected from the connection URL.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    fn param_style(&self) -> ParamStyle;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// ANSI double-quoting; engines with other conventions override
    fn quote_identifier(&self, name: &str) -> String {
        let quoted = name.replace('"', "\"\"");
        format!("\"{quoted}\"")
    }

    /// Query returning one row per table in the current schema, table name
    /// in the first column
    fn list_tables_sql(&self) -> &'static str;

    /// Open exactly one new driver connection
    async fn connect(&self, url: &str) -> MigrateResult<Box<dyn Connection>>;
}
