//! SQLite engine
//!
//! Connects with `create_if_missing` so a migration run can bootstrap a new
//! database file. Declared column types in SQLite are advisory, so decoding
//! works from the declared type name with fallbacks.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection as _, Row as _, TypeInfo};

use super::core::{Connection, Engine, ParamStyle, Row, Value};
use crate::error::MigrateResult;

pub struct Sqlite;

#[async_trait]
impl Engine for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn param_style(&self) -> ParamStyle {
        ParamStyle::Qmark
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT name FROM sqlite_master WHERE type = 'table'"
    }

    async fn connect(&self, url: &str) -> MigrateResult<Box<dyn Connection>> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let conn = options.connect().await?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: SqliteConnection,
}

#[async_trait]
impl Connection for SqliteSession {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> MigrateResult<u64> {
        let query = bind_values(sqlx::query(sql), params);
        let result = query.execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> MigrateResult<Vec<Row>> {
        let query = bind_values(sqlx::query(sql), params);
        let rows = query.fetch_all(&mut self.conn).await?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn bind_values<'q>(
    mut query: Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    params: &[Value],
) -> Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Int(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            Value::Timestamp(v) => query.bind(v.naive_utc()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Row {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (ix, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        let type_name = column.type_info().name().to_uppercase();
        let value = if type_name.contains("INT") || type_name == "BOOLEAN" {
            row.try_get::<Option<i64>, _>(ix)
                .ok()
                .flatten()
                .map(Value::Int)
        } else if type_name.contains("DATE") || type_name.contains("TIME") {
            row.try_get::<Option<chrono::NaiveDateTime>, _>(ix)
                .ok()
                .flatten()
                .map(|t| Value::Timestamp(DateTime::from_naive_utc_and_offset(t, Utc)))
                .or_else(|| {
                    row.try_get::<Option<String>, _>(ix)
                        .ok()
                        .flatten()
                        .map(Value::Text)
                })
        } else {
            row.try_get::<Option<String>, _>(ix)
                .ok()
                .flatten()
                .map(Value::Text)
                .or_else(|| {
                    row.try_get::<Option<i64>, _>(ix)
                        .ok()
                        .flatten()
                        .map(Value::Int)
                })
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Row::new(columns, values)
}
