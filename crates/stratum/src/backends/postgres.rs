//! PostgreSQL engine
//!
//! One `sqlx::PgConnection` per instantiation. Postgres uses numbered
//! placeholders and supports both savepoints and enforced uniqueness, so the
//! default capability set applies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Row as _, TypeInfo};

use super::core::{Connection, Engine, ParamStyle, Row, Value};
use crate::error::MigrateResult;

pub struct Postgres;

#[async_trait]
impl Engine for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn param_style(&self) -> ParamStyle {
        ParamStyle::Numbered
    }

    fn list_tables_sql(&self) -> &'static str {
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = current_schema()"
    }

    async fn connect(&self, url: &str) -> MigrateResult<Box<dyn Connection>> {
        let conn = PgConnection::connect(url).await?;
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PgSession {
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
    mut query: Query<'q, sqlx::Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, sqlx::Postgres, PgArguments> {
    for value in params {
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Int(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.clone()),
            // Bookkeeping columns are TIMESTAMP (naive UTC)
            Value::Timestamp(v) => query.bind(v.naive_utc()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Row {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (ix, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(ix)
                .ok()
                .flatten()
                .map(|v| Value::Int(v as i64)),
            "INT4" => row
                .try_get::<Option<i32>, _>(ix)
                .ok()
                .flatten()
                .map(|v| Value::Int(v as i64)),
            "INT8" => row
                .try_get::<Option<i64>, _>(ix)
                .ok()
                .flatten()
                .map(Value::Int),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(ix)
                .ok()
                .flatten()
                .map(|t| Value::Timestamp(DateTime::from_naive_utc_and_offset(t, Utc))),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(ix)
                .ok()
                .flatten()
                .map(Value::Timestamp),
            _ => row
                .try_get::<Option<String>, _>(ix)
                .ok()
                .flatten()
                .map(Value::Text),
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Row::new(columns, values)
}
