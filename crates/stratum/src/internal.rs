//! Versioned bookkeeping schema
//!
//! The engine's own tables evolve too. Version 1 is the legacy layout, a
//! single table of applied ids and creation times. Version 2 keys the
//! applied table by migration hash and adds an audit log plus a version
//! marker table. Upgrades run one version at a time and preserve existing
//! records by backfilling the log from the legacy table.

use chrono::Utc;
use uuid::Uuid;

use crate::backend::Backend;
use crate::backends::core::Value;
use crate::error::MigrateResult;

/// Newest bookkeeping layout
pub const CURRENT_VERSION: i64 = 2;

/// The version marker table only exists from this version on; earlier
/// layouts are recognized by table shape alone.
pub const USE_VERSION_TABLE_FROM: i64 = 2;

const BACKFILL_COMMENT: &str =
    "this log entry created automatically by an internal schema upgrade";

/// Detect the installed bookkeeping version. No marker table plus no
/// migrations table means a fresh database.
pub async fn current_version(backend: &mut Backend) -> MigrateResult<i64> {
    let tables = backend.list_tables().await?;
    let config = backend.config().clone();
    if tables.iter().any(|t| t == &config.version_table) {
        let sql = format!(
            "SELECT MAX(version) AS version FROM {}",
            backend.quote_identifier(&config.version_table)
        );
        let rows = backend.fetch_all(&sql, &[]).await?;
        if let Some(version) = rows.first().and_then(|row| row.get("version")?.as_i64()) {
            return Ok(version);
        }
        return Ok(USE_VERSION_TABLE_FROM - 1);
    }
    if tables.iter().any(|t| t == &config.migrations_table) {
        return Ok(1);
    }
    Ok(0)
}

pub async fn needs_upgrade(backend: &mut Backend) -> MigrateResult<bool> {
    Ok(current_version(backend).await? < CURRENT_VERSION)
}

/// Bring the bookkeeping schema up to [`CURRENT_VERSION`]. Each version
/// step runs in its own transaction where the database supports
/// transactional DDL.
pub async fn upgrade(backend: &mut Backend) -> MigrateResult<()> {
    let mut version = current_version(backend).await?;
    while version < CURRENT_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "upgrading bookkeeping schema");
        if backend.has_transactional_ddl() {
            let scope = backend.begin().await?;
            match apply_version_step(backend, next).await {
                Ok(()) => backend.commit_scope(scope).await?,
                Err(e) => {
                    backend.rollback_scope(scope).await?;
                    return Err(e);
                }
            }
        } else {
            apply_version_step(backend, next).await?;
        }
        version = next;
    }
    Ok(())
}

async fn apply_version_step(backend: &mut Backend, version: i64) -> MigrateResult<()> {
    match version {
        1 => upgrade_to_v1(backend).await?,
        2 => upgrade_v1_to_v2(backend).await?,
        other => unreachable!("no upgrade step for bookkeeping version {other}"),
    }
    mark_version(backend, version).await
}

/// Legacy layout: applied ids keyed by name
async fn upgrade_to_v1(backend: &mut Backend) -> MigrateResult<()> {
    let table = backend.quote_identifier(&backend.config().migrations_table);
    backend
        .execute(
            &format!(
                "CREATE TABLE {table} (id VARCHAR(255) NOT NULL PRIMARY KEY, \
                 ctime TIMESTAMP)"
            ),
            &[],
        )
        .await?;
    Ok(())
}

/// Hash-keyed layout plus audit log. Legacy rows become synthetic apply
/// log entries before the old table is dropped.
async fn upgrade_v1_to_v2(backend: &mut Backend) -> MigrateResult<()> {
    let config = backend.config().clone();
    let migrations = backend.quote_identifier(&config.migrations_table);
    let log = backend.quote_identifier(&config.log_table);
    let version = backend.quote_identifier(&config.version_table);

    backend
        .execute(
            &format!(
                "CREATE TABLE {log} (\
                 id VARCHAR(36) NOT NULL PRIMARY KEY, \
                 migration_hash VARCHAR(64), \
                 migration_id VARCHAR(255), \
                 operation VARCHAR(10), \
                 username VARCHAR(255), \
                 hostname VARCHAR(255), \
                 comment VARCHAR(255), \
                 created_at_utc TIMESTAMP)"
            ),
            &[],
        )
        .await?;
    backend
        .execute(
            &format!(
                "CREATE TABLE {version} (\
                 version INT NOT NULL PRIMARY KEY, \
                 installed_at_utc TIMESTAMP)"
            ),
            &[],
        )
        .await?;

    let legacy_rows = backend
        .fetch_all(&format!("SELECT id, ctime FROM {migrations}"), &[])
        .await?;
    for row in &legacy_rows {
        let migration_id = row
            .get("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let hash = crate::migrations::migration_hash(&migration_id);
        backend
            .execute(
                &format!(
                    "INSERT INTO {log} \
                     (id, migration_hash, migration_id, operation, \
                      username, hostname, comment, created_at_utc) \
                     VALUES (:id, :hash, :migration_id, 'apply', \
                             NULL, NULL, :comment, :created_at)"
                ),
                &[
                    ("id", Value::from(Uuid::new_v4().to_string())),
                    ("hash", Value::from(hash)),
                    ("migration_id", Value::from(migration_id)),
                    ("comment", Value::from(BACKFILL_COMMENT)),
                    ("created_at", Value::from(Utc::now())),
                ],
            )
            .await?;
    }

    backend
        .execute(&format!("DROP TABLE {migrations}"), &[])
        .await?;
    backend
        .execute(
            &format!(
                "CREATE TABLE {migrations} (\
                 migration_hash VARCHAR(64) NOT NULL PRIMARY KEY, \
                 migration_id VARCHAR(255), \
                 applied_at_utc TIMESTAMP)"
            ),
            &[],
        )
        .await?;
    backend
        .execute(
            &format!(
                "INSERT INTO {migrations} (migration_hash, migration_id, applied_at_utc) \
                 SELECT migration_hash, migration_id, created_at_utc \
                 FROM {log} WHERE operation = 'apply'"
            ),
            &[],
        )
        .await?;
    Ok(())
}

/// Record the installed version. Versions before the marker table existed
/// leave no record.
async fn mark_version(backend: &mut Backend, version: i64) -> MigrateResult<()> {
    if version < USE_VERSION_TABLE_FROM {
        return Ok(());
    }
    let table = backend.quote_identifier(&backend.config().version_table);
    backend
        .execute(
            &format!(
                "INSERT INTO {table} (version, installed_at_utc) \
                 VALUES (:version, :installed_at)"
            ),
            &[
                ("version", Value::Int(version)),
                ("installed_at", Value::from(Utc::now())),
            ],
        )
        .await?;
    Ok(())
}
