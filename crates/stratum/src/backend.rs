//! Backend orchestration
//!
//! A [`Backend`] owns one driver connection plus the engine-specific
//! knowledge needed to run migrations against it: parameter rewriting,
//! transaction and savepoint management, the bookkeeping tables, and the
//! apply/rollback/mark operations themselves.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::backends::core::{Capabilities, Connection, Engine, Row, Value};
use crate::backends::{engine_for_url, params};
use crate::config::Config;
use crate::error::{MigrateError, MigrateResult};
use crate::internal;
use crate::lock::DEFAULT_LOCK_TIMEOUT;
use crate::migrations::{
    sort_migrations, Direction, Migration, MigrationList, Step, StepBody,
};

/// Whether DDL participates in transactions is a property of the server,
/// so one probe per connection URL is enough for the process lifetime.
static TRANSACTIONAL_DDL_CACHE: Lazy<Mutex<HashMap<String, bool>>> =
    Lazy::new(Default::default);

/// Handle returned by [`Backend::begin`]. Scopes never nest implicitly; the
/// caller that began a scope must commit or roll it back.
#[derive(Debug)]
pub enum TxScope {
    Outer,
    Savepoint(String),
}

/// Open a backend for the given connection URL. The engine is selected
/// from the URL scheme; the lock table is created and transactional DDL
/// support probed before the backend is handed out.
pub async fn get_backend(url: &str, config: Config) -> MigrateResult<Backend> {
    let engine = engine_for_url(url)?;
    let conn = engine.connect(url).await?;
    let caps = engine.capabilities();
    let mut backend = Backend {
        engine,
        conn,
        url: url.to_string(),
        config,
        caps,
        has_transactional_ddl: true,
        in_transaction: false,
        savepoint_seq: 0,
        lock_depth: 0,
        lock_timeout: DEFAULT_LOCK_TIMEOUT,
        internal_schema_updated: false,
    };
    backend.init_database().await?;
    Ok(backend)
}

pub struct Backend {
    engine: Arc<dyn Engine>,
    conn: Box<dyn Connection>,
    url: String,
    config: Config,
    caps: Capabilities,
    has_transactional_ddl: bool,
    in_transaction: bool,
    savepoint_seq: usize,
    pub(crate) lock_depth: usize,
    lock_timeout: Duration,
    internal_schema_updated: bool,
}

impl Backend {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn has_transactional_ddl(&self) -> bool {
        self.has_transactional_ddl
    }

    pub fn quote_identifier(&self, name: &str) -> String {
        self.engine.quote_identifier(name)
    }

    /// How long state-mutating operations wait for the migration lock
    /// before giving up
    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    /// Open a second connection to the same database sharing this
    /// backend's configuration and probe results. Migration SQL runs on a
    /// duplicate so bookkeeping on the primary connection stays isolated
    /// from whatever state the migration leaves behind.
    pub async fn duplicate(&self) -> MigrateResult<Backend> {
        let conn = self.engine.connect(&self.url).await?;
        Ok(Backend {
            engine: self.engine.clone(),
            conn,
            url: self.url.clone(),
            config: self.config.clone(),
            caps: self.caps,
            has_transactional_ddl: self.has_transactional_ddl,
            in_transaction: false,
            savepoint_seq: 0,
            lock_depth: 0,
            lock_timeout: self.lock_timeout,
            internal_schema_updated: self.internal_schema_updated,
        })
    }

    pub async fn close(self) -> MigrateResult<()> {
        self.conn.close().await
    }

    /// Execute a statement written with `:name` placeholders
    pub async fn execute(&mut self, sql: &str, params: &[(&str, Value)]) -> MigrateResult<u64> {
        let (rewritten, bound) = params::rewrite(self.engine.param_style(), sql, params);
        self.conn.execute(&rewritten, &bound.into_values()).await
    }

    /// Run a query written with `:name` placeholders
    pub async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[(&str, Value)],
    ) -> MigrateResult<Vec<Row>> {
        let (rewritten, bound) = params::rewrite(self.engine.param_style(), sql, params);
        self.conn.fetch_all(&rewritten, &bound.into_values()).await
    }

    /// Names of all tables visible in the current schema
    pub async fn list_tables(&mut self) -> MigrateResult<Vec<String>> {
        let rows = self.fetch_all(self.engine.list_tables_sql(), &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_index(0).and_then(|v| v.as_str().map(str::to_string)))
            .collect())
    }

    // --- transactions -----------------------------------------------------

    /// Begin a transaction scope. Inside an open transaction this becomes a
    /// savepoint, so scopes nest to any depth.
    pub async fn begin(&mut self) -> MigrateResult<TxScope> {
        if !self.in_transaction {
            self.conn.execute("BEGIN", &[]).await?;
            self.in_transaction = true;
            Ok(TxScope::Outer)
        } else {
            self.savepoint_seq += 1;
            let name = format!("sp_{}", self.savepoint_seq);
            if self.caps.savepoints {
                self.conn.execute(&format!("SAVEPOINT {name}"), &[]).await?;
            }
            Ok(TxScope::Savepoint(name))
        }
    }

    /// Committing a savepoint scope is a no-op; its work commits or rolls
    /// back with the outer transaction.
    pub async fn commit_scope(&mut self, scope: TxScope) -> MigrateResult<()> {
        match scope {
            TxScope::Outer => {
                self.conn.execute("COMMIT", &[]).await?;
                self.in_transaction = false;
                Ok(())
            }
            TxScope::Savepoint(_) => Ok(()),
        }
    }

    /// Without savepoint support a nested rollback degrades to rolling
    /// back the whole transaction.
    pub async fn rollback_scope(&mut self, scope: TxScope) -> MigrateResult<()> {
        match scope {
            TxScope::Outer => {
                self.conn.execute("ROLLBACK", &[]).await?;
                self.in_transaction = false;
                Ok(())
            }
            TxScope::Savepoint(name) => {
                if self.caps.savepoints {
                    self.conn
                        .execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                        .await?;
                } else {
                    self.conn.execute("ROLLBACK", &[]).await?;
                    self.in_transaction = false;
                }
                Ok(())
            }
        }
    }

    // --- initialization ---------------------------------------------------

    async fn init_database(&mut self) -> MigrateResult<()> {
        self.create_lock_table().await;
        let cached = {
            let cache = TRANSACTIONAL_DDL_CACHE.lock().unwrap();
            cache.get(&self.url).copied()
        };
        self.has_transactional_ddl = match cached {
            Some(probed) => probed,
            None => {
                let probed = self.probe_transactional_ddl().await;
                TRANSACTIONAL_DDL_CACHE
                    .lock()
                    .unwrap()
                    .insert(self.url.clone(), probed);
                probed
            }
        };
        Ok(())
    }

    /// Create a table inside a rolled-back transaction, then see whether it
    /// survived. A surviving table means DDL commits immediately.
    async fn probe_transactional_ddl(&mut self) -> bool {
        let table =
            self.quote_identifier(&format!("_tmp_ddl_probe_{}", Uuid::new_v4().simple()));
        let Ok(scope) = self.begin().await else {
            return true;
        };
        if self.execute(&format!("CREATE TABLE {table} (id INT)"), &[]).await.is_err() {
            let _ = self.rollback_scope(scope).await;
            return true;
        }
        if self.rollback_scope(scope).await.is_err() {
            return true;
        }
        let Ok(scope) = self.begin().await else {
            return true;
        };
        match self.execute(&format!("DROP TABLE {table}"), &[]).await {
            Ok(_) => {
                let _ = self.commit_scope(scope).await;
                false
            }
            Err(_) => {
                let _ = self.rollback_scope(scope).await;
                true
            }
        }
    }

    /// Upgrade the bookkeeping schema if needed, at most once per backend.
    /// The migration lock is held across the upgrade.
    pub async fn ensure_internal_schema_updated(&mut self) -> MigrateResult<()> {
        if self.internal_schema_updated {
            return Ok(());
        }
        if internal::needs_upgrade(self).await? {
            self.lock(self.lock_timeout).await?;
            let upgraded = internal::upgrade(self).await;
            let released = self.unlock().await;
            upgraded?;
            released?;
        }
        self.internal_schema_updated = true;
        Ok(())
    }

    // --- applied-state queries --------------------------------------------

    /// Hashes of applied migrations in application order
    pub async fn applied_migration_hashes(&mut self) -> MigrateResult<Vec<String>> {
        self.ensure_internal_schema_updated().await?;
        let table = self.quote_identifier(&self.config.migrations_table);
        let rows = self
            .fetch_all(
                &format!("SELECT migration_hash FROM {table} ORDER BY applied_at_utc"),
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_index(0).and_then(|v| v.as_str().map(str::to_string)))
            .collect())
    }

    pub async fn is_applied(&mut self, migration: &Migration) -> MigrateResult<bool> {
        self.ensure_internal_schema_updated().await?;
        let table = self.quote_identifier(&self.config.migrations_table);
        let rows = self
            .fetch_all(
                &format!(
                    "SELECT COUNT(1) AS applied FROM {table} WHERE migration_hash = :hash"
                ),
                &[("hash", Value::from(migration.hash()))],
            )
            .await?;
        let count = rows
            .first()
            .and_then(|row| row.get("applied")?.as_i64())
            .unwrap_or(0);
        Ok(count > 0)
    }

    /// Unapplied migrations in dependency order, post-apply hooks carried
    /// along unchanged
    pub async fn to_apply(&mut self, migrations: &MigrationList) -> MigrateResult<MigrationList> {
        let applied: HashSet<String> =
            self.applied_migration_hashes().await?.into_iter().collect();
        let pending = migrations.filter(|m| !applied.contains(m.hash()));
        let ordered = sort_migrations(pending.iter().cloned())?;
        pending.replace_items(ordered)
    }

    /// Applied migrations in reverse dependency order
    pub async fn to_rollback(
        &mut self,
        migrations: &MigrationList,
    ) -> MigrateResult<MigrationList> {
        let applied: HashSet<String> =
            self.applied_migration_hashes().await?.into_iter().collect();
        let done = migrations.filter(|m| applied.contains(m.hash()));
        let mut ordered = sort_migrations(done.iter().cloned())?;
        ordered.reverse();
        done.replace_items(ordered)
    }

    // --- batch operations -------------------------------------------------

    /// Apply every migration in the list, then run the post-apply hooks
    pub async fn apply_migrations(
        &mut self,
        migrations: &MigrationList,
        force: bool,
    ) -> MigrateResult<()> {
        if migrations.is_empty() {
            return Ok(());
        }
        self.lock(self.lock_timeout).await?;
        let applied = self.apply_migrations_only(migrations, force).await;
        let hooks = match &applied {
            Ok(()) => self.run_post_apply(migrations, force).await,
            Err(_) => Ok(()),
        };
        let released = self.unlock().await;
        applied?;
        hooks?;
        released
    }

    /// Apply without running post-apply hooks. A migration whose steps
    /// cannot be constructed is skipped; any other failure stops the batch.
    pub async fn apply_migrations_only(
        &mut self,
        migrations: &MigrationList,
        force: bool,
    ) -> MigrateResult<()> {
        if migrations.is_empty() {
            return Ok(());
        }
        self.ensure_internal_schema_updated().await?;
        self.lock(self.lock_timeout).await?;
        let mut outcome = Ok(());
        for migration in migrations {
            match self.apply_one(migration, force, true).await {
                Ok(()) => {}
                Err(e) if e.is_bad_migration() => {
                    tracing::error!("skipping unloadable migration: {}", e);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        let released = self.unlock().await;
        outcome?;
        released
    }

    /// Run the list's post-apply hooks. Hooks run every batch and are
    /// never marked as applied.
    pub async fn run_post_apply(
        &mut self,
        migrations: &MigrationList,
        force: bool,
    ) -> MigrateResult<()> {
        if migrations.post_apply().is_empty() {
            return Ok(());
        }
        self.lock(self.lock_timeout).await?;
        let mut outcome = Ok(());
        for hook in migrations.post_apply() {
            if let Err(e) = self.apply_one(hook, force, false).await {
                outcome = Err(e);
                break;
            }
        }
        let released = self.unlock().await;
        outcome?;
        released
    }

    pub async fn rollback_migrations(
        &mut self,
        migrations: &MigrationList,
        force: bool,
    ) -> MigrateResult<()> {
        if migrations.is_empty() {
            return Ok(());
        }
        self.ensure_internal_schema_updated().await?;
        self.lock(self.lock_timeout).await?;
        let mut outcome = Ok(());
        for migration in migrations {
            match self.rollback_one(migration, force).await {
                Ok(()) => {}
                Err(e) if e.is_bad_migration() => {
                    tracing::error!("skipping unloadable migration: {}", e);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        let released = self.unlock().await;
        outcome?;
        released
    }

    /// Record migrations as applied without running them
    pub async fn mark_migrations(&mut self, migrations: &MigrationList) -> MigrateResult<()> {
        self.ensure_internal_schema_updated().await?;
        self.lock(self.lock_timeout).await?;
        let outcome = self.mark_all(migrations).await;
        let released = self.unlock().await;
        outcome?;
        released
    }

    async fn mark_all(&mut self, migrations: &MigrationList) -> MigrateResult<()> {
        let scope = self.begin().await?;
        let mut outcome = Ok(());
        for migration in migrations {
            if let Err(e) = self.mark_one(migration).await {
                outcome = Err(e);
                break;
            }
            if let Err(e) = self.log_migration(migration, "mark", None).await {
                outcome = Err(e);
                break;
            }
        }
        match outcome {
            Ok(()) => self.commit_scope(scope).await,
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }

    /// Erase the applied record without running rollback steps
    pub async fn unmark_migrations(&mut self, migrations: &MigrationList) -> MigrateResult<()> {
        self.ensure_internal_schema_updated().await?;
        self.lock(self.lock_timeout).await?;
        let outcome = self.unmark_all(migrations).await;
        let released = self.unlock().await;
        outcome?;
        released
    }

    async fn unmark_all(&mut self, migrations: &MigrationList) -> MigrateResult<()> {
        let scope = self.begin().await?;
        let mut outcome = Ok(());
        for migration in migrations {
            if let Err(e) = self.unmark_one(migration).await {
                outcome = Err(e);
                break;
            }
            if let Err(e) = self.log_migration(migration, "unmark", None).await {
                outcome = Err(e);
                break;
            }
        }
        match outcome {
            Ok(()) => self.commit_scope(scope).await,
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }

    // --- single-migration operations --------------------------------------

    /// Run one migration's steps on a duplicate connection, then record it
    /// in a short transaction on this one. With `mark` false only the audit
    /// log is written, which is how post-apply hooks are recorded.
    pub async fn apply_one(
        &mut self,
        migration: &Migration,
        force: bool,
        mark: bool,
    ) -> MigrateResult<()> {
        tracing::info!(id = migration.id(), "applying");
        self.ensure_internal_schema_updated().await?;
        let mut worker = self.duplicate().await?;
        let ran = worker.process_steps(migration, Direction::Apply, force).await;
        let _ = worker.close().await;
        ran?;

        let scope = self.begin().await?;
        let recorded = async {
            if mark {
                self.mark_one(migration).await?;
            }
            self.log_migration(migration, "apply", None).await
        };
        match recorded.await {
            Ok(()) => self.commit_scope(scope).await,
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }

    pub async fn rollback_one(&mut self, migration: &Migration, force: bool) -> MigrateResult<()> {
        tracing::info!(id = migration.id(), "rolling back");
        self.ensure_internal_schema_updated().await?;
        let mut worker = self.duplicate().await?;
        let ran = worker
            .process_steps(migration, Direction::Rollback, force)
            .await;
        let _ = worker.close().await;
        ran?;

        let scope = self.begin().await?;
        let recorded = async {
            self.unmark_one(migration).await?;
            self.log_migration(migration, "rollback", None).await
        };
        match recorded.await {
            Ok(()) => self.commit_scope(scope).await,
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }

    async fn mark_one(&mut self, migration: &Migration) -> MigrateResult<()> {
        let table = self.quote_identifier(&self.config.migrations_table);
        self.execute(
            &format!("DELETE FROM {table} WHERE migration_hash = :hash"),
            &[("hash", Value::from(migration.hash()))],
        )
        .await?;
        self.execute(
            &format!(
                "INSERT INTO {table} (migration_hash, migration_id, applied_at_utc) \
                 VALUES (:hash, :id, :applied_at)"
            ),
            &[
                ("hash", Value::from(migration.hash())),
                ("id", Value::from(migration.id())),
                ("applied_at", Value::from(Utc::now())),
            ],
        )
        .await?;
        Ok(())
    }

    async fn unmark_one(&mut self, migration: &Migration) -> MigrateResult<()> {
        let table = self.quote_identifier(&self.config.migrations_table);
        self.execute(
            &format!("DELETE FROM {table} WHERE migration_hash = :hash"),
            &[("hash", Value::from(migration.hash()))],
        )
        .await?;
        Ok(())
    }

    /// Append one audit log entry recording who did what and when
    async fn log_migration(
        &mut self,
        migration: &Migration,
        operation: &str,
        comment: Option<&str>,
    ) -> MigrateResult<()> {
        let table = self.quote_identifier(&self.config.log_table);
        self.execute(
            &format!(
                "INSERT INTO {table} \
                 (id, migration_hash, migration_id, operation, \
                  username, hostname, comment, created_at_utc) \
                 VALUES (:id, :hash, :migration_id, :operation, \
                         :username, :hostname, :comment, :created_at)"
            ),
            &[
                ("id", Value::from(Uuid::new_v4().to_string())),
                ("hash", Value::from(migration.hash())),
                ("migration_id", Value::from(migration.id())),
                ("operation", Value::from(operation)),
                ("username", Value::from(username())),
                ("hostname", Value::from(hostname())),
                ("comment", Value::from(comment.map(str::to_string))),
                ("created_at", Value::from(Utc::now())),
            ],
        )
        .await?;
        Ok(())
    }

    // --- step execution ---------------------------------------------------

    /// Run a migration's steps in the given direction. Transactional
    /// migrations get one outer transaction; each step additionally runs
    /// under a savepoint so an ignored failure cannot poison the rest.
    ///
    /// When the database commits DDL immediately, or the migration opted
    /// out of transactions, a failure leaves earlier steps permanently
    /// applied. Those are unwound best-effort by running their inverses in
    /// reverse order before the original error is reported.
    async fn process_steps(
        &mut self,
        migration: &Migration,
        direction: Direction,
        force: bool,
    ) -> MigrateResult<()> {
        let steps: Vec<Step> = migration.steps()?.to_vec();
        let ordered: Vec<Step> = match direction {
            Direction::Apply => steps,
            Direction::Rollback => steps.into_iter().rev().collect(),
        };
        let use_transactions = migration.use_transactions();
        let outer = if use_transactions {
            Some(self.begin().await?)
        } else {
            None
        };

        let mut executed: Vec<Step> = Vec::new();
        let mut failure: Option<MigrateError> = None;
        for step in ordered {
            match self.run_step(&step, direction, force).await {
                Ok(()) => executed.push(step),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            None => {
                if let Some(scope) = outer {
                    self.commit_scope(scope).await?;
                }
                Ok(())
            }
            Some(e) => {
                if e.is_database_error()
                    && (!self.has_transactional_ddl || !use_transactions)
                {
                    tracing::error!(
                        id = migration.id(),
                        "step failed outside transactional cover, unwinding {} executed step(s)",
                        executed.len()
                    );
                    for step in executed.iter().rev() {
                        if let Err(undo) =
                            self.run_step(step, direction.reversed(), false).await
                        {
                            tracing::error!("unwind stopped: {}", undo);
                            break;
                        }
                    }
                }
                if let Some(scope) = outer {
                    let _ = self.rollback_scope(scope).await;
                }
                Err(e)
            }
        }
    }

    /// Execute one step, recursing into groups. The ignore policy (or
    /// `force`) swallows database errors only, after the step's savepoint
    /// has been rolled back.
    fn run_step<'a>(
        &'a mut self,
        step: &'a Step,
        direction: Direction,
        force: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = MigrateResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let attempt = match &step.body {
                StepBody::Sql { apply, rollback } => {
                    let statement = match direction {
                        Direction::Apply => apply.as_deref(),
                        Direction::Rollback => rollback.as_deref(),
                    };
                    match statement {
                        None => Ok(()),
                        Some(sql) => {
                            tracing::debug!(sql, "executing");
                            if self.in_transaction {
                                let scope = self.begin().await?;
                                match self.execute(sql, &[]).await {
                                    Ok(_) => self.commit_scope(scope).await,
                                    Err(e) => {
                                        let _ = self.rollback_scope(scope).await;
                                        Err(e)
                                    }
                                }
                            } else {
                                self.execute(sql, &[]).await.map(|_| ())
                            }
                        }
                    }
                }
                StepBody::Group(children) => {
                    let ordered: Vec<&Step> = match direction {
                        Direction::Apply => children.iter().collect(),
                        Direction::Rollback => children.iter().rev().collect(),
                    };
                    let mut result = Ok(());
                    for child in ordered {
                        if let Err(e) = self.run_step(child, direction, force).await {
                            result = Err(e);
                            break;
                        }
                    }
                    result
                }
            };
            match attempt {
                Err(e)
                    if e.is_database_error()
                        && (force || step.ignore_errors.covers(direction)) =>
                {
                    tracing::warn!("ignoring error in migration step: {}", e);
                    Ok(())
                }
                other => other,
            }
        })
    }
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::core::ParamStyle;
    use async_trait::async_trait;

    /// Records every statement instead of talking to a database
    struct RecordingConnection {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn execute(&mut self, sql: &str, _params: &[Value]) -> MigrateResult<u64> {
            self.log.lock().unwrap().push(sql.to_string());
            Ok(0)
        }

        async fn fetch_all(&mut self, sql: &str, _params: &[Value]) -> MigrateResult<Vec<Row>> {
            self.log.lock().unwrap().push(sql.to_string());
            Ok(Vec::new())
        }

        async fn close(self: Box<Self>) -> MigrateResult<()> {
            Ok(())
        }
    }

    struct FlaggedEngine {
        caps: Capabilities,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Engine for FlaggedEngine {
        fn name(&self) -> &'static str {
            "flagged"
        }

        fn param_style(&self) -> ParamStyle {
            ParamStyle::Qmark
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn list_tables_sql(&self) -> &'static str {
            "SELECT name FROM tables"
        }

        async fn connect(&self, _url: &str) -> MigrateResult<Box<dyn Connection>> {
            Ok(Box::new(RecordingConnection {
                log: self.log.clone(),
            }))
        }
    }

    fn flagged_backend(caps: Capabilities) -> (Backend, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let backend = Backend {
            engine: Arc::new(FlaggedEngine {
                caps,
                log: log.clone(),
            }),
            conn: Box::new(RecordingConnection { log: log.clone() }),
            url: "flagged:test".to_string(),
            config: Config::default(),
            caps,
            has_transactional_ddl: true,
            in_transaction: false,
            savepoint_seq: 0,
            lock_depth: 0,
            lock_timeout: Duration::from_millis(100),
            internal_schema_updated: true,
        };
        (backend, log)
    }

    fn statements(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn nested_scopes_use_savepoints_when_supported() {
        let (mut backend, log) = flagged_backend(Capabilities::default());
        let outer = backend.begin().await.unwrap();
        let inner = backend.begin().await.unwrap();
        backend.rollback_scope(inner).await.unwrap();
        backend.commit_scope(outer).await.unwrap();
        assert_eq!(
            statements(&log),
            vec!["BEGIN", "SAVEPOINT sp_1", "ROLLBACK TO SAVEPOINT sp_1", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn without_savepoints_nested_rollback_rolls_back_everything() {
        let caps = Capabilities {
            savepoints: false,
            ..Capabilities::default()
        };
        let (mut backend, log) = flagged_backend(caps);
        let _outer = backend.begin().await.unwrap();
        let inner = backend.begin().await.unwrap();
        backend.rollback_scope(inner).await.unwrap();
        // no savepoint was issued and the whole transaction is gone
        assert_eq!(statements(&log), vec!["BEGIN", "ROLLBACK"]);
        assert!(!backend.in_transaction);
    }

    #[tokio::test]
    async fn lock_uses_plain_insert_with_unique_enforcement() {
        let (mut backend, log) = flagged_backend(Capabilities::default());
        backend.lock(Duration::from_millis(100)).await.unwrap();
        let recorded = statements(&log);
        assert!(recorded.iter().any(|s| s.starts_with("INSERT INTO \"stratum_lock\"")));
        assert!(!recorded.iter().any(|s| s.starts_with("LOCK TABLE")));
    }

    #[tokio::test]
    async fn without_unique_enforcement_lock_serializes_on_a_table_lock() {
        let caps = Capabilities {
            enforces_unique_constraints: false,
            ..Capabilities::default()
        };
        let (mut backend, log) = flagged_backend(caps);
        backend.lock(Duration::from_millis(100)).await.unwrap();
        let recorded = statements(&log);
        let lock_ix = recorded
            .iter()
            .position(|s| s == "LOCK TABLE \"stratum_lock\"")
            .expect("table lock taken");
        let check_ix = recorded
            .iter()
            .position(|s| s.starts_with("SELECT pid FROM \"stratum_lock\""))
            .expect("existing holder checked");
        let insert_ix = recorded
            .iter()
            .position(|s| s.starts_with("INSERT INTO \"stratum_lock\""))
            .expect("lock row inserted");
        assert!(lock_ix < check_ix && check_ix < insert_ix);
    }
}
