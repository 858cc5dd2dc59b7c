//! Cross-process migration lock
//!
//! Exclusion between processes is a single-row table keyed by a constant
//! primary key. Whoever inserts the row holds the lock; everyone else
//! polls until the row disappears or the timeout expires. Within a
//! process the lock is re-entrant so nested operations can each take it.

use std::time::{Duration, Instant};

use chrono::Utc;

use crate::backend::Backend;
use crate::backends::core::Value;
use crate::error::{MigrateError, MigrateResult};

/// Default wait before giving up on a held lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl Backend {
    /// Acquire the migration lock, waiting up to `timeout` for another
    /// process to release it. Re-entrant within this backend instance.
    pub async fn lock(&mut self, timeout: Duration) -> MigrateResult<()> {
        if self.lock_depth > 0 {
            self.lock_depth += 1;
            return Ok(());
        }
        self.insert_lock_row(timeout).await?;
        self.lock_depth = 1;
        Ok(())
    }

    /// Release one level of the lock; the row is deleted when the
    /// outermost level releases.
    pub async fn unlock(&mut self) -> MigrateResult<()> {
        match self.lock_depth {
            0 => Ok(()),
            1 => {
                self.delete_lock_row().await?;
                self.lock_depth = 0;
                Ok(())
            }
            _ => {
                self.lock_depth -= 1;
                Ok(())
            }
        }
    }

    /// Remove the lock row regardless of owner. For clearing a lock left
    /// behind by a crashed process.
    pub async fn break_lock(&mut self) -> MigrateResult<()> {
        let table = self.quote_identifier(&self.config().lock_table);
        let scope = self.begin().await?;
        match self
            .execute(&format!("DELETE FROM {table} WHERE locked = 1"), &[])
            .await
        {
            Ok(_) => self.commit_scope(scope).await,
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }

    /// Best effort; the insert path reports a missing table on first use
    /// anyway, and concurrent creates race benignly.
    pub(crate) async fn create_lock_table(&mut self) {
        let table = self.quote_identifier(&self.config().lock_table);
        let sql = format!(
            "CREATE TABLE {table} (\
             locked INT DEFAULT 1 NOT NULL, \
             ctime TIMESTAMP, \
             pid INT NOT NULL, \
             PRIMARY KEY (locked))"
        );
        if let Err(e) = self.execute(&sql, &[]).await {
            tracing::debug!("lock table not created (probably exists): {}", e);
        }
    }

    async fn insert_lock_row(&mut self, timeout: Duration) -> MigrateResult<()> {
        let started = Instant::now();
        let pid = i64::from(std::process::id());
        loop {
            if self.try_insert_lock(pid).await? {
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                let holder = self.lock_holder().await;
                return Err(MigrateError::LockTimeout { holder });
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout - elapsed)).await;
        }
    }

    /// One attempt to take the lock row. A database error on insert means
    /// another process holds it; anything else propagates.
    async fn try_insert_lock(&mut self, pid: i64) -> MigrateResult<bool> {
        let scope = self.begin().await?;
        let attempt = if self.capabilities().enforces_unique_constraints {
            self.execute_lock_insert(pid).await.map(|()| true)
        } else {
            self.locked_check_then_insert(pid).await
        };
        match attempt {
            Ok(acquired) => {
                self.commit_scope(scope).await?;
                Ok(acquired)
            }
            Err(e) if e.is_database_error() => {
                self.rollback_scope(scope).await?;
                Ok(false)
            }
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }

    async fn execute_lock_insert(&mut self, pid: i64) -> MigrateResult<()> {
        let table = self.quote_identifier(&self.config().lock_table);
        self.execute(
            &format!("INSERT INTO {table} (locked, ctime, pid) VALUES (1, :ctime, :pid)"),
            &[("ctime", Value::from(Utc::now())), ("pid", Value::Int(pid))],
        )
        .await?;
        Ok(())
    }

    /// Without unique enforcement a plain insert cannot exclude anyone, so
    /// serialize on a table lock and check for an existing row first.
    async fn locked_check_then_insert(&mut self, pid: i64) -> MigrateResult<bool> {
        let table = self.quote_identifier(&self.config().lock_table);
        self.execute(&format!("LOCK TABLE {table}"), &[]).await?;
        let holders = self
            .fetch_all(&format!("SELECT pid FROM {table} WHERE locked = 1"), &[])
            .await?;
        if !holders.is_empty() {
            return Ok(false);
        }
        self.execute_lock_insert(pid).await?;
        Ok(true)
    }

    async fn lock_holder(&mut self) -> Option<i64> {
        let table = self.quote_identifier(&self.config().lock_table);
        let rows = self
            .fetch_all(&format!("SELECT pid FROM {table} WHERE locked = 1"), &[])
            .await
            .ok()?;
        rows.first().and_then(|row| row.get("pid")?.as_i64())
    }

    /// Deletes only this process's row, so a lock stolen and re-taken by
    /// another process is left alone.
    async fn delete_lock_row(&mut self) -> MigrateResult<()> {
        let table = self.quote_identifier(&self.config().lock_table);
        let pid = i64::from(std::process::id());
        let scope = self.begin().await?;
        match self
            .execute(
                &format!("DELETE FROM {table} WHERE locked = 1 AND pid = :pid"),
                &[("pid", Value::Int(pid))],
            )
            .await
        {
            Ok(_) => self.commit_scope(scope).await,
            Err(e) => {
                let _ = self.rollback_scope(scope).await;
                Err(e)
            }
        }
    }
}
