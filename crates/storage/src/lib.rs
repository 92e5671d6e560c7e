//! Storage gateway over a pooled SQLite database.
//!
//! Every statement borrows a connection from the pool for its own duration;
//! multi-statement work goes through [`Database::transaction`] or
//! [`Database::begin`], which roll back unless explicitly committed.

pub mod error;

use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

use bibsync_core::config::DatabaseConfig;

pub use error::StorageError;

/// An open transaction on the shared pool.
pub type Tx = Transaction<'static, Sqlite>;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the configured database and apply migrations.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str(&config.url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(config.acquire_timeout())
            .create_if_missing(true);

        if let Some(parent) = opts.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout())
            .connect_with(opts)
            .await?;

        MIGRATOR.run(&pool).await?;
        info!(url = %config.redacted_url(), "database ready, migrations applied");
        Ok(Self { pool })
    }

    /// A private in-memory database with migrations applied.
    ///
    /// The pool holds a single connection that never expires, since each
    /// SQLite `:memory:` connection is its own database.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction. Dropping it without `commit()` rolls back.
    pub async fn begin(&self) -> Result<Tx, sqlx::Error> {
        self.pool.begin().await
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    ///
    /// ```ignore
    /// db.transaction(|tx| Box::pin(async move {
    ///     sqlx::query("DELETE FROM job_schedule").execute(&mut **tx).await?;
    ///     Ok::<_, sqlx::Error>(())
    /// })).await?;
    /// ```
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut Tx) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: From<sqlx::Error> + Send,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                // The caller's error wins over a failed rollback.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
