//! `SQLite` database for the federation service.

use std::path::Path;
use std::sync::Arc;

use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

pub use olg_core::db::DatabaseError;

/// Handle to the federation database.
///
/// Reads go straight to the pool. Writes go through [`begin_write`], which
/// serialises write transactions inside the process so that every audit entry
/// extends the hash chain from the latest committed head.
///
/// [`begin_write`]: FederationDatabase::begin_write
#[derive(Clone)]
pub struct FederationDatabase {
    pool: Pool<Sqlite>,
    write_gate: Arc<Mutex<()>>,
}

/// An open write transaction holding the process-wide write gate.
///
/// Dropping it without calling [`WriteTx::commit`] rolls everything back.
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _gate: OwnedMutexGuard<()>,
}

impl WriteTx {
    /// Connection to run statements on inside this transaction.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl FederationDatabase {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        let pool = olg_core::db::open_pool(path).await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        let pool = olg_core::db::open_pool_in_memory().await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        let db = Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Federation database migrations complete");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Start a write transaction.
    pub async fn begin_write(&self) -> Result<WriteTx, DatabaseError> {
        let gate = Arc::clone(&self.write_gate).lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTx { tx, _gate: gate })
    }
}
