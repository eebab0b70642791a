//! Fleet database handle.

use std::path::Path;

use sqlx::{Pool, Sqlite, Transaction};
use tracing::info;

pub use opscenter_core::db::DatabaseError;
use opscenter_core::db::{open_pool, open_pool_in_memory};

/// Concurrent registrations and probe rounds each hold a connection briefly.
const MAX_CONNECTIONS: u32 = 8;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct FleetDatabase {
    pool: Pool<Sqlite>,
}

impl FleetDatabase {
    /// Open or create the database at `path` and bring its schema current.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(open_pool(path, MAX_CONNECTIONS).await?).await
    }

    /// A private in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(open_pool_in_memory().await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!(
            migrations = MIGRATOR.iter().count(),
            "Fleet database migrations complete"
        );
        Ok(Self { pool })
    }

    pub(crate) const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Start a transaction that takes the write lock up front.
    ///
    /// Writers queue on the busy timeout at `BEGIN` instead of failing with
    /// `SQLITE_BUSY` when a read lock must be upgraded, so every pre-read
    /// inside the transaction sees the latest committed row.
    pub(crate) async fn begin_write(
        &self,
    ) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}
