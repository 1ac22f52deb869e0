//! Database connection and operations

pub mod downloaded_items;
pub mod schema;
pub mod source_progress;
pub mod sqlite_helpers;
pub mod subscriptions;

use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{info, warn};

use crate::error::Result;

pub use downloaded_items::{DownloadStats, DownloadedItemRecord, DownloadedItemRepository};
pub use source_progress::{
    LastScanInfo, ProgressStatistics, SourceProgress, SourceProgressRepository,
};
pub use subscriptions::{
    SubscriptionPatch, SubscriptionRecord, SubscriptionRepository, UpsertSubscription,
};

/// Database wrapper providing connection pool access
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            format!("sqlite://{}", url)
        };

        // FULL synchronous mode: a write that returned is on disk
        Ok(SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(30)))
    }

    /// Create a new database connection pool and ensure the schema exists
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = Self::connect_options(url)?;
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create a new database connection pool with retry logic
    /// Retries every `retry_interval` until successful or `timeout` elapses
    pub async fn connect_with_retry(
        url: &str,
        max_connections: u32,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match Self::connect(url, max_connections).await {
                Ok(db) => return Ok(db),
                Err(e) if tokio::time::Instant::now() + retry_interval < deadline => {
                    warn!(
                        error = %e,
                        retry_in_secs = retry_interval.as_secs(),
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single-connection in-memory database, used by tests and dry runs
    pub async fn connect_in_memory() -> Result<Self> {
        // Every connection to :memory: is a separate database, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get the source progress store
    pub fn source_progress(&self) -> SourceProgressRepository {
        SourceProgressRepository::new(self.pool.clone())
    }

    /// Get the downloaded item ledger
    pub fn downloaded_items(&self) -> DownloadedItemRepository {
        DownloadedItemRepository::new(self.pool.clone())
    }

    /// Get the subscriptions repository
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository::new(self.pool.clone())
    }

    /// Create missing tables
    pub async fn migrate(&self) -> Result<()> {
        let result = schema::sync_schema(&self.pool).await?;
        if !result.tables_created.is_empty() {
            info!(tables = ?result.tables_created, "Created tables");
        }
        Ok(())
    }
}
