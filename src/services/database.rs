//! Database service: wraps the SQLite pool for lifecycle (start/stop/health) and dependencies.
//!
//! Services that need the database declare `dependencies: ["database"]`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::query;
use tracing::{info, warn};

use crate::db::Database;
use crate::services::manager::{Service, ServiceHealth};

/// Configuration for the database service.
#[derive(Debug, Clone)]
pub struct DatabaseServiceConfig {
    /// SQLite path or URL (e.g. `./data/subscan.db` or `sqlite::memory:`).
    pub database_url: String,
    pub max_connections: u32,
    /// How long to retry connecting before giving up.
    pub connect_timeout: Duration,
}

impl Default for DatabaseServiceConfig {
    fn default() -> Self {
        Self {
            database_url: "./data/subscan.db".to_string(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Service that owns the database pool. Register it first.
pub struct DatabaseService {
    pool: Database,
}

impl DatabaseService {
    /// Create a new database service with an already-connected pool.
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    /// Connect (with retry) and create missing tables.
    pub async fn from_config(config: DatabaseServiceConfig) -> Result<Self> {
        let pool = Database::connect_with_retry(
            &config.database_url,
            config.max_connections,
            Duration::from_secs(2),
            config.connect_timeout,
        )
        .await
        .context("Database service: connect_with_retry failed")?;
        Ok(Self::new(pool))
    }

    /// Access the pool. Valid until [Service::stop] is called.
    pub fn pool(&self) -> &Database {
        &self.pool
    }
}

#[async_trait]
impl Service for DatabaseService {
    fn name(&self) -> &str {
        "database"
    }

    async fn start(&self) -> Result<()> {
        info!(service = "database", "Database service starting");
        query("SELECT 1")
            .execute(self.pool.pool())
            .await
            .context("Database not reachable")?;
        self.pool.migrate().await.context("Schema sync failed")?;
        info!(service = "database", "Database service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.pool.close().await;
        info!(service = "database", "Database service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        match query("SELECT 1").execute(self.pool.pool()).await {
            Ok(_) => Ok(ServiceHealth::healthy()),
            Err(e) => {
                warn!(service = "database", error = %e, "Health check failed");
                Ok(ServiceHealth::unhealthy(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::manager::HealthStatus;

    #[tokio::test]
    async fn test_health_follows_pool() {
        let service = DatabaseService::new(Database::connect_in_memory().await.unwrap());
        service.start().await.unwrap();
        assert_eq!(service.health().await.unwrap().status, HealthStatus::Healthy);

        service.stop().await.unwrap();
        assert_eq!(service.health().await.unwrap().status, HealthStatus::Unhealthy);
    }
}
