//! subscan - subscription scanner service
//!
//! Starts the database, scan and HTTP services and runs until Ctrl+C.

use std::sync::Arc;

use anyhow::Result;

use subscan::config::Config;
use subscan::services::{
    DatabaseService, DatabaseServiceConfig, HttpServerService, LogFormat, ScanService,
    ServicesManager, init_tracing,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    init_tracing(LogFormat::from_env());
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting subscan");

    let manager = Arc::new(ServicesManager::new());

    let database = Arc::new(
        DatabaseService::from_config(DatabaseServiceConfig {
            database_url: config.database_url.clone(),
            max_connections: config.database_max_connections,
            ..Default::default()
        })
        .await?,
    );
    let db = database.pool().clone();
    manager.register_database(database).await;

    let scan = Arc::new(ScanService::from_config(&config, db)?);
    manager.register_scan(scan).await;

    manager
        .register(Arc::new(HttpServerService::new(
            manager.clone(),
            config.clone(),
        )))
        .await;

    manager.start_all().await?;
    tracing::info!(services = ?manager.names().await, "All services started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    manager.stop_all().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
