//! Scan service: owns the [ScanOrchestrator] and ties its loop to the service lifecycle.
//!
//! Depends on the database service. When scanning is enabled the loop starts
//! with the service; stopping the service cancels the loop and any run in flight.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::scan::{RunLogger, ScanDependencies, ScanOrchestrator, ScanState};
use crate::services::downloader::{CommandDownloader, Downloader};
use crate::services::fetcher::HttpItemFetcher;
use crate::services::manager::{Service, ServiceHealth};
use crate::services::notifications::{LogNotifier, NotificationSettings, NotificationSink};

pub struct ScanService {
    orchestrator: Arc<ScanOrchestrator>,
    autostart: bool,
}

impl ScanService {
    pub fn new(orchestrator: Arc<ScanOrchestrator>, autostart: bool) -> Self {
        Self {
            orchestrator,
            autostart,
        }
    }

    /// Wire the orchestrator with the HTTP fetcher, optional command downloader and log notifier.
    pub fn from_config(config: &Config, db: Database) -> Result<Self> {
        let validation = config.scan.validate();
        for warning in &validation.warnings {
            warn!(service = "scan", warning = %warning, "Scan configuration warning");
        }
        if !validation.valid {
            anyhow::bail!("Invalid scan configuration: {}", validation.errors.join("; "));
        }

        let fetcher =
            HttpItemFetcher::from_config(config).context("Failed to create item fetcher")?;

        let downloader: Option<Arc<dyn Downloader>> = match config.download_command.as_deref() {
            Some(command) => Some(Arc::new(
                CommandDownloader::new(command).context("Invalid DOWNLOAD_COMMAND")?,
            )),
            None => {
                if config.scan.auto_download {
                    warn!(service = "scan", "Auto-download enabled but DOWNLOAD_COMMAND is not set");
                }
                None
            }
        };

        let notifiers: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogNotifier::new(
            NotificationSettings::from(&config.scan),
        ))];

        let deps = ScanDependencies {
            db,
            fetcher: Arc::new(fetcher),
            downloader,
            notifiers,
            logger: Arc::new(RunLogger::new(
                &config.scan_log_dir,
                config.scan.history_retention,
            )),
        };

        Ok(Self::new(
            Arc::new(ScanOrchestrator::new(deps, config.scan.clone())),
            config.scan.enabled,
        ))
    }

    pub fn orchestrator(&self) -> Arc<ScanOrchestrator> {
        self.orchestrator.clone()
    }
}

#[async_trait]
impl Service for ScanService {
    fn name(&self) -> &str {
        "scan"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["database".to_string()]
    }

    async fn start(&self) -> Result<()> {
        if self.autostart {
            self.orchestrator.start(None, None);
            info!(service = "scan", "Scan service started");
        } else {
            info!(service = "scan", "Scan service started, loop disabled until started via API");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.orchestrator.stop().await;
        info!(service = "scan", "Scan service stopped");
        Ok(())
    }

    async fn health(&self) -> Result<ServiceHealth> {
        Ok(match self.orchestrator.state() {
            ScanState::Paused => ServiceHealth::degraded("scanning paused"),
            ScanState::Stopped if self.autostart => ServiceHealth::degraded("scan loop stopped"),
            _ => ServiceHealth::healthy(),
        })
    }
}
