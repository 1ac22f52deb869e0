//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port for the control API
    pub port: u16,

    /// SQLite database path or URL
    pub database_url: String,

    /// Maximum connections in the SQLite pool
    pub database_max_connections: u32,

    /// Directory holding the run history and per-run detail files
    pub scan_log_dir: String,

    /// Base URL of the upstream item API (e.g. `http://localhost:8080/`)
    pub fetch_base_url: Option<String>,

    /// Per-request timeout for the upstream item API
    pub fetch_timeout: Duration,

    /// Upstream request pacing
    pub fetch_requests_per_second: u32,

    /// External command invoked once per item to download it
    pub download_command: Option<String>,

    /// Scan scheduling and behaviour
    pub scan: ScanConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "./data/subscan.db".to_string());

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("Invalid PORT")?,

            database_url,

            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),

            scan_log_dir: env::var("SCAN_LOG_DIR")
                .unwrap_or_else(|_| "./data/scan_logs".to_string()),

            fetch_base_url: env::var("FETCH_BASE_URL").ok().filter(|s| !s.is_empty()),

            fetch_timeout: Duration::from_secs(
                env::var("FETCH_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid FETCH_TIMEOUT_SECS")?,
            ),

            fetch_requests_per_second: env::var("FETCH_REQUESTS_PER_SECOND")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),

            download_command: env::var("DOWNLOAD_COMMAND").ok().filter(|s| !s.is_empty()),

            scan: ScanConfig::from_env()?,
        })
    }
}

/// Scan scheduling and behaviour settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Start the scan loop automatically with the service
    pub enabled: bool,
    /// Seconds between the end of one run and the start of the next
    pub interval_secs: u64,
    /// Hand newly found items to the downloader
    pub auto_download: bool,
    /// Pause between two sources of the same run
    pub source_delay_secs: u64,
    /// Treat a failed ledger read as "nothing downloaded yet" instead of failing the source
    pub ledger_fail_open: bool,
    /// Number of summarized runs kept in the history file
    pub history_retention: usize,
    /// Days of detail archives kept on disk
    pub log_retention_days: u32,
    /// Granularity of the inter-run sleep
    pub sleep_check_secs: u64,
    /// Minimum sleep after a run aborted by rate limiting
    pub rate_limit_cooldown_secs: u64,
    pub notify_on_complete: bool,
    pub notify_on_new_items: bool,
    pub min_items_for_notification: usize,
    /// Attempts per source fetch before giving up on transient errors
    pub fetch_max_retries: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3600,
            auto_download: true,
            source_delay_secs: 3,
            ledger_fail_open: false,
            history_retention: 100,
            log_retention_days: 30,
            sleep_check_secs: 5,
            rate_limit_cooldown_secs: 30 * 60,
            notify_on_complete: true,
            notify_on_new_items: true,
            min_items_for_notification: 1,
            fetch_max_retries: 3,
        }
    }
}

/// Result of [ScanConfig::validate]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl ScanConfig {
    /// Load scan settings from `SCAN_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            enabled: env_flag("SCAN_ENABLED", d.enabled),
            interval_secs: env_or("SCAN_INTERVAL_SECS", d.interval_secs)?,
            auto_download: env_flag("SCAN_AUTO_DOWNLOAD", d.auto_download),
            source_delay_secs: env_or("SCAN_SOURCE_DELAY_SECS", d.source_delay_secs)?,
            ledger_fail_open: env_flag("SCAN_LEDGER_FAIL_OPEN", d.ledger_fail_open),
            history_retention: env_or("SCAN_HISTORY_RETENTION", d.history_retention)?,
            log_retention_days: env_or("SCAN_LOG_RETENTION_DAYS", d.log_retention_days)?,
            sleep_check_secs: env_or("SCAN_SLEEP_CHECK_SECS", d.sleep_check_secs)?,
            rate_limit_cooldown_secs: env_or(
                "SCAN_RATE_LIMIT_COOLDOWN_SECS",
                d.rate_limit_cooldown_secs,
            )?,
            notify_on_complete: env_flag("SCAN_NOTIFY_ON_COMPLETE", d.notify_on_complete),
            notify_on_new_items: env_flag("SCAN_NOTIFY_ON_NEW_ITEMS", d.notify_on_new_items),
            min_items_for_notification: env_or(
                "SCAN_MIN_ITEMS_FOR_NOTIFICATION",
                d.min_items_for_notification,
            )?,
            fetch_max_retries: env_or("SCAN_FETCH_MAX_RETRIES", d.fetch_max_retries)?,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn source_delay(&self) -> Duration {
        Duration::from_secs(self.source_delay_secs)
    }

    /// Check settings that would make the scanner misbehave or trip upstream limits
    pub fn validate(&self) -> ConfigValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.interval_secs < 60 {
            errors.push("Scan interval must be at least 60 seconds".to_string());
        } else if self.interval_secs < 300 {
            warnings.push("Scan interval under 5 minutes may trigger rate limiting".to_string());
        }

        if self.source_delay_secs < 1 {
            errors.push("Delay between sources must be at least 1 second".to_string());
        }

        if self.history_retention == 0 {
            errors.push("History retention must keep at least one run".to_string());
        }

        if self.sleep_check_secs == 0 {
            errors.push("Sleep check granularity must be at least 1 second".to_string());
        } else if self.sleep_check_secs > 5 {
            warnings.push("Sleep check over 5 seconds delays stop and pause".to_string());
        }

        ConfigValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let validation = ScanConfig::default().validate();
        assert!(validation.valid);
        assert!(validation.errors.is_empty());
        assert!(validation.warnings.is_empty());
    }

    #[test]
    fn test_short_interval_rejected() {
        let config = ScanConfig {
            interval_secs: 30,
            ..Default::default()
        };
        let validation = config.validate();
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 1);
    }

    #[test]
    fn test_aggressive_interval_warns() {
        let config = ScanConfig {
            interval_secs: 120,
            ..Default::default()
        };
        let validation = config.validate();
        assert!(validation.valid);
        assert_eq!(validation.warnings.len(), 1);
    }

    #[test]
    fn test_zero_source_delay_rejected() {
        let config = ScanConfig {
            source_delay_secs: 0,
            ..Default::default()
        };
        assert!(!config.validate().valid);
    }
}
