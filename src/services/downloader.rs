//! Download capability
//!
//! The engine hands newly classified items to a [Downloader] and records every
//! successful item in the ledger. The byte-level work happens elsewhere;
//! [CommandDownloader] shells out to an external tool once per item.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::scan::Item;

/// Result of downloading one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub item_id: String,
    /// Where the media ended up, when the downloader reports it
    pub save_path: Option<String>,
    pub error: Option<String>,
}

impl DownloadOutcome {
    pub fn success(item_id: impl Into<String>, save_path: Option<String>) -> Self {
        Self {
            item_id: item_id.into(),
            save_path,
            error: None,
        }
    }

    pub fn failure(item_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            save_path: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download items of one source, one outcome per attempted item.
    ///
    /// Stops promptly once `cancel` fires and returns the outcomes of the
    /// items that finished before it, so those can still be recorded.
    async fn download(
        &self,
        source_id: &str,
        items: &[Item],
        cancel: &CancellationToken,
    ) -> Vec<DownloadOutcome>;
}

/// Runs `<program> [args..] <source_id> <item_id>` per item; exit status 0 is success.
///
/// The last non-empty line of stdout, if any, is taken as the save path.
pub struct CommandDownloader {
    program: String,
    args: Vec<String>,
}

impl CommandDownloader {
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| Error::Config("DOWNLOAD_COMMAND is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    async fn download_one(&self, source_id: &str, item_id: &str) -> DownloadOutcome {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(source_id)
            .arg(item_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return DownloadOutcome::failure(
                    item_id,
                    format!("Failed to run {}: {e}", self.program),
                );
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return DownloadOutcome::failure(
                item_id,
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let save_path = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string);

        DownloadOutcome::success(item_id, save_path)
    }
}

#[async_trait]
impl Downloader for CommandDownloader {
    async fn download(
        &self,
        source_id: &str,
        items: &[Item],
        cancel: &CancellationToken,
    ) -> Vec<DownloadOutcome> {
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            // Dropping the child future kills the process (kill_on_drop)
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        source_id = %source_id,
                        remaining = items.len() - outcomes.len(),
                        "Downloads cancelled"
                    );
                    break;
                }
                outcome = self.download_one(source_id, &item.id) => outcome,
            };
            match &outcome.error {
                None => debug!(source_id = %source_id, item_id = %item.id, "Downloaded item"),
                Some(error) => {
                    warn!(source_id = %source_id, item_id = %item.id, error = %error, "Download failed")
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_exit_status_decides_success() {
        let ok = CommandDownloader::new("echo").unwrap();
        let outcomes = ok.download("src", &[Item::new("42", 1)], &CancellationToken::new()).await;
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].save_path.as_deref(), Some("src 42"));

        let failing = CommandDownloader::new("false").unwrap();
        let outcomes = failing
            .download("src", &[Item::new("42", 1)], &CancellationToken::new())
            .await;
        assert!(!outcomes[0].is_success());
    }

    #[tokio::test]
    async fn test_missing_program_is_item_failure() {
        let missing = CommandDownloader::new("definitely-not-a-real-binary-xyz").unwrap();
        let outcomes = missing
            .download(
                "src",
                &[Item::new("1", 1), Item::new("2", 2)],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.is_success()));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_download() {
        // Runs `sleep 5 5` per item
        let slow = CommandDownloader::new("sleep").unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcomes = slow
            .download("5", &[Item::new("5", 1), Item::new("5", 2)], &cancel)
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_downloads_nothing() {
        let ok = CommandDownloader::new("echo").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(ok.download("src", &[Item::new("1", 1)], &cancel).await.is_empty());
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandDownloader::new("   ").is_err());
    }
}
