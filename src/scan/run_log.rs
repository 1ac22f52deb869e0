//! Durable run history
//!
//! Layout under the log directory:
//!
//! ```text
//! scan_history.json               bounded list of run digests, oldest first
//! details/<YYYY-MM-DD>/<id>.json  full summary of one run
//! ```
//!
//! Files are written to a temporary sibling and renamed into place, so a crash
//! mid-write leaves the previous version intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ItemSummary, RunOutcome, RunResult, RunSummary, SAMPLE_ITEMS_PER_SOURCE,
};
use crate::error::Result;

const HISTORY_FILE: &str = "scan_history.json";
const DETAILS_DIR: &str = "details";

/// Item reference kept in a history digest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleItem {
    pub item_id: String,
    pub title: String,
}

/// Per-source part of a history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDigest {
    pub source_id: String,
    pub label: String,
    pub new_items_count: usize,
    pub scanned_at: DateTime<Utc>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_items: Vec<SampleItem>,
}

impl From<&RunResult> for SourceDigest {
    fn from(result: &RunResult) -> Self {
        Self {
            source_id: result.source_id.clone(),
            label: result.label.clone(),
            new_items_count: result.new_items.len(),
            scanned_at: result.scanned_at,
            error: result.error.clone(),
            sample_items: result
                .new_items
                .iter()
                .take(SAMPLE_ITEMS_PER_SOURCE)
                .map(|item: &ItemSummary| SampleItem {
                    item_id: item.item_id.clone(),
                    title: item.short_title(),
                })
                .collect(),
        }
    }
}

/// Summarized run as kept in the bounded history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    /// When the run was logged, epoch seconds
    pub timestamp: i64,
    pub run_time: DateTime<Utc>,
    pub total_sources: usize,
    pub scanned_sources: usize,
    pub failed_sources: usize,
    pub total_new_items: usize,
    pub duration_secs: f64,
    pub outcome: RunOutcome,
    pub sources: Vec<SourceDigest>,
}

impl RunRecord {
    fn from_summary(run_id: Uuid, summary: &RunSummary) -> Self {
        Self {
            run_id,
            timestamp: Utc::now().timestamp(),
            run_time: summary.run_time,
            total_sources: summary.total_sources,
            scanned_sources: summary.scanned_sources,
            failed_sources: summary.failed_sources,
            total_new_items: summary.total_new_items,
            duration_secs: summary.duration_secs,
            outcome: summary.outcome,
            sources: summary.results.iter().map(SourceDigest::from).collect(),
        }
    }
}

/// Statistics computed over the bounded history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    pub total_runs: usize,
    pub total_new_items: usize,
    pub average_duration_secs: f64,
    /// Percentage of runs with no failed source
    pub success_rate: f64,
    pub last_run_time: Option<DateTime<Utc>>,
}

pub struct RunLogger {
    dir: PathBuf,
    retention: usize,
    /// Serializes read-modify-write cycles of the history file
    lock: Mutex<()>,
}

impl RunLogger {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    fn details_root(&self) -> PathBuf {
        self.dir.join(DETAILS_DIR)
    }

    /// Persist a run and return its new id
    pub async fn log(&self, summary: &RunSummary) -> Result<Uuid> {
        let run_id = Uuid::new_v4();
        let _guard = self.lock.lock().await;

        let mut detail = summary.clone();
        detail.run_id = Some(run_id);
        let day_dir = self
            .details_root()
            .join(Utc::now().format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&day_dir).await?;
        write_atomic(
            &day_dir.join(format!("{run_id}.json")),
            &serde_json::to_vec_pretty(&detail)?,
        )
        .await?;

        let mut history = self.load_history().await?;
        history.push(RunRecord::from_summary(run_id, summary));
        if history.len() > self.retention {
            let excess = history.len() - self.retention;
            history.drain(..excess);
        }
        self.save_history(&history).await?;

        info!(run_id = %run_id, new_items = summary.total_new_items, "Logged scan run");
        Ok(run_id)
    }

    /// Most recent runs first
    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut history = self.load_history().await?;
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history.truncate(limit);
        Ok(history)
    }

    /// Full summary of one run, if its detail file still exists
    pub async fn detail(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let root = self.details_root();
        let mut days = match tokio::fs::read_dir(&root).await {
            Ok(days) => days,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file_name = format!("{run_id}.json");
        while let Some(day) = days.next_entry().await? {
            let candidate = day.path().join(&file_name);
            match tokio::fs::read(&candidate).await {
                Ok(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    pub async fn statistics(&self) -> Result<RunStatistics> {
        let history = self.load_history().await?;
        if history.is_empty() {
            return Ok(RunStatistics::default());
        }

        let total_runs = history.len();
        let total_new_items = history.iter().map(|r| r.total_new_items).sum();
        let total_duration: f64 = history.iter().map(|r| r.duration_secs).sum();
        let successful = history.iter().filter(|r| r.failed_sources == 0).count();

        Ok(RunStatistics {
            total_runs,
            total_new_items,
            average_duration_secs: total_duration / total_runs as f64,
            success_rate: successful as f64 / total_runs as f64 * 100.0,
            last_run_time: history.iter().map(|r| r.run_time).max(),
        })
    }

    /// Drop history entries and detail directories older than `retention_days`
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
        let _guard = self.lock.lock().await;

        let mut history = self.load_history().await?;
        let before = history.len();
        history.retain(|r| r.timestamp > cutoff.timestamp());
        let removed = before - history.len();
        if removed > 0 {
            self.save_history(&history).await?;
        }

        let cutoff_day = cutoff.date_naive();
        if let Ok(mut days) = tokio::fs::read_dir(self.details_root()).await {
            while let Some(day) = days.next_entry().await? {
                let name = day.file_name();
                let Some(date) = name
                    .to_str()
                    .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
                else {
                    continue;
                };
                if date < cutoff_day {
                    match tokio::fs::remove_dir_all(day.path()).await {
                        Ok(()) => debug!(dir = %day.path().display(), "Removed old scan details"),
                        Err(e) => warn!(dir = %day.path().display(), error = %e, "Failed to remove old scan details"),
                    }
                }
            }
        }

        Ok(removed)
    }

    async fn load_history(&self) -> Result<Vec<RunRecord>> {
        let bytes = match tokio::fs::read(self.history_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(history) => Ok(history),
            Err(e) => {
                warn!(error = %e, path = %self.history_path().display(), "Unreadable scan history, starting fresh");
                Ok(Vec::new())
            }
        }
    }

    async fn save_history(&self, history: &[RunRecord]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomic(&self.history_path(), &serde_json::to_vec_pretty(history)?).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
