//! Scan engine
//!
//! The orchestrator drives runs over all subscribed sources. Each run
//! classifies freshly fetched items against the per-source watermark and the
//! download ledger, reports through a [RunCollector] and persists the
//! resulting [RunSummary] with the [RunLogger].

pub mod collector;
pub mod control;
pub mod orchestrator;
pub mod run_log;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use collector::{RunCollector, RunProgress};
pub use control::PauseGate;
pub use orchestrator::{ScanDependencies, ScanOrchestrator, ScanStatistics, ScanStatus, classify};
pub use run_log::{RunLogger, RunRecord, RunStatistics, SampleItem, SourceDigest};

/// Maximum characters of an item title kept in history digests
pub const SAMPLE_TITLE_CHARS: usize = 50;
/// Sample items kept per source in history digests
pub const SAMPLE_ITEMS_PER_SOURCE: usize = 3;

/// A subscribed upstream source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub nickname: String,
    /// Per-source download switch
    pub auto_download: bool,
}

impl Source {
    pub fn new(source_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            nickname: nickname.into(),
            auto_download: true,
        }
    }
}

/// An item as returned by the fetch capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    /// Publish time, epoch seconds
    pub publish_time: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Item {
    pub fn new(id: impl Into<String>, publish_time: i64) -> Self {
        Self {
            id: id.into(),
            publish_time,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// The fields of an item worth keeping in a run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub item_id: String,
    pub title: String,
    pub publish_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
}

impl ItemSummary {
    pub fn from_item(item: &Item) -> Self {
        let payload = &item.payload;
        let text = |pointer: &str| {
            payload
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let int = |pointer: &str| payload.pointer(pointer).and_then(|v| v.as_i64());

        Self {
            item_id: item.id.clone(),
            title: text("/title").or_else(|| text("/desc")).unwrap_or_default(),
            publish_time: item.publish_time,
            duration: int("/duration"),
            play_count: int("/statistics/play_count"),
            like_count: int("/statistics/digg_count").or_else(|| int("/statistics/like_count")),
            cover_url: text("/cover_url").or_else(|| text("/video/cover/url_list/0")),
        }
    }

    /// Title cut to [SAMPLE_TITLE_CHARS] characters, with an ellipsis when cut
    pub fn short_title(&self) -> String {
        if self.title.chars().count() > SAMPLE_TITLE_CHARS {
            let cut: String = self.title.chars().take(SAMPLE_TITLE_CHARS).collect();
            format!("{cut}...")
        } else {
            self.title.clone()
        }
    }
}

/// Result of scanning one source in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub source_id: String,
    pub label: String,
    pub new_items: Vec<ItemSummary>,
    pub elapsed_secs: f64,
    pub scanned_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl RunResult {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Upstream rate limiting aborted the remaining sources
    RateLimited,
    /// Stopped before every source was scanned
    Cancelled,
}

/// Aggregate over all sources of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Assigned by the [RunLogger]; `None` if the run could not be logged
    pub run_id: Option<Uuid>,
    pub total_sources: usize,
    pub scanned_sources: usize,
    pub failed_sources: usize,
    pub total_new_items: usize,
    pub duration_secs: f64,
    pub run_time: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Sorted by new item count, most first
    pub results: Vec<RunResult>,
}

impl RunSummary {
    /// A run counts as successful when no source failed
    pub fn is_success(&self) -> bool {
        self.failed_sources == 0
    }

    pub fn sources_with_new_items(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter().filter(|r| !r.new_items.is_empty())
    }
}

/// State of the scan loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Events published by the orchestrator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    StateChanged {
        state: ScanState,
    },
    RunStarted {
        round: i64,
        total_sources: usize,
    },
    SourceScanned {
        source_id: String,
        new_items: usize,
        error: Option<String>,
    },
    NewItems {
        source_id: String,
        label: String,
        items: Vec<ItemSummary>,
    },
    RunCompleted {
        summary: RunSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_item_summary_reduces_payload() {
        let item = Item::new("42", 1_700_000_000).with_payload(json!({
            "desc": "a walk in the park",
            "duration": 15000,
            "statistics": { "digg_count": 12, "play_count": 300 },
            "video": { "cover": { "url_list": ["https://cdn/cover.jpg"] } },
            "huge_blob": "ignored"
        }));

        let summary = ItemSummary::from_item(&item);
        assert_eq!(summary.title, "a walk in the park");
        assert_eq!(summary.like_count, Some(12));
        assert_eq!(summary.play_count, Some(300));
        assert_eq!(summary.cover_url.as_deref(), Some("https://cdn/cover.jpg"));
    }

    #[test]
    fn test_short_title_truncates() {
        let item = Item::new("1", 0).with_payload(json!({ "title": "x".repeat(60) }));
        let summary = ItemSummary::from_item(&item);
        assert_eq!(summary.short_title().chars().count(), SAMPLE_TITLE_CHARS + 3);

        let item = Item::new("2", 0).with_payload(json!({ "title": "short" }));
        assert_eq!(ItemSummary::from_item(&item).short_title(), "short");
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&RunOutcome::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }
}
