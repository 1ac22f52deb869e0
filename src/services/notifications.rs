//! Notification sinks for run results
//!
//! Sinks are best-effort: the orchestrator logs their errors and moves on.

use async_trait::async_trait;
use tracing::info;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::scan::{ItemSummary, RunSummary, Source};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Called once per finished run
    async fn notify_run(&self, summary: &RunSummary) -> Result<()>;

    /// Called once per source that produced new items
    async fn notify_new_items(&self, source: &Source, items: &[ItemSummary]) -> Result<()>;
}

/// When to notify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSettings {
    pub on_complete: bool,
    pub on_new_items: bool,
    pub min_items: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            on_complete: true,
            on_new_items: true,
            min_items: 1,
        }
    }
}

impl From<&ScanConfig> for NotificationSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            on_complete: config.notify_on_complete,
            on_new_items: config.notify_on_new_items,
            min_items: config.min_items_for_notification,
        }
    }
}

impl NotificationSettings {
    pub fn wants_run(&self, summary: &RunSummary) -> bool {
        self.on_complete && summary.total_new_items >= self.min_items
    }

    pub fn wants_items(&self, items: &[ItemSummary]) -> bool {
        self.on_new_items && !items.is_empty() && items.len() >= self.min_items
    }
}

/// Writes notifications to the tracing log
#[derive(Debug, Default)]
pub struct LogNotifier {
    settings: NotificationSettings,
}

impl LogNotifier {
    pub fn new(settings: NotificationSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_run(&self, summary: &RunSummary) -> Result<()> {
        if !self.settings.wants_run(summary) {
            return Ok(());
        }

        info!(
            run_id = ?summary.run_id,
            outcome = ?summary.outcome,
            scanned = summary.scanned_sources,
            failed = summary.failed_sources,
            new_items = summary.total_new_items,
            duration_secs = summary.duration_secs,
            "Scan run finished"
        );
        for result in summary.sources_with_new_items() {
            info!(
                source_id = %result.source_id,
                label = %result.label,
                new_items = result.new_items.len(),
                "Source has new items"
            );
        }
        Ok(())
    }

    async fn notify_new_items(&self, source: &Source, items: &[ItemSummary]) -> Result<()> {
        if !self.settings.wants_items(items) {
            return Ok(());
        }

        let titles: Vec<String> = items
            .iter()
            .take(crate::scan::SAMPLE_ITEMS_PER_SOURCE)
            .map(ItemSummary::short_title)
            .collect();
        info!(
            source_id = %source.source_id,
            nickname = %source.nickname,
            new_items = items.len(),
            sample = ?titles,
            "New items found"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{Item, RunCollector, RunOutcome};

    #[test]
    fn test_threshold() {
        let settings = NotificationSettings {
            min_items: 2,
            ..Default::default()
        };
        let one = vec![ItemSummary::from_item(&Item::new("1", 1))];
        assert!(!settings.wants_items(&one));
        assert!(!settings.wants_items(&[]));

        let two = vec![
            ItemSummary::from_item(&Item::new("1", 1)),
            ItemSummary::from_item(&Item::new("2", 2)),
        ];
        assert!(settings.wants_items(&two));

        let disabled = NotificationSettings {
            on_new_items: false,
            ..Default::default()
        };
        assert!(!disabled.wants_items(&two));
    }

    #[test]
    fn test_empty_run_not_announced() {
        let summary = RunCollector::new().summary(RunOutcome::Completed);
        assert!(!NotificationSettings::default().wants_run(&summary));
    }
}
