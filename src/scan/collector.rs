//! In-memory accumulator for a single run
//!
//! Nothing here touches durable storage. One collector lives for exactly one
//! run; the orchestrator keeps it behind a mutex so status queries can read
//! progress while the run is in flight.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Item, ItemSummary, RunOutcome, RunResult, RunSummary};
use crate::error::{Error, Result};

/// Lifecycle of one source within the run
#[derive(Debug)]
enum SourceState {
    Running {
        label: String,
        started: Instant,
        started_at: DateTime<Utc>,
        new_items: Vec<ItemSummary>,
    },
    Completed(RunResult),
    Failed(RunResult),
}

impl SourceState {
    fn result(&self) -> Option<&RunResult> {
        match self {
            SourceState::Completed(r) | SourceState::Failed(r) => Some(r),
            SourceState::Running { .. } => None,
        }
    }
}

/// Snapshot of a run in flight
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunProgress {
    pub total: usize,
    pub scanned: usize,
    pub percent: f64,
    pub new_items: usize,
    pub current_source: Option<String>,
    pub elapsed_secs: f64,
}

#[derive(Debug)]
pub struct RunCollector {
    started: Instant,
    run_time: DateTime<Utc>,
    total_sources: usize,
    order: Vec<String>,
    sources: HashMap<String, SourceState>,
}

impl Default for RunCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl RunCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            run_time: Utc::now(),
            total_sources: 0,
            order: Vec::new(),
            sources: HashMap::new(),
        }
    }

    pub fn begin(&mut self, total_sources: usize) {
        self.total_sources = total_sources;
    }

    /// Open the timing window for a source
    pub fn start_source(&mut self, source_id: &str, label: &str) -> Result<()> {
        if let Some(SourceState::Running { .. }) = self.sources.get(source_id) {
            return Err(Error::Logic(format!(
                "source {source_id} started twice without being ended"
            )));
        }

        if !self.sources.contains_key(source_id) {
            self.order.push(source_id.to_string());
        }
        self.sources.insert(
            source_id.to_string(),
            SourceState::Running {
                label: label.to_string(),
                started: Instant::now(),
                started_at: Utc::now(),
                new_items: Vec::new(),
            },
        );
        Ok(())
    }

    /// Append new items to an open source, keeping only their summaries
    pub fn record_new_items(&mut self, source_id: &str, items: &[Item]) -> Result<()> {
        match self.sources.get_mut(source_id) {
            Some(SourceState::Running { new_items, .. }) => {
                new_items.extend(items.iter().map(ItemSummary::from_item));
                Ok(())
            }
            _ => Err(Error::Logic(format!(
                "recording items for source {source_id} which is not being scanned"
            ))),
        }
    }

    /// Close the timing window and freeze the source's result
    pub fn end_source(&mut self, source_id: &str, error: Option<String>) -> Result<()> {
        let Some(state) = self.sources.remove(source_id) else {
            return Err(Error::Logic(format!("source {source_id} was never started")));
        };

        match state {
            SourceState::Running {
                label,
                started,
                started_at,
                new_items,
            } => {
                let result = RunResult {
                    source_id: source_id.to_string(),
                    label,
                    new_items,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    scanned_at: started_at,
                    error,
                };
                let state = if result.is_failed() {
                    SourceState::Failed(result)
                } else {
                    SourceState::Completed(result)
                };
                self.sources.insert(source_id.to_string(), state);
                Ok(())
            }
            ended => {
                self.sources.insert(source_id.to_string(), ended);
                Err(Error::Logic(format!("source {source_id} already ended")))
            }
        }
    }

    pub fn progress(&self) -> RunProgress {
        let mut scanned = 0;
        let mut new_items = 0;
        let mut current_source = None;
        for (id, state) in &self.sources {
            match state {
                SourceState::Running {
                    new_items: items, ..
                } => {
                    new_items += items.len();
                    current_source = Some(id.clone());
                }
                SourceState::Completed(r) | SourceState::Failed(r) => {
                    scanned += 1;
                    new_items += r.new_items.len();
                }
            }
        }

        let percent = if self.total_sources > 0 {
            scanned as f64 / self.total_sources as f64 * 100.0
        } else {
            0.0
        };

        RunProgress {
            total: self.total_sources,
            scanned,
            percent,
            new_items,
            current_source,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    /// Build the run summary. Sources still open are closed as aborted.
    pub fn summary(mut self, outcome: RunOutcome) -> RunSummary {
        let open: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, s)| matches!(s, SourceState::Running { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        for id in open {
            // Cannot fail: the source is known to be running
            let _ = self.end_source(&id, Some("aborted".to_string()));
        }

        let mut results: Vec<RunResult> = self
            .order
            .iter()
            .filter_map(|id| self.sources.get(id).and_then(SourceState::result).cloned())
            .collect();
        results.sort_by(|a, b| b.new_items.len().cmp(&a.new_items.len()));

        let failed_sources = results.iter().filter(|r| r.is_failed()).count();
        let total_new_items = results.iter().map(|r| r.new_items.len()).sum();

        RunSummary {
            run_id: None,
            total_sources: self.total_sources,
            scanned_sources: results.len(),
            failed_sources,
            total_new_items,
            duration_secs: self.started.elapsed().as_secs_f64(),
            run_time: self.run_time,
            outcome,
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_double_start_is_logic_error() {
        let mut collector = RunCollector::new();
        collector.begin(1);
        collector.start_source("a", "A").unwrap();
        assert_matches!(collector.start_source("a", "A"), Err(Error::Logic(_)));

        collector.end_source("a", None).unwrap();
        assert_matches!(collector.end_source("a", None), Err(Error::Logic(_)));
    }

    #[test]
    fn test_record_requires_open_source() {
        let mut collector = RunCollector::new();
        assert_matches!(
            collector.record_new_items("ghost", &[Item::new("1", 1)]),
            Err(Error::Logic(_))
        );
        assert_matches!(collector.end_source("ghost", None), Err(Error::Logic(_)));
    }

    #[test]
    fn test_summary_sorted_by_new_items() {
        let mut collector = RunCollector::new();
        collector.begin(3);

        collector.start_source("a", "A").unwrap();
        collector.record_new_items("a", &[Item::new("1", 1)]).unwrap();
        collector.end_source("a", None).unwrap();

        collector.start_source("b", "B").unwrap();
        collector
            .record_new_items("b", &[Item::new("2", 2), Item::new("3", 3)])
            .unwrap();
        collector.end_source("b", None).unwrap();

        collector.start_source("c", "C").unwrap();
        collector.end_source("c", Some("timeout".into())).unwrap();

        let progress = collector.progress();
        assert_eq!(progress.scanned, 3);
        assert_eq!(progress.new_items, 3);
        assert_eq!(progress.percent, 100.0);

        let summary = collector.summary(RunOutcome::Completed);
        let order: Vec<_> = summary.results.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
        assert_eq!(summary.total_new_items, 3);
        assert_eq!(summary.failed_sources, 1);
        assert_eq!(summary.scanned_sources, 3);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_summary_closes_open_sources() {
        let mut collector = RunCollector::new();
        collector.begin(2);
        collector.start_source("a", "A").unwrap();
        assert_eq!(collector.progress().current_source.as_deref(), Some("a"));

        let summary = collector.summary(RunOutcome::Cancelled);
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].error.as_deref(), Some("aborted"));
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
    }
}
