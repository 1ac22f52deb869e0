//! Scan orchestration
//!
//! [ScanOrchestrator] owns the background scan loop and the manual
//! `scan_once` path. Both go through the same run routine, guarded by a run
//! lock so two runs never overlap.
//!
//! A run:
//! 1. purges progress of unsubscribed sources and bumps the round counter
//! 2. scans never-seen sources first, then known ones stalest first
//! 3. per source: fetch, classify against watermark and ledger, write the
//!    watermark in one statement
//! 4. summarizes, logs, then hands new-item batches to notifiers and the
//!    downloader
//!
//! A failing source never aborts the run. A rate-limited source does, and the
//! next sleep is stretched to at least the configured cooldown.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::control::{PauseGate, interruptible_sleep};
use super::{
    Item, ItemSummary, RunCollector, RunLogger, RunOutcome, RunProgress, RunRecord,
    RunStatistics, RunSummary, ScanEvent, ScanState, Source,
};
use crate::config::ScanConfig;
use crate::db::{Database, DownloadStats, LastScanInfo, ProgressStatistics};
use crate::error::{Error, Result};
use crate::services::downloader::Downloader;
use crate::services::fetcher::ItemFetcher;
use crate::services::notifications::NotificationSink;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Collaborators of the orchestrator
pub struct ScanDependencies {
    pub db: Database,
    pub fetcher: Arc<dyn ItemFetcher>,
    pub downloader: Option<Arc<dyn Downloader>>,
    pub notifiers: Vec<Arc<dyn NotificationSink>>,
    pub logger: Arc<RunLogger>,
}

/// Snapshot returned by [ScanOrchestrator::status]
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    /// The background loop is active
    pub running: bool,
    /// A run is in flight
    pub scanning: bool,
    pub paused: bool,
    pub interval_secs: u64,
    pub auto_download: bool,
    pub last_run_info: Option<LastScanInfo>,
    pub current_run: Option<RunProgress>,
}

/// Statistics across run history, progress table and ledger
#[derive(Debug, Clone, Serialize)]
pub struct ScanStatistics {
    pub runs: RunStatistics,
    pub progress: ProgressStatistics,
    pub downloads: DownloadStats,
}

#[derive(Debug, Clone, Copy)]
struct LoopSettings {
    interval: Duration,
    auto_download: bool,
}

/// New items of one source, held until the run is summarized
struct NewItemBatch {
    source: Source,
    items: Vec<Item>,
}

/// Clears the scanning flag however the run ends
struct ScanningGuard<'a>(&'a AtomicBool);

impl Drop for ScanningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Classify fetched items against a source's watermark and ledger.
///
/// An item is new when it is newer than the watermark and not yet downloaded.
/// Also returns the newest `(publish_time, item_id)` seen, whether or not it
/// qualified as new.
pub fn classify(
    items: Vec<Item>,
    watermark: i64,
    downloaded: &HashSet<String>,
) -> (Vec<Item>, Option<(i64, String)>) {
    let mut newest: Option<(i64, String)> = None;
    let mut new_items = Vec::new();

    for item in items {
        if newest.as_ref().is_none_or(|(t, _)| item.publish_time > *t) {
            newest = Some((item.publish_time, item.id.clone()));
        }
        if item.publish_time > watermark && !downloaded.contains(&item.id) {
            new_items.push(item);
        }
    }

    (new_items, newest)
}

pub struct ScanOrchestrator {
    deps: ScanDependencies,
    config: ScanConfig,
    settings: RwLock<LoopSettings>,
    state: RwLock<ScanState>,
    gate: PauseGate,
    /// Held for the duration of a run
    run_lock: tokio::sync::Mutex<()>,
    scanning: AtomicBool,
    /// Cancelled by `stop`; replaced by the next `start` or `scan_once`
    cancel: Mutex<CancellationToken>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    current_run: Mutex<Option<RunCollector>>,
    events: broadcast::Sender<ScanEvent>,
}

impl ScanOrchestrator {
    pub fn new(deps: ScanDependencies, config: ScanConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings: RwLock::new(LoopSettings {
                interval: config.interval(),
                auto_download: config.auto_download,
            }),
            deps,
            config,
            state: RwLock::new(ScanState::Idle),
            gate: PauseGate::new(),
            run_lock: tokio::sync::Mutex::new(()),
            scanning: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            loop_task: Mutex::new(None),
            current_run: Mutex::new(None),
            events,
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> ScanState {
        *self.state.read()
    }

    fn set_state(&self, state: ScanState) {
        let changed = {
            let mut current = self.state.write();
            std::mem::replace(&mut *current, state) != state
        };
        if changed {
            debug!(state = ?state, "Scan state changed");
            self.emit(ScanEvent::StateChanged { state });
        }
    }

    fn loop_active(&self) -> bool {
        self.loop_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Current token, replaced with a fresh one if the last was cancelled
    fn session_token(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        cancel.clone()
    }

    fn sleep_step(&self) -> Duration {
        Duration::from_secs(self.config.sleep_check_secs.max(1))
    }

    /// Start the background loop. Returns false if it was already running.
    pub fn start(self: &Arc<Self>, interval: Option<Duration>, auto_download: Option<bool>) -> bool {
        let mut task = self.loop_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Scan loop already running");
            return false;
        }

        {
            let mut settings = self.settings.write();
            if let Some(interval) = interval {
                settings.interval = interval;
            }
            if let Some(auto_download) = auto_download {
                settings.auto_download = auto_download;
            }
            info!(
                interval_secs = settings.interval.as_secs(),
                auto_download = settings.auto_download,
                "Starting scan loop"
            );
        }

        let cancel = self.session_token();
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.run_loop(cancel).await }));
        drop(task);

        self.set_state(if self.gate.is_paused() {
            ScanState::Paused
        } else {
            ScanState::Running
        });
        true
    }

    /// Cancel the loop and any run in flight, then wait for the loop to exit.
    ///
    /// Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let was_scanning = self.scanning.load(Ordering::SeqCst);
        // Waiters on the pause gate also watch the token, so the pause survives the stop
        self.cancel.lock().cancel();

        let handle = self.loop_task.lock().take();
        let had_loop = handle.is_some();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scan loop task failed");
            }
        }

        // Let a manual run observe the cancellation and finish its summary
        let _ = self.run_lock.lock().await;

        self.set_state(ScanState::Stopped);
        info!("Scan loop stopped");
        had_loop || was_scanning
    }

    /// Hold the loop at its next wait-point. Returns false if already paused.
    pub fn pause(&self) -> bool {
        let changed = self.gate.pause();
        if changed {
            info!("Scanning paused");
            self.set_state(ScanState::Paused);
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = self.gate.resume();
        if changed {
            info!("Scanning resumed");
            self.set_state(if self.loop_active() || self.scanning.load(Ordering::SeqCst) {
                ScanState::Running
            } else {
                ScanState::Idle
            });
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Run once outside the schedule and wait for the summary.
    ///
    /// Fails with [Error::RunInProgress] if a run is already active.
    pub async fn scan_once(&self) -> Result<RunSummary> {
        let _guard = self.run_lock.try_lock().map_err(|_| Error::RunInProgress)?;
        info!("Manual scan triggered");
        let cancel = self.session_token();
        let auto_download = self.settings.read().auto_download;
        self.execute_run(&cancel, auto_download).await
    }

    pub async fn status(&self) -> ScanStatus {
        let settings = *self.settings.read();
        let last_run_info = match self.deps.db.source_progress().last_scan_info().await {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(error = %e, "Failed to read last scan info");
                None
            }
        };

        ScanStatus {
            state: self.state(),
            running: self.loop_active(),
            scanning: self.is_scanning(),
            paused: self.gate.is_paused(),
            interval_secs: settings.interval.as_secs(),
            auto_download: settings.auto_download,
            last_run_info,
            current_run: self.current_run.lock().as_ref().map(RunCollector::progress),
        }
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.deps.logger.history(limit).await
    }

    pub async fn detail(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        self.deps.logger.detail(run_id).await
    }

    pub async fn statistics(&self) -> Result<ScanStatistics> {
        Ok(ScanStatistics {
            runs: self.deps.logger.statistics().await?,
            progress: self.deps.db.source_progress().statistics().await?,
            downloads: self.deps.db.downloaded_items().stats().await?,
        })
    }

    /// Housekeeping between runs: expire old run logs and drop ledger
    /// records whose media file is gone, so those items are fetched again.
    pub async fn run_maintenance(&self) {
        match self.deps.logger.cleanup(self.config.log_retention_days).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Expired old scan history entries"),
            Err(e) => warn!(error = %e, "Failed to clean up old scan logs"),
        }
        if let Err(e) = self.deps.db.downloaded_items().cleanup_missing_files().await {
            warn!(error = %e, "Failed to clean up ledger records with missing files");
        }
    }

    async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if !self.gate.wait_if_paused(&cancel).await {
                break;
            }

            let guard = tokio::select! {
                _ = cancel.cancelled() => break,
                guard = self.run_lock.lock() => guard,
            };
            let auto_download = self.settings.read().auto_download;
            let outcome = match self.execute_run(&cancel, auto_download).await {
                Ok(summary) => Some(summary.outcome),
                Err(e) => {
                    error!(error = %e, "Scan run failed");
                    None
                }
            };
            drop(guard);

            if cancel.is_cancelled() {
                break;
            }

            self.run_maintenance().await;

            let mut sleep = self.settings.read().interval;
            if outcome == Some(RunOutcome::RateLimited) {
                sleep = sleep.max(Duration::from_secs(self.config.rate_limit_cooldown_secs));
                warn!(sleep_secs = sleep.as_secs(), "Rate limited, backing off before next run");
            }
            info!(next_run_in_secs = sleep.as_secs(), "Waiting for next scan run");

            if !interruptible_sleep(sleep, self.sleep_step(), &self.gate, &cancel).await {
                break;
            }
        }
        debug!("Scan loop exited");
    }

    /// One full pass over all enabled sources. Caller holds the run lock.
    async fn execute_run(&self, cancel: &CancellationToken, auto_download: bool) -> Result<RunSummary> {
        self.scanning.store(true, Ordering::SeqCst);
        let _scanning = ScanningGuard(&self.scanning);
        if self.state() == ScanState::Idle || self.state() == ScanState::Stopped {
            self.set_state(ScanState::Running);
        }

        let result = self.scan_all_sources(cancel).await;
        let after = if self.gate.is_paused() {
            ScanState::Paused
        } else if cancel.is_cancelled() {
            ScanState::Stopped
        } else if self.loop_active() {
            ScanState::Running
        } else {
            ScanState::Idle
        };
        self.set_state(after);

        let (mut summary, batches) = result?;

        match self.deps.logger.log(&summary).await {
            Ok(run_id) => summary.run_id = Some(run_id),
            Err(e) => warn!(error = %e, "Failed to log scan run"),
        }

        info!(
            run_id = ?summary.run_id,
            outcome = ?summary.outcome,
            scanned = summary.scanned_sources,
            failed = summary.failed_sources,
            new_items = summary.total_new_items,
            duration_secs = summary.duration_secs,
            "Scan run complete"
        );

        self.dispatch_batches(batches, cancel, auto_download).await;

        for notifier in &self.deps.notifiers {
            if let Err(e) = notifier.notify_run(&summary).await {
                warn!(error = %e, "Run notification failed");
            }
        }
        self.emit(ScanEvent::RunCompleted {
            summary: summary.clone(),
        });

        Ok(summary)
    }

    async fn scan_all_sources(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(RunSummary, Vec<NewItemBatch>)> {
        let progress = self.deps.db.source_progress();

        let sources = self.deps.db.subscriptions().active_sources().await?;
        let active_ids: Vec<String> = sources.iter().map(|s| s.source_id.clone()).collect();
        let purged = progress.purge(&active_ids).await?;
        if purged > 0 {
            info!(purged, "Removed progress of unsubscribed sources");
        }

        let round = progress.start_new_round().await?;
        let (new_sources, known_sources) = progress.partition_by_priority(sources).await?;
        if !new_sources.is_empty() {
            info!(count = new_sources.len(), "New sources are scanned first");
        }
        let ordered: Vec<Source> = new_sources.into_iter().chain(known_sources).collect();
        let total = ordered.len();

        let mut collector = RunCollector::new();
        collector.begin(total);
        *self.current_run.lock() = Some(collector);

        info!(round, total_sources = total, "Scan run started");
        self.emit(ScanEvent::RunStarted {
            round,
            total_sources: total,
        });

        let mut outcome = RunOutcome::Completed;
        let mut batches = Vec::new();

        for (idx, source) in ordered.into_iter().enumerate() {
            if !self.gate.wait_if_paused(cancel).await {
                outcome = RunOutcome::Cancelled;
                break;
            }

            self.with_collector(|c| c.start_source(&source.source_id, &source.nickname))?;
            debug!(
                source_id = %source.source_id,
                position = idx + 1,
                total,
                "Scanning source"
            );

            let scanned = self.scan_source(&source, cancel).await;
            match scanned {
                Ok(items) => {
                    self.with_collector(|c| c.end_source(&source.source_id, None))?;
                    self.emit(ScanEvent::SourceScanned {
                        source_id: source.source_id.clone(),
                        new_items: items.len(),
                        error: None,
                    });
                    if !items.is_empty() {
                        info!(source_id = %source.source_id, new_items = items.len(), "Found new items");
                        batches.push(NewItemBatch { source, items });
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    self.with_collector(|c| c.end_source(&source.source_id, Some(message.clone())))?;
                    self.emit(ScanEvent::SourceScanned {
                        source_id: source.source_id.clone(),
                        new_items: 0,
                        error: Some(message),
                    });

                    if e.is_rate_limited() {
                        error!(source_id = %source.source_id, error = %e, "Rate limited, aborting remaining sources");
                        outcome = RunOutcome::RateLimited;
                        break;
                    }
                    if e.is_storage() {
                        error!(source_id = %source.source_id, error = %e, "Storage failure scanning source");
                    } else {
                        warn!(source_id = %source.source_id, error = %e, "Failed to scan source");
                    }
                }
            }

            if cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }

            if idx + 1 < total
                && !interruptible_sleep(self.config.source_delay(), self.sleep_step(), &self.gate, cancel).await
            {
                outcome = RunOutcome::Cancelled;
                break;
            }
        }

        let collector = self
            .current_run
            .lock()
            .take()
            .ok_or_else(|| Error::Logic("run collector disappeared mid-run".into()))?;

        Ok((collector.summary(outcome), batches))
    }

    fn with_collector<T>(&self, f: impl FnOnce(&mut RunCollector) -> Result<T>) -> Result<T> {
        match self.current_run.lock().as_mut() {
            Some(collector) => f(collector),
            None => Err(Error::Logic("no run in progress".into())),
        }
    }

    /// Fetch, classify and checkpoint one source
    async fn scan_source(&self, source: &Source, cancel: &CancellationToken) -> Result<Vec<Item>> {
        let progress = self.deps.db.source_progress();
        let ledger = self.deps.db.downloaded_items();
        let source_id = source.source_id.as_str();

        let watermark = progress
            .get(source_id)
            .await?
            .map(|p| p.last_seen_item_time)
            .unwrap_or(0);

        let items = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Fetch("cancelled".into())),
            items = self.deps.fetcher.fetch_all_items(source_id) => items?,
        };

        // The ledger is keyed by item id alone, so look past the source boundary
        let candidates: Vec<String> = items
            .iter()
            .filter(|item| item.publish_time > watermark)
            .map(|item| item.id.clone())
            .collect();
        let downloaded = match ledger.downloaded_among(&candidates).await {
            Ok(ids) => ids,
            Err(e) if self.config.ledger_fail_open => {
                warn!(source_id = %source_id, error = %e, "Ledger unreadable, treating all items as pending");
                HashSet::new()
            }
            Err(e) => return Err(e),
        };

        let fetched = items.len();
        let (new_items, newest) = classify(items, watermark, &downloaded);

        match newest {
            Some((time, item_id)) if time > watermark => {
                progress.update(source_id, time, &item_id).await?;
            }
            _ => progress.touch(source_id).await?,
        }

        self.with_collector(|c| c.record_new_items(source_id, &new_items))?;
        debug!(
            source_id = %source_id,
            fetched,
            new_items = new_items.len(),
            watermark,
            "Classified source"
        );
        Ok(new_items)
    }

    async fn dispatch_batches(
        &self,
        batches: Vec<NewItemBatch>,
        cancel: &CancellationToken,
        auto_download: bool,
    ) {
        for batch in batches {
            let summaries: Vec<ItemSummary> = batch.items.iter().map(ItemSummary::from_item).collect();
            self.emit(ScanEvent::NewItems {
                source_id: batch.source.source_id.clone(),
                label: batch.source.nickname.clone(),
                items: summaries.clone(),
            });
            for notifier in &self.deps.notifiers {
                if let Err(e) = notifier.notify_new_items(&batch.source, &summaries).await {
                    warn!(source_id = %batch.source.source_id, error = %e, "New item notification failed");
                }
            }

            if !(auto_download && batch.source.auto_download) {
                continue;
            }
            let Some(downloader) = &self.deps.downloader else {
                continue;
            };
            if cancel.is_cancelled() {
                warn!(
                    source_id = %batch.source.source_id,
                    pending = batch.items.len(),
                    "Run cancelled, skipping downloads"
                );
                continue;
            }

            self.download_batch(downloader.as_ref(), &batch, cancel).await;
        }
    }

    async fn download_batch(
        &self,
        downloader: &dyn Downloader,
        batch: &NewItemBatch,
        cancel: &CancellationToken,
    ) {
        let ledger = self.deps.db.downloaded_items();
        let source_id = batch.source.source_id.as_str();
        // Cut short by `cancel`; whatever finished is still recorded
        let outcomes = downloader.download(source_id, &batch.items, cancel).await;

        let mut succeeded = 0;
        for outcome in outcomes.iter().filter(|o| o.is_success()) {
            let now = chrono::Utc::now().timestamp();
            match ledger
                .mark_downloaded_at(&outcome.item_id, source_id, now, outcome.save_path.as_deref())
                .await
            {
                Ok(_) => succeeded += 1,
                Err(e) => {
                    error!(source_id = %source_id, item_id = %outcome.item_id, error = %e, "Failed to record download")
                }
            }
        }

        info!(
            source_id = %source_id,
            requested = batch.items.len(),
            succeeded,
            failed = outcomes.len() - outcomes.iter().filter(|o| o.is_success()).count(),
            skipped = batch.items.len().saturating_sub(outcomes.len()),
            "Downloads finished"
        );
    }
}
