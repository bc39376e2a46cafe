//! Queue processor
//!
//! Drains the sync queue one item at a time. Each item ends a run in one
//! of four states:
//!
//! | Outcome | Trigger | Queue row |
//! |---------|---------|-----------|
//! | Delivered | handler succeeded | deleted |
//! | Requeued | retryable failure, `retry_count < max_retries` | `retry_count + 1`, `last_attempt = now` |
//! | Abandoned | permanent failure, retries exhausted, or undecodable payload | deleted, logged |
//! | Deferred | retry backoff not yet elapsed | untouched |
//!
//! A run stops between items as soon as the device stops being
//! sync-eligible; everything not yet processed stays queued unchanged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::handlers::EndpointHandlers;
use super::payload::QueuePayload;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, TransportType};
use crate::db::Database;
use crate::error::{Error, RemoteError, Result};
use crate::types::{SyncQueueItem, SyncStatus};

/// Processor tunables, usually taken from `[sync]` config
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_retries: u32,
    pub item_pause: Duration,
    pub request_timeout: Duration,
    /// Zero disables backoff
    pub retry_backoff: Duration,
}

impl From<&SyncConfig> for ProcessorSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            item_pause: config.item_pause(),
            request_timeout: config.request_timeout(),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Progress reported after each item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub total: usize,
    /// Items delivered so far
    pub completed: usize,
    /// Items requeued or abandoned so far
    pub failed: usize,
    /// Items skipped this run while their retry backoff runs
    pub deferred: usize,
    /// An item is being attempted right now
    pub in_progress: bool,
    pub current_item_label: Option<String>,
}

/// Summary of one finished run
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    /// Mean wall time per attempted item
    pub avg_sync_time: Duration,
    pub last_sync_attempt: DateTime<Utc>,
    pub connection_type: TransportType,
    pub total: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub abandoned: usize,
    pub deferred: usize,
    /// Connectivity was lost before the snapshot was exhausted
    pub interrupted: bool,
}

/// Result of [`SyncProcessor::start_sync`]
#[derive(Debug, Clone)]
pub enum SyncRunOutcome {
    /// Another run is in flight; nothing was done
    AlreadyRunning,
    /// Not sync-eligible; nothing was done
    Offline,
    Completed(SyncMetrics),
}

/// Queue state for UIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Delivered,
    Requeued,
    Abandoned,
}

pub type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;
pub type CompletionCallback = Arc<dyn Fn(&SyncMetrics) + Send + Sync>;

/// Clears the in-flight flag however the run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncProcessor {
    db: Arc<Database>,
    monitor: ConnectivityMonitor,
    handlers: EndpointHandlers,
    settings: ProcessorSettings,
    running: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    progress_callback: Mutex<Option<ProgressCallback>>,
    completion_callback: Mutex<Option<CompletionCallback>>,
}

impl SyncProcessor {
    pub fn new(
        db: Arc<Database>,
        monitor: ConnectivityMonitor,
        handlers: EndpointHandlers,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            db,
            monitor,
            handlers,
            settings,
            running: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            progress_callback: Mutex::new(None),
            completion_callback: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        *self
            .progress_callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(callback));
    }

    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncMetrics) + Send + Sync + 'static,
    {
        *self
            .completion_callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(callback));
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self
            .last_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.db.count_queue_items()
    }

    pub fn get_sync_status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            pending_count: self.pending_count()?,
            is_syncing: self.is_syncing(),
            last_sync: self.last_sync(),
        })
    }

    /// Drop every queued item without delivering it
    pub fn clear_queue(&self) -> Result<usize> {
        let removed = self.db.clear_queue()?;
        tracing::warn!(removed, "Cleared sync queue");
        Ok(removed)
    }

    /// Run one pass over the queue.
    ///
    /// Store errors end the run and are returned; delivery errors are
    /// classified into queue transitions and never end it.
    pub async fn start_sync(&self) -> Result<SyncRunOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync already in progress");
            return Ok(SyncRunOutcome::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        if !self.monitor.is_sync_eligible() {
            tracing::debug!("Skipping sync: not eligible");
            return Ok(SyncRunOutcome::Offline);
        }

        let items = self.db.list_queue_items(None)?;
        let metrics = self.process_snapshot(&items).await?;

        if !metrics.interrupted {
            *self
                .last_sync
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(metrics.last_sync_attempt);
        }

        tracing::info!(
            total = metrics.total,
            delivered = metrics.delivered,
            requeued = metrics.requeued,
            abandoned = metrics.abandoned,
            deferred = metrics.deferred,
            interrupted = metrics.interrupted,
            "Sync run finished"
        );

        let callback = self
            .completion_callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&metrics);
        }

        Ok(SyncRunOutcome::Completed(metrics))
    }

    async fn process_snapshot(&self, items: &[SyncQueueItem]) -> Result<SyncMetrics> {
        let started_at = Utc::now();
        let mut progress = SyncProgress {
            total: items.len(),
            ..Default::default()
        };
        let mut metrics = SyncMetrics {
            avg_sync_time: Duration::ZERO,
            last_sync_attempt: started_at,
            connection_type: self.monitor.get_current_state().transport_type,
            total: items.len(),
            delivered: 0,
            requeued: 0,
            abandoned: 0,
            deferred: 0,
            interrupted: false,
        };
        let mut attempt_time = Duration::ZERO;
        let mut attempts = 0u32;

        for (index, item) in items.iter().enumerate() {
            if index > 0 && !self.settings.item_pause.is_zero() {
                tokio::time::sleep(self.settings.item_pause).await;
            }

            if !self.monitor.is_sync_eligible() {
                tracing::info!(
                    remaining = items.len() - index,
                    "Connectivity lost, stopping sync"
                );
                metrics.interrupted = true;
                break;
            }

            if self.is_backing_off(item, Utc::now()) {
                tracing::debug!(id = %item.id, retry_count = item.retry_count, "Deferring queue item");
                metrics.deferred += 1;
                progress.deferred += 1;
                self.emit_progress(&progress);
                continue;
            }

            progress.in_progress = true;
            progress.current_item_label = Some(item_label(item));
            self.emit_progress(&progress);

            let attempt_started = Instant::now();
            let outcome = self.process_item(item).await?;
            attempt_time += attempt_started.elapsed();
            attempts += 1;

            match outcome {
                ItemOutcome::Delivered => {
                    metrics.delivered += 1;
                    progress.completed += 1;
                }
                ItemOutcome::Requeued => {
                    metrics.requeued += 1;
                    progress.failed += 1;
                }
                ItemOutcome::Abandoned => {
                    metrics.abandoned += 1;
                    progress.failed += 1;
                }
            }
            progress.in_progress = false;
            self.emit_progress(&progress);
        }

        if attempts > 0 {
            metrics.avg_sync_time = attempt_time / attempts;
        }
        metrics.last_sync_attempt = Utc::now();
        Ok(metrics)
    }

    /// Attempt one item and apply its queue transition.
    async fn process_item(&self, item: &SyncQueueItem) -> Result<ItemOutcome> {
        let payload = match QueuePayload::decode(&item.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(id = %item.id, error = %e, "Abandoning undecodable queue item");
                self.db.delete_queue_item(&item.id)?;
                return Ok(ItemOutcome::Abandoned);
            }
        };

        let tracks_response = matches!(payload, QueuePayload::PrimaryStore(_));
        if tracks_response {
            self.set_response_status(payload.response_id(), SyncStatus::Syncing)?;
        }

        let delivery = self.handlers.dispatch(&payload);
        let result = tokio::time::timeout(self.settings.request_timeout, delivery)
            .await
            .unwrap_or(Err(RemoteError::Timeout));

        let (outcome, status) = match result {
            Ok(()) => {
                self.db.delete_queue_item(&item.id)?;
                tracing::debug!(id = %item.id, kind = %item.endpoint_kind, "Delivered queue item");
                (ItemOutcome::Delivered, SyncStatus::Synced)
            }
            Err(e) if e.is_retryable() && item.retry_count < self.settings.max_retries => {
                self.requeue(item)?;
                tracing::info!(
                    id = %item.id,
                    kind = %item.endpoint_kind,
                    retry_count = item.retry_count + 1,
                    error = %e,
                    "Requeued queue item"
                );
                (ItemOutcome::Requeued, SyncStatus::Pending)
            }
            Err(e) => {
                self.db.delete_queue_item(&item.id)?;
                tracing::warn!(
                    id = %item.id,
                    kind = %item.endpoint_kind,
                    retry_count = item.retry_count,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Abandoned queue item"
                );
                (ItemOutcome::Abandoned, SyncStatus::Failed)
            }
        };

        if tracks_response {
            self.set_response_status(payload.response_id(), status)?;
        }
        Ok(outcome)
    }

    /// The row may have been removed while the handler ran, e.g. by
    /// `clear_queue`; there is nothing left to requeue then.
    fn requeue(&self, item: &SyncQueueItem) -> Result<()> {
        match self.db.update_queue_item(&item.id, 1, Utc::now()) {
            Err(Error::NotFound { .. }) => {
                tracing::info!(id = %item.id, "Queue item removed during delivery");
                Ok(())
            }
            other => other,
        }
    }

    /// A response may have been cleared out from under its queue item; that
    /// is not a reason to fail the run.
    fn set_response_status(&self, response_id: &str, status: SyncStatus) -> Result<()> {
        match self.db.update_response_status(response_id, status) {
            Err(Error::NotFound { .. }) => {
                tracing::debug!(response_id, "No local response for queue item");
                Ok(())
            }
            other => other,
        }
    }

    /// With backoff enabled, an item that already failed waits
    /// `backoff * 2^(retry_count - 1)` after its last attempt.
    fn is_backing_off(&self, item: &SyncQueueItem, now: DateTime<Utc>) -> bool {
        if self.settings.retry_backoff.is_zero() || item.retry_count == 0 {
            return false;
        }
        let Some(last_attempt) = item.last_attempt else {
            return false;
        };
        let factor = 1u32
            .checked_shl(item.retry_count - 1)
            .unwrap_or(u32::MAX);
        let delay = self.settings.retry_backoff.saturating_mul(factor);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => last_attempt + delay > now,
            Err(_) => true,
        }
    }

    fn emit_progress(&self, progress: &SyncProgress) {
        let callback = self
            .progress_callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(progress);
        }
    }
}

fn item_label(item: &SyncQueueItem) -> String {
    format!("{} ({})", item.id, item.endpoint_kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::NetworkState;
    use crate::remote::MemoryDocumentStore;
    use crate::sync::queue::SyncQueue;
    use crate::types::{Brand, EndpointKind, ParentMeta};
    use serde_json::json;

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            max_retries: 3,
            item_pause: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
            retry_backoff: Duration::ZERO,
        }
    }

    fn setup(
        settings: ProcessorSettings,
    ) -> (
        SyncProcessor,
        Arc<Database>,
        ConnectivityMonitor,
        MemoryDocumentStore,
    ) {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let db = Arc::new(db);
        let monitor = ConnectivityMonitor::new(false);
        monitor.apply(NetworkState::online(TransportType::Wifi));
        let store = MemoryDocumentStore::new(true);
        let processor = SyncProcessor::new(
            Arc::clone(&db),
            monitor.clone(),
            EndpointHandlers::primary_only(Arc::new(store.clone())),
            settings,
        );
        (processor, db, monitor, store)
    }

    fn failed_item(id: &str, retry_count: u32, last_attempt: DateTime<Utc>) -> SyncQueueItem {
        SyncQueueItem {
            id: id.to_string(),
            endpoint_kind: EndpointKind::BrandA,
            payload: "{}".to_string(),
            retry_count,
            last_attempt: Some(last_attempt),
            created_at: last_attempt,
        }
    }

    #[tokio::test]
    async fn test_offline_does_nothing() {
        let (processor, db, monitor, _store) = setup(settings());
        SyncQueue::new(Arc::clone(&db))
            .queue_user_response(json!({}), &ParentMeta::new("evt-1", Brand::Other))
            .unwrap();
        monitor.apply(NetworkState::disconnected());

        let outcome = processor.start_sync().await.unwrap();
        assert!(matches!(outcome, SyncRunOutcome::Offline));
        assert_eq!(processor.pending_count().unwrap(), 1);
        assert!(!processor.is_syncing());
        assert!(processor.last_sync().is_none());
    }

    #[tokio::test]
    async fn test_delivers_and_marks_synced() {
        let (processor, db, _monitor, store) = setup(settings());
        let response = SyncQueue::new(Arc::clone(&db))
            .queue_user_response(json!({"q": 1}), &ParentMeta::new("evt-1", Brand::Other))
            .unwrap();

        let SyncRunOutcome::Completed(metrics) = processor.start_sync().await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(metrics.delivered, 1);
        assert!(!metrics.interrupted);
        assert_eq!(metrics.connection_type, TransportType::Wifi);
        assert_eq!(processor.pending_count().unwrap(), 0);
        assert!(processor.last_sync().is_some());
        assert!(store.get("events/evt-1/surveys", &response.id).is_some());
        assert_eq!(
            db.get_response(&response.id).unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_abandoned() {
        let (processor, db, _monitor, _store) = setup(settings());
        let mut item = failed_item("broken", 0, Utc::now());
        item.payload = "not json".to_string();
        item.last_attempt = None;
        db.enqueue_sync_item(&item).unwrap();

        let SyncRunOutcome::Completed(metrics) = processor.start_sync().await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(metrics.abandoned, 1);
        assert!(db.get_queue_item("broken").unwrap().is_none());
    }

    #[test]
    fn test_backoff_window() {
        let (processor, _db, _monitor, _store) = setup(ProcessorSettings {
            retry_backoff: Duration::from_millis(1_000),
            ..settings()
        });
        let now = Utc::now();

        // retry 1 waits 1s, retry 3 waits 4s
        let item = failed_item("a", 1, now - chrono::Duration::milliseconds(500));
        assert!(processor.is_backing_off(&item, now));
        let item = failed_item("a", 1, now - chrono::Duration::milliseconds(1_500));
        assert!(!processor.is_backing_off(&item, now));
        let item = failed_item("a", 3, now - chrono::Duration::milliseconds(3_000));
        assert!(processor.is_backing_off(&item, now));

        let fresh = SyncQueueItem {
            retry_count: 0,
            last_attempt: None,
            ..failed_item("b", 0, now)
        };
        assert!(!processor.is_backing_off(&fresh, now));
    }

    #[test]
    fn test_backoff_disabled_by_default() {
        let (processor, _db, _monitor, _store) = setup(settings());
        let now = Utc::now();
        assert!(!processor.is_backing_off(&failed_item("a", 2, now), now));
    }

    #[tokio::test]
    async fn test_progress_reports_each_item() {
        let (processor, db, _monitor, _store) = setup(settings());
        let queue = SyncQueue::new(Arc::clone(&db));
        queue
            .queue_user_response(json!({}), &ParentMeta::new("evt-1", Brand::Other))
            .unwrap();
        queue
            .queue_user_response(json!({}), &ParentMeta::new("evt-2", Brand::Other))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        processor.set_progress_callback(move |p| sink.lock().unwrap().push(p.clone()));

        processor.start_sync().await.unwrap();

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.total, 2);
        assert_eq!(last.completed, 2);
        assert_eq!(last.failed, 0);
        assert!(!last.in_progress);
        assert!(seen.iter().any(|p| p.in_progress && p.current_item_label.is_some()));
    }

    #[tokio::test]
    async fn test_progress_counts_deferred_items() {
        let (processor, db, _monitor, _store) = setup(ProcessorSettings {
            retry_backoff: Duration::from_secs(60),
            ..settings()
        });
        db.enqueue_sync_item(&failed_item("waiting", 1, Utc::now()))
            .unwrap();
        SyncQueue::new(Arc::clone(&db))
            .queue_user_response(json!({}), &ParentMeta::new("evt-1", Brand::Other))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        processor.set_progress_callback(move |p| sink.lock().unwrap().push(p.clone()));

        let SyncRunOutcome::Completed(metrics) = processor.start_sync().await.unwrap() else {
            panic!("expected a completed run");
        };
        assert_eq!(metrics.deferred, 1);

        let seen = seen.lock().unwrap();
        let last = seen.last().unwrap();
        assert_eq!(last.total, 2);
        assert_eq!(last.completed + last.failed + last.deferred, last.total);
        assert_eq!(last.deferred, 1);
        assert!(db.get_queue_item("waiting").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_status_reports_queue() {
        let (processor, db, _monitor, _store) = setup(settings());
        SyncQueue::new(Arc::clone(&db))
            .queue_user_response(json!({}), &ParentMeta::new("evt-1", Brand::BrandA))
            .unwrap();

        let status = processor.get_sync_status().unwrap();
        assert_eq!(status.pending_count, 2);
        assert!(!status.is_syncing);
        assert!(status.last_sync.is_none());

        assert_eq!(processor.clear_queue().unwrap(), 2);
        assert_eq!(processor.get_sync_status().unwrap().pending_count, 0);
    }
}
