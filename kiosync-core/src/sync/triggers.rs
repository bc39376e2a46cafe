//! Automatic sync triggers
//!
//! Besides manual calls, a run starts when connectivity comes back or when
//! the scheduler ticks, in both cases only if something is queued. All
//! triggers go through [`SyncProcessor::start_sync`], so overlapping
//! triggers collapse into one run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::processor::{SyncProcessor, SyncRunOutcome};
use crate::connectivity::{ConnectivityMonitor, ListenerHandle};

/// Source of periodic sync ticks
#[async_trait]
pub trait Scheduler: Send + 'static {
    /// Wait for the next tick; `false` once the scheduler is finished.
    async fn tick(&mut self) -> bool;
}

/// Fixed-period scheduler. The first tick fires one period after creation.
pub struct IntervalScheduler {
    interval: Interval,
}

impl IntervalScheduler {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Scheduler for IntervalScheduler {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Manual tick source, mostly for tests
#[async_trait]
impl Scheduler for mpsc::Receiver<()> {
    async fn tick(&mut self) -> bool {
        self.recv().await.is_some()
    }
}

/// Running trigger tasks.
///
/// Stopping only takes effect between runs; a run that has started is
/// never cancelled. Dropping the handle stops the triggers without waiting.
pub struct SyncTriggers {
    listener: Option<ListenerHandle>,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncTriggers {
    /// Start the reconnect and scheduler triggers. Must be called from
    /// within a Tokio runtime.
    pub fn spawn<S: Scheduler>(
        processor: Arc<SyncProcessor>,
        monitor: &ConnectivityMonitor,
        mut scheduler: S,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let (reconnect_tx, mut reconnect_rx) = mpsc::unbounded_channel::<()>();
        let was_online = AtomicBool::new(monitor.is_online());
        let listener = monitor.add_listener(move |state| {
            let online = state.is_online();
            if online && !was_online.swap(online, Ordering::AcqRel) {
                let _ = reconnect_tx.send(());
            } else {
                was_online.store(online, Ordering::Release);
            }
        });

        let on_reconnect = {
            let processor = Arc::clone(&processor);
            let mut stopped = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stopped.changed() => break,
                        signal = reconnect_rx.recv() => match signal {
                            Some(()) => run_if_pending(&processor, "reconnect").await,
                            None => break,
                        },
                    }
                }
            })
        };

        let on_tick = {
            let mut stopped = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stopped.changed() => break,
                        more = scheduler.tick() => {
                            if !more {
                                tracing::debug!("Sync scheduler finished");
                                break;
                            }
                            run_if_pending(&processor, "interval").await;
                        }
                    }
                }
            })
        };

        Self {
            listener: Some(listener),
            stop,
            tasks: vec![on_reconnect, on_tick],
        }
    }

    /// Stop all triggers and wait for a run already in flight to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Sync trigger task failed");
            }
        }
    }

    fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.unsubscribe();
        }
        let _ = self.stop.send(true);
    }
}

impl Drop for SyncTriggers {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_if_pending(processor: &SyncProcessor, trigger: &'static str) {
    match processor.pending_count() {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(trigger, error = %e, "Failed to read sync queue");
            return;
        }
    }

    match processor.start_sync().await {
        Ok(SyncRunOutcome::Completed(metrics)) => {
            tracing::debug!(trigger, delivered = metrics.delivered, "Triggered sync finished");
        }
        Ok(outcome) => tracing::debug!(trigger, ?outcome, "Triggered sync skipped"),
        Err(e) => tracing::warn!(trigger, error = %e, "Triggered sync failed"),
    }
}
