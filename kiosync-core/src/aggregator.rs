//! Pending-write aggregation
//!
//! Watches the response collections of one primary record and up to
//! [`MAX_LINKED_RECORDS`] linked records, and reduces their snapshots to a
//! single "how much is still unacknowledged" figure for the UI.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::remote::{
    linked_collection, primary_collection, DocumentStore, SnapshotResult, WatchHandle,
};

/// Remote query fan-in limit
pub const MAX_LINKED_RECORDS: usize = 10;

/// Aggregate view published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateStatus {
    pub pending_write_count: usize,
    pub is_fully_synced: bool,
    /// A server-confirmed snapshot has arrived since the focus was set
    pub is_online: bool,
    pub watched_collections: usize,
}

impl Default for AggregateStatus {
    fn default() -> Self {
        Self {
            pending_write_count: 0,
            is_fully_synced: true,
            is_online: false,
            watched_collections: 0,
        }
    }
}

#[derive(Default)]
struct FocusState {
    /// Bumped on every focus change; stale snapshots carry an old value
    generation: u64,
    collections: Vec<String>,
    pending_by_collection: HashMap<String, usize>,
    online: bool,
    handles: Vec<WatchHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl FocusState {
    fn status(&self) -> AggregateStatus {
        let pending: usize = self.pending_by_collection.values().sum();
        AggregateStatus {
            pending_write_count: pending,
            is_fully_synced: pending == 0,
            is_online: self.online,
            watched_collections: self.collections.len(),
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.handles.clear();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.collections.clear();
        self.pending_by_collection.clear();
        self.online = false;
    }
}

struct Shared {
    state: Mutex<FocusState>,
    status: watch::Sender<AggregateStatus>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FocusState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &FocusState) {
        self.status.send_replace(state.status());
    }

    fn apply(&self, generation: u64, collection: &str, result: SnapshotResult) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        match result {
            Ok(snapshot) => {
                state
                    .pending_by_collection
                    .insert(collection.to_string(), snapshot.pending_count());
                if !snapshot.from_cache {
                    state.online = true;
                }
            }
            Err(e) => {
                tracing::warn!(collection, error = %e, "Snapshot listener failed");
                state.online = false;
            }
        }
        self.publish(&state);
    }
}

/// Counts unacknowledged writes across the focused record's collections
pub struct PendingWriteAggregator {
    store: Arc<dyn DocumentStore>,
    shared: Arc<Shared>,
}

impl PendingWriteAggregator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (status, _) = watch::channel(AggregateStatus::default());
        Self {
            store,
            shared: Arc::new(Shared {
                state: Mutex::new(FocusState::default()),
                status,
            }),
        }
    }

    /// Watch `primary_id` and its linked records, replacing any previous
    /// focus. Must be called from within a Tokio runtime.
    pub fn set_focus(&self, primary_id: &str, linked_ids: &[String]) -> Result<()> {
        if linked_ids.len() > MAX_LINKED_RECORDS {
            return Err(Error::TooManyLinkedRecords {
                count: linked_ids.len(),
                max: MAX_LINKED_RECORDS,
            });
        }

        let mut state = self.shared.lock();
        state.reset();
        let generation = state.generation;

        let collections: Vec<String> = std::iter::once(primary_collection(primary_id))
            .chain(linked_ids.iter().map(|id| linked_collection(id)))
            .collect();

        for collection in &collections {
            let watch = self.store.watch(collection);
            let mut snapshots = watch.snapshots;
            let shared = Arc::clone(&self.shared);
            let collection_name = collection.clone();
            let task = tokio::spawn(async move {
                while let Some(result) = snapshots.recv().await {
                    shared.apply(generation, &collection_name, result);
                }
            });
            state.handles.push(watch.handle);
            state.tasks.push(task);
        }

        tracing::debug!(
            primary_id,
            linked = linked_ids.len(),
            "Aggregator focus set"
        );
        state.collections = collections;
        self.shared.publish(&state);
        Ok(())
    }

    /// Cancel all watches and reset counters
    pub fn clear_focus(&self) {
        let mut state = self.shared.lock();
        state.reset();
        self.shared.publish(&state);
    }

    pub fn status(&self) -> AggregateStatus {
        self.shared.lock().status()
    }

    pub fn pending_write_count(&self) -> usize {
        self.status().pending_write_count
    }

    pub fn is_fully_synced(&self) -> bool {
        self.status().is_fully_synced
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online
    }

    /// Collections currently watched, primary first
    pub fn focused_collections(&self) -> Vec<String> {
        self.shared.lock().collections.clone()
    }

    /// Live status updates
    pub fn subscribe(&self) -> watch::Receiver<AggregateStatus> {
        self.shared.status.subscribe()
    }
}

impl Drop for PendingWriteAggregator {
    fn drop(&mut self) {
        self.shared.lock().reset();
    }
}
