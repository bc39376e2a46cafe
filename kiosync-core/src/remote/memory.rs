//! In-memory document store with local-first write semantics
//!
//! Writes are always accepted. While offline they stay flagged as pending
//! and snapshots report `from_cache`; going online acknowledges every
//! pending write and pushes a server-confirmed snapshot to all watchers.

use super::{DocumentMeta, DocumentStore, Snapshot, SnapshotResult, Watch, WatchHandle};
use crate::error::RemoteError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

struct StoredDocument {
    data: Value,
    pending: bool,
}

struct Watcher {
    id: u64,
    collection: String,
    tx: mpsc::UnboundedSender<SnapshotResult>,
}

#[derive(Default)]
struct MemoryState {
    online: bool,
    collections: HashMap<String, BTreeMap<String, StoredDocument>>,
    watchers: Vec<Watcher>,
    next_watcher_id: u64,
    writes: usize,
}

impl MemoryState {
    fn snapshot(&self, collection: &str) -> Snapshot {
        let documents = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| DocumentMeta {
                        id: id.clone(),
                        has_pending_writes: doc.pending,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Snapshot {
            collection: collection.to_string(),
            from_cache: !self.online,
            documents,
        }
    }

    /// Push a fresh snapshot to every watcher of `collection`, dropping
    /// watchers whose receiver is gone.
    fn notify(&mut self, collection: &str) {
        let snapshot = self.snapshot(collection);
        self.watchers.retain(|w| {
            w.collection != collection || w.tx.send(Ok(snapshot.clone())).is_ok()
        });
    }

    fn notify_all(&mut self) {
        let collections: Vec<String> = self
            .watchers
            .iter()
            .map(|w| w.collection.clone())
            .collect();
        for collection in collections {
            self.notify(&collection);
        }
    }
}

/// Local-first document store kept in memory
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDocumentStore {
    pub fn new(online: bool) -> Self {
        let store = Self::default();
        store.lock().online = online;
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    /// Toggle server reachability. Going online acknowledges all pending
    /// writes.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        if state.online == online {
            return;
        }
        state.online = online;
        if online {
            for docs in state.collections.values_mut() {
                for doc in docs.values_mut() {
                    doc.pending = false;
                }
            }
            state.notify_all();
        }
    }

    /// Read a document back
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|doc| doc.data.clone())
    }

    /// Number of documents in a collection
    pub fn document_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Total writes accepted, including overwrites
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    /// Active subscriptions
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    /// Deliver `error` to every watcher of `collection`
    pub fn fail_watchers(&self, collection: &str, error: RemoteError) {
        let state = self.lock();
        for watcher in state.watchers.iter().filter(|w| w.collection == collection) {
            let _ = watcher.tx.send(Err(error.clone()));
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn write(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> std::result::Result<(), RemoteError> {
        let mut state = self.lock();
        let pending = !state.online;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredDocument {
                    data: document.clone(),
                    pending,
                },
            );
        state.writes += 1;
        state.notify(collection);
        Ok(())
    }

    fn watch(&self, collection: &str) -> Watch {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_watcher_id;
        state.next_watcher_id += 1;

        // Initial snapshot, as a real listener delivers on attach
        let _ = tx.send(Ok(state.snapshot(collection)));
        state.watchers.push(Watcher {
            id,
            collection: collection.to_string(),
            tx,
        });

        let weak = Arc::downgrade(&self.state);
        Watch {
            snapshots: rx,
            handle: WatchHandle::new(move || {
                if let Some(state) = weak.upgrade() {
                    state
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .watchers
                        .retain(|w| w.id != id);
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_offline_write_stays_pending_until_online() {
        let store = MemoryDocumentStore::new(false);
        let mut watch = store.watch("events/e1/surveys");

        let initial = watch.snapshots.recv().await.unwrap().unwrap();
        assert!(initial.from_cache);
        assert!(initial.documents.is_empty());

        store
            .write("events/e1/surveys", "r1", &json!({"a": 1}))
            .await
            .unwrap();
        let after_write = watch.snapshots.recv().await.unwrap().unwrap();
        assert_eq!(after_write.pending_count(), 1);

        store.set_online(true);
        let confirmed = watch.snapshots.recv().await.unwrap().unwrap();
        assert!(!confirmed.from_cache);
        assert_eq!(confirmed.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_is_upsert() {
        let store = MemoryDocumentStore::new(true);
        store.write("c", "r1", &json!({"v": 1})).await.unwrap();
        store.write("c", "r1", &json!({"v": 2})).await.unwrap();

        assert_eq!(store.document_count("c"), 1);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.get("c", "r1").unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn test_cancel_removes_watcher() {
        let store = MemoryDocumentStore::new(true);
        let watch = store.watch("c");
        assert_eq!(store.watcher_count(), 1);
        watch.handle.cancel();
        assert_eq!(store.watcher_count(), 0);
    }
}
