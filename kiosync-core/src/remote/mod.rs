//! Remote collaborators
//!
//! The sync engine talks to two kinds of remote systems:
//! - A document store with client-side durability: writes are accepted while
//!   offline and acknowledged later; reads arrive as snapshots annotated with
//!   per-document pending-write flags and per-snapshot provenance.
//! - Brand-specific REST APIs accepting JSON POSTs.
//!
//! Both are consumed through the traits here so the engine can be exercised
//! against [`MemoryDocumentStore`] and scripted endpoints.

mod http;
mod memory;

pub use http::{HttpBrandClient, HttpDocumentStore};
pub use memory::MemoryDocumentStore;

use crate::error::RemoteError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Root collection of primary (event) records
pub const PRIMARY_ROOT: &str = "events";
/// Root collection of linked (activation) records
pub const LINKED_ROOT: &str = "activations";
/// Sub-collection holding survey responses under either root
pub const RESPONSES_SUBCOLLECTION: &str = "surveys";

/// Response sub-collection of a primary record
pub fn primary_collection(primary_id: &str) -> String {
    format!("{}/{}/{}", PRIMARY_ROOT, primary_id, RESPONSES_SUBCOLLECTION)
}

/// Response sub-collection of a linked record
pub fn linked_collection(linked_id: &str) -> String {
    format!("{}/{}/{}", LINKED_ROOT, linked_id, RESPONSES_SUBCOLLECTION)
}

/// Per-document metadata carried by a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMeta {
    pub id: String,
    /// Written locally but not yet acknowledged by the server
    pub has_pending_writes: bool,
}

/// A read of one collection
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub collection: String,
    /// Served from the local cache rather than confirmed by the server
    pub from_cache: bool,
    pub documents: Vec<DocumentMeta>,
}

impl Snapshot {
    /// Documents not yet acknowledged by the server
    pub fn pending_count(&self) -> usize {
        self.documents
            .iter()
            .filter(|doc| doc.has_pending_writes)
            .count()
    }
}

/// Snapshot stream item; an error ends the server-confirmed state
pub type SnapshotResult = std::result::Result<Snapshot, RemoteError>;

/// An active subscription: the snapshot stream plus its cancel handle.
pub struct Watch {
    pub snapshots: mpsc::UnboundedReceiver<SnapshotResult>,
    pub handle: WatchHandle,
}

/// Cancels a subscription when `cancel` is called or the handle is dropped.
pub struct WatchHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchHandle {
    pub fn new<F: FnOnce() + Send + 'static>(cancel: F) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Remote document store contract
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Upsert `document` at `collection/id`. Accepted even while offline;
    /// the store's own local layer owns durability until acknowledged.
    async fn write(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> std::result::Result<(), RemoteError>;

    /// Subscribe to snapshots of `collection`. Must be called from within a
    /// Tokio runtime.
    fn watch(&self, collection: &str) -> Watch;
}

/// Minimal JSON POST transport used by brand endpoint handlers
#[async_trait]
pub trait JsonPost: Send + Sync {
    /// POST `body` to `path` relative to the endpoint base URL
    async fn post_json(&self, path: &str, body: &Value) -> std::result::Result<(), RemoteError>;
}
