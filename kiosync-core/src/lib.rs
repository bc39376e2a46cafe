//! # kiosync-core
//!
//! Offline-first storage and synchronization for kiosk survey apps.
//!
//! This library provides:
//! - An embedded SQLite store with versioned migrations
//! - A definition cache so events render without a network
//! - A durable outbound queue with retry and abandonment
//! - Connectivity monitoring and automatic sync triggers
//! - Aggregation of unacknowledged remote writes for status displays
//!
//! ## Architecture
//!
//! Completed surveys are written locally first. Each one fans out into one
//! queue item per remote endpoint its event's brand requires (the primary
//! document store, plus zero, one or both brand APIs). The processor drains
//! the queue whenever the device is sync-eligible.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kiosync_core::{Brand, Config, MemoryDocumentStore, ParentMeta, RemoteAdapters, SyncEngine};
//!
//! let config = Config::load().expect("failed to load config");
//! let remote = RemoteAdapters::new(Arc::new(MemoryDocumentStore::new(false)));
//! let engine = SyncEngine::open(config, remote).expect("failed to open store");
//!
//! engine
//!     .queue_user_response(serde_json::json!({"q1": "yes"}), &ParentMeta::new("evt-1", Brand::BrandA))
//!     .expect("failed to queue response");
//! ```

// Re-export commonly used items at the crate root
pub use aggregator::{AggregateStatus, PendingWriteAggregator, MAX_LINKED_RECORDS};
pub use cache::{Definition, DefinitionCache};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, NetworkState, TcpProbe, TransportType};
pub use db::Database;
pub use engine::{RemoteAdapters, SyncEngine};
pub use error::{Error, RemoteError, Result};
pub use remote::{DocumentStore, HttpBrandClient, HttpDocumentStore, JsonPost, MemoryDocumentStore};
pub use sync::{QueueStatus, SyncMetrics, SyncProcessor, SyncProgress, SyncQueue, SyncRunOutcome};
pub use types::*;

// Public modules
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod remote;
pub mod sync;
pub mod types;
