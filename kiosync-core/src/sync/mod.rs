//! Outbound sync
//!
//! - [`SyncQueue`] turns a completed survey into one queue item per endpoint
//! - [`SyncProcessor`] drains the queue with retry and abandonment
//! - [`SyncTriggers`] starts runs on reconnect and on a schedule

mod handlers;
mod payload;
mod processor;
mod queue;
mod triggers;

pub use handlers::{
    BrandAHandler, BrandBHandler, EndpointHandler, EndpointHandlers, PrimaryStoreHandler,
    Unconfigured,
};
pub use payload::{BrandAPayload, BrandBPayload, PrimaryStorePayload, QueuePayload, RELATED_KEY};
pub use processor::{
    CompletionCallback, ProcessorSettings, ProgressCallback, QueueStatus, SyncMetrics,
    SyncProcessor, SyncProgress, SyncRunOutcome,
};
pub use queue::SyncQueue;
pub use triggers::{IntervalScheduler, Scheduler, SyncTriggers};
