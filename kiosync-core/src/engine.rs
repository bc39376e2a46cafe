//! Composition root
//!
//! [`SyncEngine`] owns one instance of every collaborator and is the API
//! the UI layer talks to. Build it once at startup and share it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::aggregator::PendingWriteAggregator;
use crate::cache::DefinitionCache;
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, TcpProbe};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::remote::{DocumentStore, HttpBrandClient, HttpDocumentStore, JsonPost};
use crate::sync::{
    EndpointHandlers, IntervalScheduler, ProcessorSettings, QueueStatus, SyncMetrics,
    SyncProcessor, SyncProgress, SyncQueue, SyncRunOutcome, SyncTriggers,
};
use crate::types::{LocalResponse, ParentMeta};

/// Remote collaborators the engine delivers to
#[derive(Clone)]
pub struct RemoteAdapters {
    pub document_store: Arc<dyn DocumentStore>,
    /// `None` leaves the endpoint unconfigured; its items are abandoned
    pub brand_a: Option<Arc<dyn JsonPost>>,
    pub brand_b: Option<Arc<dyn JsonPost>>,
}

impl RemoteAdapters {
    pub fn new(document_store: Arc<dyn DocumentStore>) -> Self {
        Self {
            document_store,
            brand_a: None,
            brand_b: None,
        }
    }

    /// HTTP adapters from `[remote]`. The document store URL is required.
    pub fn from_config(config: &Config) -> Result<Self> {
        let remote = &config.remote;
        let timeout = config.sync.request_timeout();
        let api_key = remote.api_key.as_deref();

        let url = remote.document_store_url.as_deref().ok_or_else(|| {
            Error::Config("remote.document_store_url is not set".to_string())
        })?;
        let document_store = HttpDocumentStore::new(
            url,
            api_key,
            timeout,
            Duration::from_secs(remote.watch_poll_secs),
        )?;

        let brand_client = |url: &Option<String>| -> Result<Option<Arc<dyn JsonPost>>> {
            url.as_deref()
                .map(|url| {
                    HttpBrandClient::new(url, api_key, timeout)
                        .map(|client| Arc::new(client) as Arc<dyn JsonPost>)
                })
                .transpose()
        };

        Ok(Self {
            document_store: Arc::new(document_store),
            brand_a: brand_client(&remote.brand_a_url)?,
            brand_b: brand_client(&remote.brand_b_url)?,
        })
    }

    fn handlers(&self) -> EndpointHandlers {
        let mut handlers = EndpointHandlers::primary_only(Arc::clone(&self.document_store));
        if let Some(client) = &self.brand_a {
            handlers = handlers.with_brand_a(Arc::clone(client));
        } else {
            tracing::warn!("Brand A endpoint not configured; its items will be abandoned");
        }
        if let Some(client) = &self.brand_b {
            handlers = handlers.with_brand_b(Arc::clone(client));
        } else {
            tracing::warn!("Brand B endpoint not configured; its items will be abandoned");
        }
        handlers
    }
}

pub struct SyncEngine {
    config: Config,
    db: Arc<Database>,
    monitor: ConnectivityMonitor,
    queue: SyncQueue,
    processor: Arc<SyncProcessor>,
    cache: DefinitionCache,
    aggregator: PendingWriteAggregator,
}

impl SyncEngine {
    /// Wire an engine around an already initialized store.
    pub fn new(
        config: Config,
        db: Arc<Database>,
        monitor: ConnectivityMonitor,
        remote: RemoteAdapters,
    ) -> Self {
        let processor = SyncProcessor::new(
            Arc::clone(&db),
            monitor.clone(),
            remote.handlers(),
            ProcessorSettings::from(&config.sync),
        );
        Self {
            queue: SyncQueue::new(Arc::clone(&db)),
            cache: DefinitionCache::new(Arc::clone(&db), config.cache.max_age()),
            aggregator: PendingWriteAggregator::new(Arc::clone(&remote.document_store)),
            processor: Arc::new(processor),
            monitor,
            db,
            config,
        }
    }

    /// Open and migrate the configured store, then wire the engine.
    pub fn open(config: Config, remote: RemoteAdapters) -> Result<Self> {
        let db = Database::open(&config.database_path(), config.store.encryption_key.as_deref())?;
        db.initialize()?;
        let monitor = ConnectivityMonitor::new(config.sync.wifi_only);
        Ok(Self::new(config, Arc::new(db), monitor, remote))
    }

    /// Persist and queue a completed survey. When sync-eligible and running
    /// inside a Tokio runtime, a sync run is started in the background.
    pub fn queue_user_response(&self, data: Value, parent: &ParentMeta) -> Result<LocalResponse> {
        let response = self.queue.queue_user_response(data, parent)?;

        if self.monitor.is_sync_eligible() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let processor = Arc::clone(&self.processor);
                runtime.spawn(async move {
                    if let Err(e) = processor.start_sync().await {
                        tracing::warn!(error = %e, "Immediate sync failed");
                    }
                });
            }
        }
        Ok(response)
    }

    pub async fn start_sync(&self) -> Result<SyncRunOutcome> {
        self.processor.start_sync().await
    }

    pub fn get_sync_status(&self) -> Result<QueueStatus> {
        self.processor.get_sync_status()
    }

    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.processor.set_progress_callback(callback);
    }

    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncMetrics) + Send + Sync + 'static,
    {
        self.processor.set_completion_callback(callback);
    }

    pub fn clear_queue(&self) -> Result<usize> {
        self.processor.clear_queue()
    }

    /// Start reconnect and interval triggers using `[sync] interval_secs`.
    pub fn spawn_triggers(&self) -> SyncTriggers {
        SyncTriggers::spawn(
            Arc::clone(&self.processor),
            &self.monitor,
            IntervalScheduler::new(self.config.sync.interval()),
        )
    }

    /// Feed the monitor from a TCP reachability probe using `[connectivity]`.
    pub fn attach_probe(&self) -> JoinHandle<()> {
        self.monitor
            .attach(TcpProbe::from_config(&self.config.connectivity))
    }

    /// Start the triggers, then the probe. The reconnect listener has to be
    /// in place before the first probe result lands or that transition is
    /// missed until the next interval tick.
    pub fn start_background(&self) -> (SyncTriggers, JoinHandle<()>) {
        let triggers = self.spawn_triggers();
        let probe = self.attach_probe();
        (triggers, probe)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    pub fn cache(&self) -> &DefinitionCache {
        &self.cache
    }

    pub fn aggregator(&self) -> &PendingWriteAggregator {
        &self.aggregator
    }
}
