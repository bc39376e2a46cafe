//! Endpoint handlers
//!
//! One handler per [`EndpointKind`]. Each knows how to deliver its own
//! payload type; [`EndpointHandlers::dispatch`] routes a decoded
//! [`QueuePayload`] to the right one.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::payload::{BrandAPayload, BrandBPayload, PrimaryStorePayload, QueuePayload};
use crate::error::RemoteError;
use crate::remote::{primary_collection, DocumentStore, JsonPost};
use crate::types::EndpointKind;

type DeliveryResult = std::result::Result<(), RemoteError>;

/// Delivers one payload type to its remote endpoint
#[async_trait]
pub trait EndpointHandler<P: Sync>: Send + Sync {
    async fn deliver(&self, payload: &P) -> DeliveryResult;
}

/// Writes responses into the primary document store, keyed by response id
/// so re-delivery overwrites rather than duplicates.
pub struct PrimaryStoreHandler {
    store: Arc<dyn DocumentStore>,
}

impl PrimaryStoreHandler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EndpointHandler<PrimaryStorePayload> for PrimaryStoreHandler {
    async fn deliver(&self, payload: &PrimaryStorePayload) -> DeliveryResult {
        let document = json!({
            "response_id": payload.response_id,
            "parent_id": payload.parent_id,
            "brand": payload.brand.as_str(),
            "data": payload.data,
            "submitted_at": payload.submitted_at.to_rfc3339(),
        });
        self.store
            .write(
                &primary_collection(&payload.parent_id),
                &payload.response_id,
                &document,
            )
            .await
    }
}

/// Brand A: the main record first, then its related records.
pub struct BrandAHandler {
    client: Arc<dyn JsonPost>,
}

impl BrandAHandler {
    pub fn new(client: Arc<dyn JsonPost>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointHandler<BrandAPayload> for BrandAHandler {
    async fn deliver(&self, payload: &BrandAPayload) -> DeliveryResult {
        let body = json!({
            "response_id": payload.response_id,
            "event_id": payload.event_id,
            "answers": payload.answers,
        });
        self.client.post_json("/responses", &body).await?;

        if payload.related.is_empty() {
            return Ok(());
        }
        let path = format!(
            "/responses/{}/related",
            urlencoding::encode(&payload.response_id)
        );
        self.client
            .post_json(&path, &json!({ "related": payload.related }))
            .await
    }
}

pub struct BrandBHandler {
    client: Arc<dyn JsonPost>,
}

impl BrandBHandler {
    pub fn new(client: Arc<dyn JsonPost>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EndpointHandler<BrandBPayload> for BrandBHandler {
    async fn deliver(&self, payload: &BrandBPayload) -> DeliveryResult {
        let body = json!({
            "response_id": payload.response_id,
            "event_id": payload.event_id,
            "answers": payload.answers,
        });
        self.client.post_json("/surveys", &body).await
    }
}

/// Stand-in for an endpoint with no configured URL. Always fails
/// permanently.
pub struct Unconfigured(pub EndpointKind);

#[async_trait]
impl<P: Sync + 'static> EndpointHandler<P> for Unconfigured {
    async fn deliver(&self, _payload: &P) -> DeliveryResult {
        Err(RemoteError::NotConfigured(self.0.to_string()))
    }
}

/// The full handler set, one per endpoint kind
#[derive(Clone)]
pub struct EndpointHandlers {
    pub primary_store: Arc<dyn EndpointHandler<PrimaryStorePayload>>,
    pub brand_a: Arc<dyn EndpointHandler<BrandAPayload>>,
    pub brand_b: Arc<dyn EndpointHandler<BrandBPayload>>,
}

impl EndpointHandlers {
    /// Primary store only; brand endpoints unconfigured.
    pub fn primary_only(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            primary_store: Arc::new(PrimaryStoreHandler::new(store)),
            brand_a: Arc::new(Unconfigured(EndpointKind::BrandA)),
            brand_b: Arc::new(Unconfigured(EndpointKind::BrandB)),
        }
    }

    pub fn with_brand_a(mut self, client: Arc<dyn JsonPost>) -> Self {
        self.brand_a = Arc::new(BrandAHandler::new(client));
        self
    }

    pub fn with_brand_b(mut self, client: Arc<dyn JsonPost>) -> Self {
        self.brand_b = Arc::new(BrandBHandler::new(client));
        self
    }

    pub async fn dispatch(&self, payload: &QueuePayload) -> DeliveryResult {
        match payload {
            QueuePayload::PrimaryStore(p) => self.primary_store.deliver(p).await,
            QueuePayload::BrandA(p) => self.brand_a.deliver(p).await,
            QueuePayload::BrandB(p) => self.brand_b.deliver(p).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryDocumentStore;
    use crate::types::Brand;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Records posts; fails any path listed in `fail_paths`.
    #[derive(Default)]
    struct RecordingClient {
        posts: Mutex<Vec<(String, Value)>>,
        fail_paths: Vec<String>,
    }

    #[async_trait]
    impl JsonPost for RecordingClient {
        async fn post_json(&self, path: &str, body: &Value) -> DeliveryResult {
            self.posts
                .lock()
                .unwrap()
                .push((path.to_string(), body.clone()));
            if self.fail_paths.iter().any(|p| p == path) {
                return Err(RemoteError::Status {
                    code: 503,
                    body: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    fn brand_a(related: Vec<Value>) -> BrandAPayload {
        BrandAPayload {
            response_id: "r1".to_string(),
            event_id: "e1".to_string(),
            answers: json!({"q": 1}),
            related,
        }
    }

    #[tokio::test]
    async fn test_brand_a_skips_related_when_empty() {
        let client = Arc::new(RecordingClient::default());
        let handler = BrandAHandler::new(client.clone());
        handler.deliver(&brand_a(Vec::new())).await.unwrap();

        let posts = client.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "/responses");
    }

    #[tokio::test]
    async fn test_brand_a_posts_related_second() {
        let client = Arc::new(RecordingClient::default());
        let handler = BrandAHandler::new(client.clone());
        handler
            .deliver(&brand_a(vec![json!({"name": "guest"})]))
            .await
            .unwrap();

        let posts = client.posts.lock().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[1].0, "/responses/r1/related");
        assert_eq!(posts[1].1["related"][0]["name"], "guest");
    }

    #[tokio::test]
    async fn test_brand_a_first_failure_ends_attempt() {
        let client = Arc::new(RecordingClient {
            fail_paths: vec!["/responses".to_string()],
            ..Default::default()
        });
        let handler = BrandAHandler::new(client.clone());
        let err = handler
            .deliver(&brand_a(vec![json!({"name": "guest"})]))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(client.posts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_primary_store_keys_by_response_id() {
        let store = MemoryDocumentStore::new(true);
        let handlers = EndpointHandlers::primary_only(Arc::new(store.clone()));
        let payload = QueuePayload::PrimaryStore(PrimaryStorePayload {
            response_id: "r1".to_string(),
            parent_id: "e1".to_string(),
            brand: Brand::Other,
            data: json!({"q": 1}),
            submitted_at: Utc::now(),
        });

        handlers.dispatch(&payload).await.unwrap();
        handlers.dispatch(&payload).await.unwrap();

        assert_eq!(store.document_count("events/e1/surveys"), 1);
        assert_eq!(store.get("events/e1/surveys", "r1").unwrap()["data"]["q"], 1);
    }

    #[tokio::test]
    async fn test_unconfigured_is_permanent() {
        let handlers = EndpointHandlers::primary_only(Arc::new(MemoryDocumentStore::new(true)));
        let payload = QueuePayload::BrandB(BrandBPayload {
            response_id: "r1".to_string(),
            event_id: "e1".to_string(),
            answers: json!({}),
        });
        let err = handlers.dispatch(&payload).await.unwrap_err();
        assert_eq!(err, RemoteError::NotConfigured("brand_b".to_string()));
        assert!(!err.is_retryable());
    }
}
