//! HTTP adapters for the brand APIs and the remote document store

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{DocumentMeta, DocumentStore, JsonPost, Snapshot, Watch, WatchHandle};
use crate::error::{Error, RemoteError, Result};

fn build_client(api_key: Option<&str>, timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(api_key) = api_key {
        let auth_value = format!("Bearer {}", api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
        );
    }

    reqwest::Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))
}

/// Turn a non-success response into [`RemoteError::Status`]
async fn check_status(
    response: reqwest::Response,
) -> std::result::Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(RemoteError::Status {
        code: status.as_u16(),
        body,
    })
}

/// Encode each path segment, keeping the separators
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// JSON client for one brand API
pub struct HttpBrandClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpBrandClient {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: build_client(api_key, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl JsonPost for HttpBrandClient {
    async fn post_json(&self, path: &str, body: &Value) -> std::result::Result<(), RemoteError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(RemoteError::from)?;

        check_status(response).await?;
        tracing::debug!(url = %url, "Brand API accepted request");
        Ok(())
    }
}

/// Entry returned by `GET /documents/{collection}`
#[derive(Debug, Deserialize)]
struct RemoteDocument {
    id: String,
}

/// Document store reached over HTTP.
///
/// Writes are `PUT {base}/documents/{collection}/{id}`, so re-delivery
/// overwrites. Watches poll the collection; every successful poll is a
/// server-confirmed snapshot with no pending writes.
pub struct HttpDocumentStore {
    http_client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl HttpDocumentStore {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http_client: build_client(api_key, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/documents/{}", self.base_url, encode_path(collection))
    }

    async fn fetch(
        client: &reqwest::Client,
        url: &str,
        collection: &str,
    ) -> std::result::Result<Snapshot, RemoteError> {
        let response = client.get(url).send().await.map_err(RemoteError::from)?;
        let response = check_status(response).await?;
        let documents: Vec<RemoteDocument> = response
            .json()
            .await
            .map_err(|e| RemoteError::Network(format!("failed to parse response: {}", e)))?;
        Ok(Snapshot {
            collection: collection.to_string(),
            from_cache: false,
            documents: documents
                .into_iter()
                .map(|doc| DocumentMeta {
                    id: doc.id,
                    has_pending_writes: false,
                })
                .collect(),
        })
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn write(
        &self,
        collection: &str,
        id: &str,
        document: &Value,
    ) -> std::result::Result<(), RemoteError> {
        let url = format!(
            "{}/{}",
            self.collection_url(collection),
            urlencoding::encode(id)
        );

        let response = self
            .http_client
            .put(&url)
            .json(document)
            .send()
            .await
            .map_err(RemoteError::from)?;

        check_status(response).await?;
        Ok(())
    }

    fn watch(&self, collection: &str) -> Watch {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.http_client.clone();
        let url = self.collection_url(collection);
        let collection = collection.to_string();
        let poll_interval = self.poll_interval;

        let task = tokio::spawn(async move {
            loop {
                let result = Self::fetch(&client, &url, &collection).await;
                if let Err(e) = &result {
                    tracing::debug!(collection = %collection, error = %e, "Document poll failed");
                }
                if tx.send(result).is_err() {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        Watch {
            snapshots: rx,
            handle: WatchHandle::new(move || task.abort()),
        }
    }
}
