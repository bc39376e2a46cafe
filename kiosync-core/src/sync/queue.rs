//! Response fan-out into the sync queue

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use super::payload::QueuePayload;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{LocalResponse, ParentMeta, SyncQueueItem, SyncStatus};

/// Entry point for locally authored responses
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Database>,
}

impl SyncQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist a completed survey and queue one item per endpoint its
    /// parent's brand requires. Response and items are written in one
    /// transaction; invalid input writes nothing.
    pub fn queue_user_response(&self, data: Value, parent: &ParentMeta) -> Result<LocalResponse> {
        if parent.id.trim().is_empty() {
            return Err(Error::InvalidPayload("parent id is empty".to_string()));
        }
        if !data.is_object() {
            return Err(Error::InvalidPayload(
                "response data must be a JSON object".to_string(),
            ));
        }

        let now = Utc::now();
        let response = LocalResponse {
            id: Uuid::new_v4().to_string(),
            parent_id: parent.id.clone(),
            data,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let items = parent
            .brand
            .endpoint_kinds()
            .iter()
            .map(|&kind| {
                let payload = QueuePayload::for_endpoint(kind, &response, parent);
                payload.validate()?;
                Ok(SyncQueueItem {
                    id: SyncQueueItem::compose_id(&parent.id, now, kind),
                    endpoint_kind: kind,
                    payload: payload.encode()?,
                    retry_count: 0,
                    last_attempt: None,
                    created_at: now,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.db.create_response_with_queue(&response, &items)?;

        tracing::info!(
            response_id = %response.id,
            parent_id = %parent.id,
            brand = %parent.brand,
            items = items.len(),
            "Queued response"
        );
        Ok(response)
    }

    /// Items waiting for delivery
    pub fn len(&self) -> Result<usize> {
        self.db.count_queue_items()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of the queue in processing order
    pub fn items(&self) -> Result<Vec<SyncQueueItem>> {
        self.db.list_queue_items(None)
    }
}
