//! Typed queue payloads
//!
//! Every queue item carries one [`QueuePayload`], serialized as JSON tagged
//! by `kind`. Payloads are validated before anything is written so a stored
//! item is always deliverable in shape.

use crate::error::{Error, Result};
use crate::types::{Brand, EndpointKind, LocalResponse, ParentMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Answer key holding brand A's related records
pub const RELATED_KEY: &str = "related";

/// Document written to the primary store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryStorePayload {
    pub response_id: String,
    pub parent_id: String,
    pub brand: Brand,
    pub data: Value,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandAPayload {
    pub response_id: String,
    pub event_id: String,
    pub answers: Value,
    /// Posted after the main record, only when non-empty
    #[serde(default)]
    pub related: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandBPayload {
    pub response_id: String,
    pub event_id: String,
    pub answers: Value,
}

/// Outbound work for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    PrimaryStore(PrimaryStorePayload),
    BrandA(BrandAPayload),
    BrandB(BrandBPayload),
}

impl QueuePayload {
    /// Build the payload `kind` needs for `response`.
    pub fn for_endpoint(kind: EndpointKind, response: &LocalResponse, parent: &ParentMeta) -> Self {
        match kind {
            EndpointKind::PrimaryStore => QueuePayload::PrimaryStore(PrimaryStorePayload {
                response_id: response.id.clone(),
                parent_id: parent.id.clone(),
                brand: parent.brand,
                data: response.data.clone(),
                submitted_at: response.created_at,
            }),
            EndpointKind::BrandA => {
                let mut answers = response.data.clone();
                let related = match answers.as_object_mut().and_then(|o| o.remove(RELATED_KEY)) {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                QueuePayload::BrandA(BrandAPayload {
                    response_id: response.id.clone(),
                    event_id: parent.brand_event_id().to_string(),
                    answers,
                    related,
                })
            }
            EndpointKind::BrandB => QueuePayload::BrandB(BrandBPayload {
                response_id: response.id.clone(),
                event_id: parent.brand_event_id().to_string(),
                answers: response.data.clone(),
            }),
        }
    }

    pub fn kind(&self) -> EndpointKind {
        match self {
            QueuePayload::PrimaryStore(_) => EndpointKind::PrimaryStore,
            QueuePayload::BrandA(_) => EndpointKind::BrandA,
            QueuePayload::BrandB(_) => EndpointKind::BrandB,
        }
    }

    pub fn response_id(&self) -> &str {
        match self {
            QueuePayload::PrimaryStore(p) => &p.response_id,
            QueuePayload::BrandA(p) => &p.response_id,
            QueuePayload::BrandB(p) => &p.response_id,
        }
    }

    /// Check the shape every endpoint relies on.
    pub fn validate(&self) -> Result<()> {
        let require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(Error::InvalidPayload(format!(
                    "{} payload has empty {}",
                    self.kind(),
                    field
                )))
            } else {
                Ok(())
            }
        };

        require("response_id", self.response_id())?;
        match self {
            QueuePayload::PrimaryStore(p) => {
                require("parent_id", &p.parent_id)?;
                if !p.data.is_object() {
                    return Err(Error::InvalidPayload(
                        "response data must be a JSON object".to_string(),
                    ));
                }
            }
            QueuePayload::BrandA(p) => require("event_id", &p.event_id)?,
            QueuePayload::BrandB(p) => require("event_id", &p.event_id)?,
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored payload. Any failure is an invalid payload, which the
    /// processor treats as permanent.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::InvalidPayload(format!("undecodable queue payload: {}", e)))
    }
}
