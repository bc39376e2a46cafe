//! Core domain types for kiosync
//!
//! These types mirror the rows held by the embedded store and the metadata
//! passed in from the UI layer.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Definition** | A remotely authored record (an event configuration) cached for offline display |
//! | **Response** | A locally authored record (a completed survey) awaiting durable remote storage |
//! | **Queue item** | One unit of outbound work targeting one remote endpoint, derived from a Response |
//! | **Endpoint kind** | Which remote system a queue item targets |
//! | **Brand** | Categorical attribute of an event deciding which brand systems receive its responses |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Brand / EndpointKind
// ============================================

/// Brand of an event; also the category of a cached definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Brand {
    /// No brand-specific system receives responses
    Other,
    BrandA,
    BrandB,
    /// Jointly branded events report to both brand systems
    CoBranded,
}

impl Brand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Brand::Other => "other",
            Brand::BrandA => "brand_a",
            Brand::BrandB => "brand_b",
            Brand::CoBranded => "co_branded",
        }
    }

    /// Remote endpoints that must receive a response to an event of this
    /// brand. The primary store always comes first.
    pub fn endpoint_kinds(&self) -> &'static [EndpointKind] {
        match self {
            Brand::Other => &[EndpointKind::PrimaryStore],
            Brand::BrandA => &[EndpointKind::PrimaryStore, EndpointKind::BrandA],
            Brand::BrandB => &[EndpointKind::PrimaryStore, EndpointKind::BrandB],
            Brand::CoBranded => &[
                EndpointKind::PrimaryStore,
                EndpointKind::BrandA,
                EndpointKind::BrandB,
            ],
        }
    }
}

impl std::fmt::Display for Brand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Brand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "other" => Ok(Brand::Other),
            "brand_a" => Ok(Brand::BrandA),
            "brand_b" => Ok(Brand::BrandB),
            "co_branded" => Ok(Brand::CoBranded),
            _ => Err(format!("unknown brand: {}", s)),
        }
    }
}

/// Remote system targeted by a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Durable cloud document store
    PrimaryStore,
    BrandA,
    BrandB,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::PrimaryStore => "primary_store",
            EndpointKind::BrandA => "brand_a",
            EndpointKind::BrandB => "brand_b",
        }
    }

    /// Suffix appended to queue item ids so one response can have an item
    /// per endpoint.
    pub fn id_suffix(&self) -> &'static str {
        match self {
            EndpointKind::PrimaryStore => "primary",
            EndpointKind::BrandA => "brand-a",
            EndpointKind::BrandB => "brand-b",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EndpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary_store" => Ok(EndpointKind::PrimaryStore),
            "brand_a" => Ok(EndpointKind::BrandA),
            "brand_b" => Ok(EndpointKind::BrandB),
            _ => Err(format!("unknown endpoint kind: {}", s)),
        }
    }
}

// ============================================
// Definitions
// ============================================

/// A definition document as fetched from the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionDocument {
    /// Remote-assigned id
    pub id: String,
    pub category: Brand,
    /// Opaque document body
    pub payload: serde_json::Value,
}

/// A row of `cached_definitions`, payload still serialized.
#[derive(Debug, Clone)]
pub struct CachedDefinition {
    pub id: String,
    pub category: Brand,
    pub payload: String,
    pub cached_at: DateTime<Utc>,
}

// ============================================
// Responses
// ============================================

/// Remote delivery status of a local response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(format!("unknown sync status: {}", s)),
        }
    }
}

/// A completed survey session, stored locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalResponse {
    /// Client-generated UUID, reused as the remote document key
    pub id: String,
    /// Definition (event) this response answers
    pub parent_id: String,
    /// Answer set
    pub data: serde_json::Value,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata about the parent event supplied by the UI with each response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentMeta {
    pub id: String,
    pub brand: Brand,
    /// Identifier the brand systems know the event by; defaults to `id`
    #[serde(default)]
    pub event_id: Option<String>,
}

impl ParentMeta {
    pub fn new(id: impl Into<String>, brand: Brand) -> Self {
        Self {
            id: id.into(),
            brand,
            event_id: None,
        }
    }

    pub fn brand_event_id(&self) -> &str {
        self.event_id.as_deref().unwrap_or(&self.id)
    }
}

// ============================================
// Sync queue
// ============================================

/// A row of `sync_queue`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    /// `{parent_id}-{timestamp_micros}-{endpoint suffix}`
    pub id: String,
    pub endpoint_kind: EndpointKind,
    /// Serialized [`crate::sync::QueuePayload`]
    pub payload: String,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SyncQueueItem {
    /// Compose a queue item id for one endpoint of a response.
    pub fn compose_id(parent_id: &str, at: DateTime<Utc>, kind: EndpointKind) -> String {
        format!("{}-{}-{}", parent_id, at.timestamp_micros(), kind.id_suffix())
    }
}
