//! Definition cache
//!
//! Remote event definitions are cached in the store so the kiosk can render
//! without a network. Staleness is advisory: callers serve cached data
//! immediately and refresh in the background when online.

use crate::connectivity::ConnectivityMonitor;
use crate::db::Database;
use crate::error::Result;
use crate::types::{Brand, CachedDefinition, DefinitionDocument};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Top-level fields parsed into dates on read
const DATE_FIELDS: &[&str] = &["startDate", "endDate", "createdAt", "updatedAt"];

/// A cached definition with its sub-fields rehydrated.
#[derive(Debug, Clone)]
pub struct Definition {
    pub id: String,
    pub category: Brand,
    pub cached_at: DateTime<Utc>,
    /// Date fields that parsed as RFC 3339
    pub dates: BTreeMap<String, DateTime<Utc>>,
    /// Document with JSON-in-string fields expanded
    pub document: Value,
}

/// Cache of remote definitions backed by the store
pub struct DefinitionCache {
    db: Arc<Database>,
    max_age: Duration,
}

impl DefinitionCache {
    pub fn new(db: Arc<Database>, max_age: Duration) -> Self {
        Self { db, max_age }
    }

    /// Default staleness threshold
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Upsert a freshly fetched definition
    pub fn cache_definition(&self, doc: &DefinitionDocument) -> Result<()> {
        self.db.upsert_definition(doc, Utc::now())?;
        tracing::debug!(id = %doc.id, category = %doc.category, "Cached definition");
        Ok(())
    }

    /// Cache a batch of definitions from one fetch
    pub fn cache_all(&self, docs: &[DefinitionDocument]) -> Result<usize> {
        let count = self.db.upsert_definitions(docs, Utc::now())?;
        tracing::info!(count, "Cached definitions");
        Ok(count)
    }

    /// Hydrated definitions, newest first, optionally by category
    pub fn list(&self, category: Option<Brand>) -> Result<Vec<Definition>> {
        let rows = self.db.list_definitions(category)?;
        Ok(rows.into_iter().map(hydrate).collect())
    }

    /// A single hydrated definition
    pub fn get(&self, id: &str) -> Result<Option<Definition>> {
        Ok(self.db.get_definition(id)?.map(hydrate))
    }

    /// True if the cache is empty or its newest entry is older than `max_age`
    pub fn is_stale(&self, max_age: Duration) -> Result<bool> {
        self.is_stale_at(max_age, Utc::now())
    }

    /// [`Self::is_stale`] evaluated at `now`
    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> Result<bool> {
        let Some(newest) = self.db.newest_definition_cached_at()? else {
            return Ok(true);
        };
        let age = now.signed_duration_since(newest);
        // A max age too large to represent never expires
        Ok(chrono::Duration::from_std(max_age)
            .map(|max_age| age > max_age)
            .unwrap_or(false))
    }

    /// Stale against the configured max age and online, so a background
    /// refresh is worth attempting.
    pub fn needs_refresh(&self, monitor: &ConnectivityMonitor) -> Result<bool> {
        Ok(monitor.is_online() && self.is_stale(self.max_age)?)
    }

    /// Drop every cached definition
    pub fn clear_cache(&self) -> Result<()> {
        let removed = self.db.clear_definitions()?;
        tracing::info!(removed, "Cleared definition cache");
        Ok(())
    }
}

/// Parse a cached row into a [`Definition`]. Unparseable sub-fields keep
/// their raw string form.
fn hydrate(row: CachedDefinition) -> Definition {
    let mut document = match serde_json::from_str::<Value>(&row.payload) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(id = %row.id, error = %e, "Cached payload is not valid JSON");
            Value::String(row.payload.clone())
        }
    };

    let mut dates = BTreeMap::new();
    if let Value::Object(fields) = &mut document {
        for (key, value) in fields.iter_mut() {
            let expanded = match &*value {
                Value::String(raw) if DATE_FIELDS.contains(&key.as_str()) => {
                    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                        dates.insert(key.clone(), parsed.with_timezone(&Utc));
                    }
                    None
                }
                Value::String(raw) if looks_like_json(raw) => {
                    serde_json::from_str::<Value>(raw).ok()
                }
                _ => None,
            };
            if let Some(parsed) = expanded {
                *value = parsed;
            }
        }
    }

    Definition {
        id: row.id,
        category: row.category,
        cached_at: row.cached_at,
        dates,
        document,
    }
}

fn looks_like_json(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}
