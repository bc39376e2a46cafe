//! Database repository layer
//!
//! Typed CRUD over the three record kinds. This is the only layer that
//! issues SQL; retry and network policy live in [`crate::sync`].

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(row.as_ref().column_index(column).unwrap_or(0), e))
}

fn parse_opt_ts(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(row.as_ref().column_index(column).unwrap_or(0), e))
    })
    .transpose()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(row: &Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(row.as_ref().column_index(column).unwrap_or(0), e))
}

#[cfg(feature = "sqlcipher")]
fn apply_encryption_key(conn: &Connection, key: &str) -> Result<()> {
    conn.pragma_update(None, "key", key)?;
    Ok(())
}

#[cfg(not(feature = "sqlcipher"))]
fn apply_encryption_key(_conn: &Connection, _key: &str) -> Result<()> {
    Err(Error::Config(
        "store.encryption_key requires kiosync-core to be built with the `sqlcipher` feature"
            .to_string(),
    ))
}

impl Database {
    /// Open or create a database at the given path
    ///
    /// When `encryption_key` is set it is applied before any other statement.
    pub fn open(path: &Path, encryption_key: Option<&str>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        if let Some(key) = encryption_key {
            apply_encryption_key(&conn, key)?;
        }

        // Enable foreign keys and WAL mode for durability across app kills
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        tracing::debug!(path = %path.display(), encrypted = encryption_key.is_some(), "Opened store");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::LockPoisoned("database connection"))
    }

    /// Run all pending migrations.
    ///
    /// Fails with [`Error::SchemaMigration`] if any migration fails; callers
    /// must not continue with the store in that case.
    pub fn initialize(&self) -> Result<()> {
        let mut conn = self.conn()?;
        super::schema::run_migrations(&mut conn)
    }

    /// Health check: true if all core tables exist. Never fails.
    pub fn is_initialized(&self) -> bool {
        let Ok(conn) = self.conn() else {
            return false;
        };
        super::schema::core_tables_exist(&conn).unwrap_or(false)
    }

    /// Highest applied migration version
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn()?;
        super::schema::get_schema_version(&conn)
    }

    /// Run `f` inside a transaction: committed on `Ok`, rolled back on `Err`.
    ///
    /// The connection lock is held for the duration, so `f` must only use the
    /// transaction it is given, never other `Database` methods.
    pub fn run_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::error!(error = %rollback_err, "Transaction rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Delete every definition, response and queue item in one transaction
    pub fn clear_all_data(&self) -> Result<()> {
        self.run_transaction(|tx| {
            tx.execute("DELETE FROM sync_queue", [])?;
            tx.execute("DELETE FROM local_responses", [])?;
            tx.execute("DELETE FROM cached_definitions", [])?;
            Ok(())
        })?;
        tracing::info!("Cleared all local data");
        Ok(())
    }

    // ============================================
    // Definition operations
    // ============================================

    /// Insert or overwrite a cached definition
    pub fn upsert_definition(
        &self,
        doc: &DefinitionDocument,
        cached_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        Self::write_definition(&conn, doc, cached_at)
    }

    /// Upsert a batch in one transaction; a failure leaves the cache as it was
    pub fn upsert_definitions(
        &self,
        docs: &[DefinitionDocument],
        cached_at: DateTime<Utc>,
    ) -> Result<usize> {
        self.run_transaction(|tx| {
            for doc in docs {
                Self::write_definition(tx, doc, cached_at)?;
            }
            Ok(docs.len())
        })
    }

    fn write_definition(
        conn: &Connection,
        doc: &DefinitionDocument,
        cached_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = ts(&Utc::now());
        conn.execute(
            r#"
            INSERT INTO cached_definitions (id, category, payload, cached_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(id) DO UPDATE SET
                category = excluded.category,
                payload = excluded.payload,
                cached_at = excluded.cached_at,
                updated_at = excluded.updated_at
            "#,
            params![
                doc.id,
                doc.category.as_str(),
                doc.payload.to_string(),
                ts(&cached_at),
                now,
            ],
        )?;
        Ok(())
    }

    /// Get a cached definition by ID
    pub fn get_definition(&self, id: &str) -> Result<Option<CachedDefinition>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, category, payload, cached_at FROM cached_definitions WHERE id = ?",
            [id],
            Self::row_to_definition,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List cached definitions, newest first, optionally by category
    pub fn list_definitions(&self, category: Option<Brand>) -> Result<Vec<CachedDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, category, payload, cached_at FROM cached_definitions
            WHERE ?1 IS NULL OR category = ?1
            ORDER BY cached_at DESC, id
            "#,
        )?;
        let rows = stmt
            .query_map([category.map(|c| c.as_str())], Self::row_to_definition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Most recent `cached_at` across all definitions
    pub fn newest_definition_cached_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let raw: Option<String> =
            conn.query_row("SELECT MAX(cached_at) FROM cached_definitions", [], |r| {
                r.get(0)
            })?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Database(conversion_error(0, e)))
        })
        .transpose()
    }

    /// Remove all cached definitions; returns the number removed
    pub fn clear_definitions(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM cached_definitions", [])?)
    }

    fn row_to_definition(row: &Row) -> rusqlite::Result<CachedDefinition> {
        Ok(CachedDefinition {
            id: row.get("id")?,
            category: parse_enum(row, "category")?,
            payload: row.get("payload")?,
            cached_at: parse_ts(row, "cached_at")?,
        })
    }

    // ============================================
    // Response operations
    // ============================================

    /// Insert a new local response
    pub fn create_response(&self, response: &LocalResponse) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_response(&conn, response)
    }

    /// Insert a response and its queue items atomically: either all rows
    /// exist afterwards or none do.
    pub fn create_response_with_queue(
        &self,
        response: &LocalResponse,
        items: &[SyncQueueItem],
    ) -> Result<()> {
        self.run_transaction(|tx| {
            Self::insert_response(tx, response)?;
            for item in items {
                Self::insert_queue_item(tx, item)?;
            }
            Ok(())
        })
    }

    fn insert_response(conn: &Connection, response: &LocalResponse) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO local_responses (id, parent_id, data, sync_status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                response.id,
                response.parent_id,
                response.data.to_string(),
                response.sync_status.as_str(),
                ts(&response.created_at),
                ts(&response.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Get a response by ID
    pub fn get_response(&self, id: &str) -> Result<Option<LocalResponse>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, parent_id, data, sync_status, created_at, updated_at
             FROM local_responses WHERE id = ?",
            [id],
            Self::row_to_response,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List responses, oldest first, optionally filtered by status
    pub fn list_responses(&self, status: Option<SyncStatus>) -> Result<Vec<LocalResponse>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, parent_id, data, sync_status, created_at, updated_at
            FROM local_responses
            WHERE ?1 IS NULL OR sync_status = ?1
            ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt
            .query_map([status.map(|s| s.as_str())], Self::row_to_response)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Set the sync status of a response
    pub fn update_response_status(&self, id: &str, status: SyncStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE local_responses SET sync_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts(&Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound {
                kind: "response",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn row_to_response(row: &Row) -> rusqlite::Result<LocalResponse> {
        let data: String = row.get("data")?;
        Ok(LocalResponse {
            id: row.get("id")?,
            parent_id: row.get("parent_id")?,
            data: serde_json::from_str(&data)
                .map_err(|e| conversion_error(row.as_ref().column_index("data").unwrap_or(0), e))?,
            sync_status: parse_enum(row, "sync_status")?,
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
        })
    }

    // ============================================
    // Sync queue operations
    // ============================================

    /// Append a single queue item
    pub fn enqueue_sync_item(&self, item: &SyncQueueItem) -> Result<()> {
        let conn = self.conn()?;
        Self::insert_queue_item(&conn, item)
    }

    fn insert_queue_item(conn: &Connection, item: &SyncQueueItem) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO sync_queue (id, endpoint_kind, payload, retry_count, last_attempt, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                item.id,
                item.endpoint_kind.as_str(),
                item.payload,
                item.retry_count,
                item.last_attempt.as_ref().map(ts),
                ts(&item.created_at),
            ],
        )?;
        Ok(())
    }

    /// List queue items in creation order, optionally by endpoint kind
    pub fn list_queue_items(&self, kind: Option<EndpointKind>) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, endpoint_kind, payload, retry_count, last_attempt, created_at
            FROM sync_queue
            WHERE ?1 IS NULL OR endpoint_kind = ?1
            ORDER BY created_at, id
            "#,
        )?;
        let rows = stmt
            .query_map([kind.map(|k| k.as_str())], Self::row_to_queue_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Get a queue item by ID
    pub fn get_queue_item(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, endpoint_kind, payload, retry_count, last_attempt, created_at
             FROM sync_queue WHERE id = ?",
            [id],
            Self::row_to_queue_item,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Number of queued items
    pub fn count_queue_items(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Delete a queue item; returns false if it was already gone
    pub fn delete_queue_item(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM sync_queue WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }

    /// Record an attempt: bump `retry_count` by `retry_delta` and stamp
    /// `last_attempt`.
    pub fn update_queue_item(
        &self,
        id: &str,
        retry_delta: u32,
        last_attempt: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_queue SET retry_count = retry_count + ?1, last_attempt = ?2 WHERE id = ?3",
            params![retry_delta, ts(&last_attempt), id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound {
                kind: "queue item",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Remove every queue item; returns the number removed
    pub fn clear_queue(&self) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM sync_queue", [])?)
    }

    fn row_to_queue_item(row: &Row) -> rusqlite::Result<SyncQueueItem> {
        Ok(SyncQueueItem {
            id: row.get("id")?,
            endpoint_kind: parse_enum(row, "endpoint_kind")?,
            payload: row.get("payload")?,
            retry_count: row.get("retry_count")?,
            last_attempt: parse_opt_ts(row, "last_attempt")?,
            created_at: parse_ts(row, "created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn response(id: &str) -> LocalResponse {
        let now = Utc::now();
        LocalResponse {
            id: id.to_string(),
            parent_id: "evt-1".to_string(),
            data: json!({"q1": "yes"}),
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn queue_item(id: &str, kind: EndpointKind) -> SyncQueueItem {
        SyncQueueItem {
            id: id.to_string(),
            endpoint_kind: kind,
            payload: "{}".to_string(),
            retry_count: 0,
            last_attempt: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_is_initialized() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_initialized());
        db.initialize().unwrap();
        assert!(db.is_initialized());
        assert_eq!(db.schema_version().unwrap(), crate::db::schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_definition_upsert_overwrites() {
        let db = test_db();
        let mut doc = DefinitionDocument {
            id: "evt-1".to_string(),
            category: Brand::BrandA,
            payload: json!({"name": "Spring Show"}),
        };
        db.upsert_definition(&doc, Utc::now()).unwrap();
        doc.payload = json!({"name": "Spring Show 2"});
        db.upsert_definition(&doc, Utc::now()).unwrap();

        let all = db.list_definitions(None).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].payload.contains("Spring Show 2"));
    }

    #[test]
    fn test_list_definitions_by_category() {
        let db = test_db();
        for (id, brand) in [("a", Brand::BrandA), ("b", Brand::BrandB), ("c", Brand::BrandA)] {
            db.upsert_definition(
                &DefinitionDocument {
                    id: id.to_string(),
                    category: brand,
                    payload: json!({}),
                },
                Utc::now(),
            )
            .unwrap();
        }

        assert_eq!(db.list_definitions(Some(Brand::BrandA)).unwrap().len(), 2);
        assert_eq!(db.list_definitions(Some(Brand::BrandB)).unwrap().len(), 1);
        assert_eq!(db.list_definitions(Some(Brand::Other)).unwrap().len(), 0);
        assert_eq!(db.list_definitions(None).unwrap().len(), 3);
        assert!(db.get_definition("b").unwrap().is_some());
    }

    #[test]
    fn test_definition_batch_is_atomic() {
        let db = test_db();
        db.conn()
            .unwrap()
            .execute_batch(
                r#"
                CREATE TRIGGER reject_bad_definition BEFORE INSERT ON cached_definitions
                WHEN NEW.id = 'bad'
                BEGIN SELECT RAISE(ABORT, 'rejected'); END;
                "#,
            )
            .unwrap();

        let doc = |id: &str| DefinitionDocument {
            id: id.to_string(),
            category: Brand::BrandA,
            payload: json!({}),
        };
        let result = db.upsert_definitions(&[doc("a"), doc("bad"), doc("c")], Utc::now());
        assert!(result.is_err());
        assert_eq!(db.list_definitions(None).unwrap().len(), 0);

        assert_eq!(
            db.upsert_definitions(&[doc("a"), doc("c")], Utc::now()).unwrap(),
            2
        );
        assert_eq!(db.list_definitions(None).unwrap().len(), 2);
    }

    #[test]
    fn test_response_status_update() {
        let db = test_db();
        db.create_response(&response("r1")).unwrap();
        db.update_response_status("r1", SyncStatus::Synced).unwrap();

        let stored = db.get_response("r1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.data, json!({"q1": "yes"}));
        assert_eq!(db.list_responses(Some(SyncStatus::Synced)).unwrap().len(), 1);
        assert_eq!(db.list_responses(Some(SyncStatus::Pending)).unwrap().len(), 0);

        assert!(matches!(
            db.update_response_status("missing", SyncStatus::Failed),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_response_with_queue_is_atomic() {
        let db = test_db();
        // Duplicate item ids make the second insert fail inside the transaction
        let items = vec![
            queue_item("dup", EndpointKind::PrimaryStore),
            queue_item("dup", EndpointKind::BrandA),
        ];
        assert!(db.create_response_with_queue(&response("r1"), &items).is_err());

        assert!(db.get_response("r1").unwrap().is_none());
        assert_eq!(db.count_queue_items().unwrap(), 0);

        let items = vec![
            queue_item("i1", EndpointKind::PrimaryStore),
            queue_item("i2", EndpointKind::BrandA),
        ];
        db.create_response_with_queue(&response("r1"), &items).unwrap();
        assert!(db.get_response("r1").unwrap().is_some());
        assert_eq!(db.count_queue_items().unwrap(), 2);
    }

    #[test]
    fn test_queue_item_lifecycle() {
        let db = test_db();
        db.enqueue_sync_item(&queue_item("i1", EndpointKind::PrimaryStore))
            .unwrap();
        db.enqueue_sync_item(&queue_item("i2", EndpointKind::BrandB))
            .unwrap();

        assert_eq!(
            db.list_queue_items(Some(EndpointKind::BrandB)).unwrap().len(),
            1
        );

        let attempt = Utc::now();
        db.update_queue_item("i1", 1, attempt).unwrap();
        let item = db.get_queue_item("i1").unwrap().unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(
            item.last_attempt.unwrap().timestamp_micros(),
            attempt.timestamp_micros()
        );

        assert!(db.delete_queue_item("i1").unwrap());
        assert!(!db.delete_queue_item("i1").unwrap());
        assert_eq!(db.clear_queue().unwrap(), 1);
        assert_eq!(db.count_queue_items().unwrap(), 0);
    }

    #[test]
    fn test_run_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<()> = db.run_transaction(|tx| {
            tx.execute(
                "INSERT INTO sync_queue (id, endpoint_kind, payload, retry_count, created_at)
                 VALUES ('x', 'brand_a', '{}', 0, '2026-01-01T00:00:00.000000Z')",
                [],
            )?;
            Err(Error::InvalidPayload("abort".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.count_queue_items().unwrap(), 0);
    }

    #[test]
    fn test_clear_all_data() {
        let db = test_db();
        db.create_response_with_queue(
            &response("r1"),
            &[queue_item("i1", EndpointKind::PrimaryStore)],
        )
        .unwrap();
        db.upsert_definition(
            &DefinitionDocument {
                id: "evt-1".to_string(),
                category: Brand::Other,
                payload: json!({}),
            },
            Utc::now(),
        )
        .unwrap();

        db.clear_all_data().unwrap();
        assert_eq!(db.count_queue_items().unwrap(), 0);
        assert!(db.list_responses(None).unwrap().is_empty());
        assert!(db.newest_definition_cached_at().unwrap().is_none());
    }
}
