//! Database schema and migrations
//!
//! Migrations are applied in version order, each inside its own transaction
//! together with its row in the `migrations` ledger. A failure rolls the
//! transaction back and surfaces [`Error::SchemaMigration`].

use crate::error::{Error, Result};
use rusqlite::{params, Connection};
use std::collections::HashSet;

/// A versioned schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Current schema version
pub const SCHEMA_VERSION: i64 = 2;

/// Tables that must exist for the store to be usable
pub const CORE_TABLES: [&str; 3] = ["cached_definitions", "local_responses", "sync_queue"];

const LEDGER_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    version          INTEGER PRIMARY KEY,
    name             TEXT NOT NULL,
    applied_at       DATETIME NOT NULL
);
"#;

/// SQL migrations, in version order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_core_tables",
        sql: r#"
        -- Remote definitions cached for offline display
        CREATE TABLE IF NOT EXISTS cached_definitions (
            id               TEXT PRIMARY KEY,
            category         TEXT NOT NULL,
            payload          TEXT NOT NULL,
            cached_at        DATETIME NOT NULL,
            created_at       DATETIME NOT NULL,
            updated_at       DATETIME NOT NULL
        );

        -- Locally authored responses; id doubles as the remote document key
        CREATE TABLE IF NOT EXISTS local_responses (
            id               TEXT PRIMARY KEY,
            parent_id        TEXT NOT NULL,
            data             TEXT NOT NULL,
            sync_status      TEXT NOT NULL DEFAULT 'pending',
            created_at       DATETIME NOT NULL,
            updated_at       DATETIME NOT NULL
        );

        -- Outbound work, one row per (response, endpoint)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id               TEXT PRIMARY KEY,
            endpoint_kind    TEXT NOT NULL,
            payload          TEXT NOT NULL,
            retry_count      INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            last_attempt     DATETIME,
            created_at       DATETIME NOT NULL
        );
        "#,
    },
    Migration {
        version: 2,
        name: "add_lookup_indexes",
        sql: r#"
        CREATE INDEX IF NOT EXISTS idx_definitions_category ON cached_definitions(category);
        CREATE INDEX IF NOT EXISTS idx_definitions_cached_at ON cached_definitions(cached_at DESC);
        CREATE INDEX IF NOT EXISTS idx_responses_parent ON local_responses(parent_id);
        CREATE INDEX IF NOT EXISTS idx_responses_status ON local_responses(sync_status);
        CREATE INDEX IF NOT EXISTS idx_queue_kind ON sync_queue(endpoint_kind);
        CREATE INDEX IF NOT EXISTS idx_queue_created ON sync_queue(created_at, id);
        "#,
    },
];

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    apply_migrations(conn, MIGRATIONS)
}

/// Apply the given migrations that are not yet recorded in the ledger.
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<()> {
    conn.execute_batch(LEDGER_SQL)?;

    let applied: HashSet<i64> = applied_versions(conn)?.into_iter().collect();

    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);

    tracing::info!(
        applied = applied.len(),
        pending = pending.len(),
        "Checking database migrations"
    );

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Running migration"
        );
        apply_one(conn, migration).map_err(|source| {
            tracing::error!(
                version = migration.version,
                name = migration.name,
                error = %source,
                "Migration failed, rolled back"
            );
            Error::SchemaMigration {
                version: migration.version,
                name: migration.name.to_string(),
                source,
            }
        })?;
    }

    Ok(())
}

fn apply_one(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    // Dropping the transaction without commit rolls it back
    let tx = conn.transaction()?;
    tx.execute_batch(migration.sql)?;
    tx.execute(
        "INSERT OR REPLACE INTO migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
        params![
            migration.version,
            migration.name,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    tx.commit()
}

/// Versions recorded in the ledger, ascending
pub fn applied_versions(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT version FROM migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(versions)
}

/// Highest applied version, 0 for a fresh store
pub fn get_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM migrations", [], |r| r.get(0))?;
    Ok(version.unwrap_or(0))
}

/// True if every core table exists
pub fn core_tables_exist(conn: &Connection) -> rusqlite::Result<bool> {
    for table in CORE_TABLES {
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
            [table],
            |r| r.get(0),
        )?;
        if exists == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}
