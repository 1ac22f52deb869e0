//! Schema bootstrap for the scan state tables
//!
//! Tables are created idempotently at startup. The run history is not stored
//! here; it lives in the filesystem under the run logger's directory.

use sqlx::SqlitePool;
use tracing::{debug, info};

/// Result of a schema sync operation
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_created: Vec<String>,
}

const TABLES: &[(&str, &str)] = &[
    (
        "subscriptions",
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            source_id TEXT PRIMARY KEY NOT NULL,
            nickname TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            auto_download INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "source_progress",
        r#"
        CREATE TABLE IF NOT EXISTS source_progress (
            source_id TEXT PRIMARY KEY NOT NULL,
            last_seen_item_time INTEGER NOT NULL DEFAULT 0,
            last_seen_item_id TEXT,
            last_scan_time INTEGER NOT NULL DEFAULT 0,
            scan_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
    (
        "downloaded_items",
        r#"
        CREATE TABLE IF NOT EXISTS downloaded_items (
            item_id TEXT PRIMARY KEY NOT NULL,
            source_id TEXT NOT NULL,
            downloaded_at INTEGER NOT NULL,
            save_path TEXT
        )
        "#,
    ),
    (
        "scan_rounds",
        r#"
        CREATE TABLE IF NOT EXISTS scan_rounds (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            round INTEGER NOT NULL DEFAULT 0,
            last_scan_time INTEGER NOT NULL DEFAULT 0
        )
        "#,
    ),
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_downloaded_items_source ON downloaded_items (source_id)",
    "CREATE INDEX IF NOT EXISTS idx_downloaded_items_time ON downloaded_items (downloaded_at)",
    "CREATE INDEX IF NOT EXISTS idx_source_progress_scan_time ON source_progress (last_scan_time)",
];

/// Check if a table exists in the database
async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

/// Create any missing tables and indexes.
pub async fn sync_schema(pool: &SqlitePool) -> Result<SchemaSyncResult, sqlx::Error> {
    let mut result = SchemaSyncResult::default();

    for (name, ddl) in TABLES {
        if !table_exists(pool, name).await? {
            sqlx::query(ddl).execute(pool).await?;
            info!(table = %name, "Created table");
            result.tables_created.push(name.to_string());
        } else {
            debug!(table = %name, "Table already present");
        }
    }

    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(result)
}
