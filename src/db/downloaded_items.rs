//! Downloaded item ledger
//!
//! Presence of a row means the item's media is complete. Absence means the
//! item is still pending, whatever the source watermark says.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::sqlite_helpers::{epoch_to_datetime, placeholders};
use crate::error::Result;

/// Bound parameters per `IN (...)` lookup
const LOOKUP_CHUNK: usize = 500;

/// One completed download
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedItemRecord {
    pub item_id: String,
    pub source_id: String,
    pub downloaded_at: DateTime<Utc>,
    pub save_path: Option<String>,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for DownloadedItemRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;
        let downloaded_at: i64 = row.try_get("downloaded_at")?;
        Ok(Self {
            item_id: row.try_get("item_id")?,
            source_id: row.try_get("source_id")?,
            downloaded_at: epoch_to_datetime(downloaded_at),
            save_path: row.try_get("save_path")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadStats {
    pub total: i64,
    pub sources: i64,
}

pub struct DownloadedItemRepository {
    pool: SqlitePool,
}

impl DownloadedItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_downloaded(&self, item_id: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM downloaded_items WHERE item_id = ?1")
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(found.is_some())
    }

    /// Ids of every downloaded item, optionally restricted to one source
    pub async fn downloaded_ids(&self, source_id: Option<&str>) -> Result<HashSet<String>> {
        let ids: Vec<String> = match source_id {
            Some(source_id) => {
                sqlx::query_scalar("SELECT item_id FROM downloaded_items WHERE source_id = ?1")
                    .bind(source_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT item_id FROM downloaded_items")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(ids.into_iter().collect())
    }

    /// Which of `item_ids` are in the ledger, under any source
    pub async fn downloaded_among(&self, item_ids: &[String]) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        for chunk in item_ids.chunks(LOOKUP_CHUNK) {
            let sql = format!(
                "SELECT item_id FROM downloaded_items WHERE item_id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query_scalar::<_, String>(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            found.extend(query.fetch_all(&self.pool).await?);
        }

        Ok(found)
    }

    /// Record a completed download. Marking the same item again is a no-op.
    pub async fn mark_downloaded(
        &self,
        item_id: &str,
        source_id: &str,
        timestamp: i64,
    ) -> Result<bool> {
        self.mark_downloaded_at(item_id, source_id, timestamp, None)
            .await
    }

    /// Like [Self::mark_downloaded], also remembering where the media was written
    pub async fn mark_downloaded_at(
        &self,
        item_id: &str,
        source_id: &str,
        timestamp: i64,
        save_path: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO downloaded_items (item_id, source_id, downloaded_at, save_path)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(item_id)
        .bind(source_id)
        .bind(timestamp)
        .bind(save_path)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn record_count(&self, source_id: Option<&str>) -> Result<i64> {
        let count: i64 = match source_id {
            Some(source_id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM downloaded_items WHERE source_id = ?1")
                    .bind(source_id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM downloaded_items")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    pub async fn stats(&self) -> Result<DownloadStats> {
        let (total, sources): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(DISTINCT source_id) FROM downloaded_items",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(DownloadStats { total, sources })
    }

    /// Most recently downloaded items first
    pub async fn recent(&self, limit: i64) -> Result<Vec<DownloadedItemRecord>> {
        let records = sqlx::query_as::<_, DownloadedItemRecord>(
            r#"
            SELECT item_id, source_id, downloaded_at, save_path
            FROM downloaded_items
            ORDER BY downloaded_at DESC, item_id ASC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Remove records whose saved file no longer exists on disk.
    ///
    /// Records without a save path are left alone.
    pub async fn cleanup_missing_files(&self) -> Result<u64> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT item_id, save_path FROM downloaded_items WHERE save_path IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut removed = 0;
        for (item_id, save_path) in rows {
            if tokio::fs::try_exists(Path::new(&save_path))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            removed += sqlx::query("DELETE FROM downloaded_items WHERE item_id = ?1")
                .bind(&item_id)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }

        if removed > 0 {
            info!(removed, "Removed ledger records with missing files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_mark_is_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = db.downloaded_items();

        assert!(ledger.mark_downloaded("item_1", "a", 1_000).await.unwrap());
        assert!(!ledger.mark_downloaded("item_1", "a", 2_000).await.unwrap());

        let ids = ledger.downloaded_ids(None).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ledger.is_downloaded("item_1").await.unwrap());
        assert!(!ledger.is_downloaded("item_2").await.unwrap());

        let recent = ledger.recent(10).await.unwrap();
        assert_eq!(recent[0].downloaded_at.timestamp(), 1_000);
    }

    #[tokio::test]
    async fn test_ids_by_source() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = db.downloaded_items();

        ledger.mark_downloaded("1", "a", 1).await.unwrap();
        ledger.mark_downloaded("2", "a", 2).await.unwrap();
        ledger.mark_downloaded("3", "b", 3).await.unwrap();

        assert_eq!(ledger.downloaded_ids(Some("a")).await.unwrap().len(), 2);
        assert_eq!(ledger.downloaded_ids(Some("zzz")).await.unwrap().len(), 0);
        assert_eq!(ledger.record_count(Some("b")).await.unwrap(), 1);
        assert_eq!(ledger.record_count(None).await.unwrap(), 3);
        assert_eq!(
            ledger.stats().await.unwrap(),
            DownloadStats {
                total: 3,
                sources: 2
            }
        );

        let recent = ledger.recent(2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
    }

    #[tokio::test]
    async fn test_downloaded_among_ignores_source() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = db.downloaded_items();

        ledger.mark_downloaded("shared", "b", 1).await.unwrap();
        ledger.mark_downloaded("other", "c", 2).await.unwrap();

        let candidates = vec!["shared".to_string(), "fresh".to_string()];
        let found = ledger.downloaded_among(&candidates).await.unwrap();
        assert_eq!(found, HashSet::from(["shared".to_string()]));
        assert!(ledger.downloaded_among(&[]).await.unwrap().is_empty());

        let many: Vec<String> = (0..1_200).map(|i| format!("bulk_{i}")).collect();
        for id in many.iter().step_by(100) {
            ledger.mark_downloaded(id, "d", 3).await.unwrap();
        }
        assert_eq!(ledger.downloaded_among(&many).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_cleanup_missing_files() {
        let db = Database::connect_in_memory().await.unwrap();
        let ledger = db.downloaded_items();
        let dir = tempfile::tempdir().unwrap();

        let kept = dir.path().join("kept.mp4");
        std::fs::write(&kept, b"x").unwrap();
        let gone = dir.path().join("gone.mp4");

        ledger
            .mark_downloaded_at("kept", "a", 1, kept.to_str())
            .await
            .unwrap();
        ledger
            .mark_downloaded_at("gone", "a", 2, gone.to_str())
            .await
            .unwrap();
        ledger.mark_downloaded("no_path", "a", 3).await.unwrap();

        assert_eq!(ledger.cleanup_missing_files().await.unwrap(), 1);
        let ids = ledger.downloaded_ids(None).await.unwrap();
        assert!(ids.contains("kept"));
        assert!(ids.contains("no_path"));
        assert!(!ids.contains("gone"));
    }
}
