//! Per-source scan checkpoints
//!
//! Each subscribed source has one row holding its watermark (the newest
//! publish time that was fully classified) plus scan counters. The watermark
//! only moves forward; every mutation is a single statement so a crash never
//! leaves a source half-updated.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{epoch_to_datetime_opt, now_epoch, placeholders};
use crate::error::Result;
use crate::scan::Source;

/// Progress record for a single source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceProgress {
    pub source_id: String,
    /// Watermark, epoch seconds
    pub last_seen_item_time: i64,
    pub last_seen_item_id: Option<String>,
    pub last_scan_time: i64,
    pub scan_count: i64,
}

impl SourceProgress {
    pub fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        epoch_to_datetime_opt(self.last_scan_time)
    }
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for SourceProgress {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;
        Ok(Self {
            source_id: row.try_get("source_id")?,
            last_seen_item_time: row.try_get("last_seen_item_time")?,
            last_seen_item_id: row.try_get("last_seen_item_id")?,
            last_scan_time: row.try_get("last_scan_time")?,
            scan_count: row.try_get("scan_count")?,
        })
    }
}

/// When the last run started and which round it was
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastScanInfo {
    pub last_scan_time: Option<DateTime<Utc>>,
    pub seconds_since: Option<i64>,
    pub round: i64,
}

/// Aggregate view over all progress rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressStatistics {
    pub total_tracked: i64,
    pub round: i64,
    pub average_scan_age_secs: Option<f64>,
    pub stalest_source: Option<String>,
}

pub struct SourceProgressRepository {
    pool: SqlitePool,
}

impl SourceProgressRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get progress for a source
    pub async fn get(&self, source_id: &str) -> Result<Option<SourceProgress>> {
        let record = sqlx::query_as::<_, SourceProgress>(
            r#"
            SELECT source_id, last_seen_item_time, last_seen_item_id, last_scan_time, scan_count
            FROM source_progress
            WHERE source_id = ?1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// List every tracked source, stalest first
    pub async fn list(&self) -> Result<Vec<SourceProgress>> {
        let records = sqlx::query_as::<_, SourceProgress>(
            r#"
            SELECT source_id, last_seen_item_time, last_seen_item_id, last_scan_time, scan_count
            FROM source_progress
            ORDER BY last_scan_time ASC, source_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Advance the watermark of a source.
    ///
    /// Creates the row on first sight. When a row exists and `watermark_time`
    /// is not greater than the stored watermark nothing is written and
    /// `false` is returned.
    pub async fn update(
        &self,
        source_id: &str,
        watermark_time: i64,
        watermark_item_id: &str,
    ) -> Result<bool> {
        let now = now_epoch();
        let result = sqlx::query(
            r#"
            INSERT INTO source_progress
                (source_id, last_seen_item_time, last_seen_item_id, last_scan_time, scan_count)
            VALUES (?1, ?2, ?3, ?4, 1)
            ON CONFLICT(source_id) DO UPDATE SET
                last_seen_item_time = excluded.last_seen_item_time,
                last_seen_item_id = excluded.last_seen_item_id,
                last_scan_time = excluded.last_scan_time,
                scan_count = source_progress.scan_count + 1
            WHERE excluded.last_seen_item_time > source_progress.last_seen_item_time
            "#,
        )
        .bind(source_id)
        .bind(watermark_time)
        .bind(watermark_item_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a scan that left the watermark where it was
    pub async fn touch(&self, source_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_progress
                (source_id, last_seen_item_time, last_seen_item_id, last_scan_time, scan_count)
            VALUES (?1, 0, NULL, ?2, 1)
            ON CONFLICT(source_id) DO UPDATE SET
                last_scan_time = excluded.last_scan_time,
                scan_count = source_progress.scan_count + 1
            "#,
        )
        .bind(source_id)
        .bind(now_epoch())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Split sources into never-scanned and known ones.
    ///
    /// New sources keep their input order. Known sources are ordered by
    /// `last_scan_time` ascending so the stalest is scanned first.
    pub async fn partition_by_priority(
        &self,
        sources: Vec<Source>,
    ) -> Result<(Vec<Source>, Vec<Source>)> {
        let scanned: HashMap<String, i64> =
            sqlx::query_as::<_, (String, i64)>("SELECT source_id, last_scan_time FROM source_progress")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();

        let (mut known, new): (Vec<Source>, Vec<Source>) = sources
            .into_iter()
            .partition(|s| scanned.contains_key(&s.source_id));

        known.sort_by(|a, b| {
            let ta = scanned.get(&a.source_id).copied().unwrap_or_default();
            let tb = scanned.get(&b.source_id).copied().unwrap_or_default();
            ta.cmp(&tb).then_with(|| a.source_id.cmp(&b.source_id))
        });

        Ok((new, known))
    }

    /// Delete progress rows of sources not in `active_source_ids`
    pub async fn purge(&self, active_source_ids: &[String]) -> Result<u64> {
        if active_source_ids.is_empty() {
            let result = sqlx::query("DELETE FROM source_progress")
                .execute(&self.pool)
                .await?;
            return Ok(result.rows_affected());
        }

        let sql = format!(
            "DELETE FROM source_progress WHERE source_id NOT IN ({})",
            placeholders(active_source_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in active_source_ids {
            query = query.bind(id);
        }
        let result = query.execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    /// Increment the durable round counter and stamp the run start
    pub async fn start_new_round(&self) -> Result<i64> {
        let round: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scan_rounds (id, round, last_scan_time)
            VALUES (1, 1, ?1)
            ON CONFLICT(id) DO UPDATE SET
                round = scan_rounds.round + 1,
                last_scan_time = excluded.last_scan_time
            RETURNING round
            "#,
        )
        .bind(now_epoch())
        .fetch_one(&self.pool)
        .await?;

        Ok(round)
    }

    pub async fn last_scan_info(&self) -> Result<LastScanInfo> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT round, last_scan_time FROM scan_rounds WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        let (round, last) = row.unwrap_or((0, 0));
        let last_scan_time = epoch_to_datetime_opt(last);
        Ok(LastScanInfo {
            seconds_since: last_scan_time.map(|_| (now_epoch() - last).max(0)),
            last_scan_time,
            round,
        })
    }

    pub async fn statistics(&self) -> Result<ProgressStatistics> {
        let now = now_epoch();
        let (total_tracked, average_scan_age_secs): (i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), AVG(CAST(?1 - last_scan_time AS REAL))
            FROM source_progress
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let stalest_source: Option<String> = sqlx::query_scalar(
            "SELECT source_id FROM source_progress ORDER BY last_scan_time ASC, source_id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let round = self.last_scan_info().await?.round;

        Ok(ProgressStatistics {
            total_tracked,
            round,
            average_scan_age_secs,
            stalest_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn source(id: &str) -> Source {
        Source::new(id, id)
    }

    #[tokio::test]
    async fn test_update_creates_and_advances() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.source_progress();

        assert!(repo.get("a").await.unwrap().is_none());
        assert!(repo.update("a", 100, "item_1").await.unwrap());

        let progress = repo.get("a").await.unwrap().unwrap();
        assert_eq!(progress.last_seen_item_time, 100);
        assert_eq!(progress.last_seen_item_id.as_deref(), Some("item_1"));
        assert_eq!(progress.scan_count, 1);

        assert!(repo.update("a", 200, "item_2").await.unwrap());
        let progress = repo.get("a").await.unwrap().unwrap();
        assert_eq!(progress.last_seen_item_time, 200);
        assert_eq!(progress.scan_count, 2);
    }

    #[tokio::test]
    async fn test_update_never_regresses() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.source_progress();

        repo.update("a", 200, "item_9").await.unwrap();
        assert!(!repo.update("a", 150, "item_8").await.unwrap());
        assert!(!repo.update("a", 200, "item_x").await.unwrap());

        let progress = repo.get("a").await.unwrap().unwrap();
        assert_eq!(progress.last_seen_item_time, 200);
        assert_eq!(progress.last_seen_item_id.as_deref(), Some("item_9"));
    }

    #[tokio::test]
    async fn test_touch_keeps_watermark() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.source_progress();

        repo.touch("fresh").await.unwrap();
        let progress = repo.get("fresh").await.unwrap().unwrap();
        assert_eq!(progress.last_seen_item_time, 0);
        assert_eq!(progress.scan_count, 1);

        repo.update("fresh", 50, "i").await.unwrap();
        repo.touch("fresh").await.unwrap();
        let progress = repo.get("fresh").await.unwrap().unwrap();
        assert_eq!(progress.last_seen_item_time, 50);
        assert_eq!(progress.scan_count, 3);
    }

    #[tokio::test]
    async fn test_partition_new_first_then_stalest() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.source_progress();

        for (id, scanned_at) in [("b", 300_i64), ("c", 100), ("d", 200)] {
            sqlx::query(
                "INSERT INTO source_progress (source_id, last_seen_item_time, last_scan_time, scan_count) VALUES (?, 0, ?, 1)",
            )
            .bind(id)
            .bind(scanned_at)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let (new, known) = repo
            .partition_by_priority(vec![source("b"), source("a"), source("c"), source("d"), source("e")])
            .await
            .unwrap();

        let new: Vec<_> = new.iter().map(|s| s.source_id.as_str()).collect();
        let known: Vec<_> = known.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(new, vec!["a", "e"]);
        assert_eq!(known, vec!["c", "d", "b"]);
    }

    #[tokio::test]
    async fn test_purge_removes_inactive() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.source_progress();
        for id in ["A", "B", "C"] {
            repo.touch(id).await.unwrap();
        }

        let removed = repo
            .purge(&["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get("C").await.unwrap().is_none());
        assert!(repo.get("A").await.unwrap().is_some());

        assert_eq!(repo.purge(&[]).await.unwrap(), 2);
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rounds_and_statistics() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.source_progress();

        let info = repo.last_scan_info().await.unwrap();
        assert_eq!(info.round, 0);
        assert!(info.last_scan_time.is_none());

        assert_eq!(repo.start_new_round().await.unwrap(), 1);
        assert_eq!(repo.start_new_round().await.unwrap(), 2);
        let info = repo.last_scan_info().await.unwrap();
        assert_eq!(info.round, 2);
        assert!(info.seconds_since.is_some());

        repo.touch("x").await.unwrap();
        let stats = repo.statistics().await.unwrap();
        assert_eq!(stats.total_tracked, 1);
        assert_eq!(stats.round, 2);
        assert_eq!(stats.stalest_source.as_deref(), Some("x"));
    }
}
