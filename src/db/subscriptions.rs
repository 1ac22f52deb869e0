//! Subscription database repository

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::sqlite_helpers::{bool_to_int, epoch_to_datetime, int_to_bool, now_epoch};
use crate::error::Result;
use crate::scan::Source;

/// Subscription record from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub source_id: String,
    pub nickname: String,
    pub enabled: bool,
    /// Per-source auto-download switch, combined with the global one
    pub auto_download: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    pub fn to_source(&self) -> Source {
        Source {
            source_id: self.source_id.clone(),
            nickname: self.nickname.clone(),
            auto_download: self.auto_download,
        }
    }
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for SubscriptionRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let enabled: i32 = row.try_get("enabled")?;
        let auto_download: i32 = row.try_get("auto_download")?;
        let created_at: i64 = row.try_get("created_at")?;
        let updated_at: i64 = row.try_get("updated_at")?;

        Ok(Self {
            source_id: row.try_get("source_id")?,
            nickname: row.try_get("nickname")?,
            enabled: int_to_bool(enabled),
            auto_download: int_to_bool(auto_download),
            created_at: epoch_to_datetime(created_at),
            updated_at: epoch_to_datetime(updated_at),
        })
    }
}

/// Input for creating or replacing a subscription
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertSubscription {
    pub source_id: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_download: bool,
}

fn default_true() -> bool {
    true
}

impl UpsertSubscription {
    pub fn new(source_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            nickname: Some(nickname.into()),
            enabled: true,
            auto_download: true,
        }
    }
}

/// Partial update; absent fields keep their stored value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionPatch {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub auto_download: Option<bool>,
}

const COLUMNS: &str = "source_id, nickname, enabled, auto_download, created_at, updated_at";

pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add a subscription, or replace nickname and flags of an existing one
    pub async fn upsert(&self, input: UpsertSubscription) -> Result<SubscriptionRecord> {
        let now = now_epoch();
        let nickname = input
            .nickname
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| input.source_id.clone());

        let record = sqlx::query_as::<_, SubscriptionRecord>(&format!(
            r#"
            INSERT INTO subscriptions ({COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(source_id) DO UPDATE SET
                nickname = excluded.nickname,
                enabled = excluded.enabled,
                auto_download = excluded.auto_download,
                updated_at = excluded.updated_at
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&input.source_id)
        .bind(&nickname)
        .bind(bool_to_int(input.enabled))
        .bind(bool_to_int(input.auto_download))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get(&self, source_id: &str) -> Result<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(&format!(
            "SELECT {COLUMNS} FROM subscriptions WHERE source_id = ?1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list(&self, enabled_only: bool) -> Result<Vec<SubscriptionRecord>> {
        let sql = if enabled_only {
            format!("SELECT {COLUMNS} FROM subscriptions WHERE enabled = 1 ORDER BY created_at, source_id")
        } else {
            format!("SELECT {COLUMNS} FROM subscriptions ORDER BY created_at, source_id")
        };

        let records = sqlx::query_as::<_, SubscriptionRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    /// Enabled subscriptions as scan sources
    pub async fn active_sources(&self) -> Result<Vec<Source>> {
        Ok(self
            .list(true)
            .await?
            .iter()
            .map(SubscriptionRecord::to_source)
            .collect())
    }

    pub async fn set_enabled(&self, source_id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET enabled = ?2, updated_at = ?3 WHERE source_id = ?1",
        )
        .bind(source_id)
        .bind(bool_to_int(enabled))
        .bind(now_epoch())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_auto_download(&self, source_id: &str, auto_download: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE subscriptions SET auto_download = ?2, updated_at = ?3 WHERE source_id = ?1",
        )
        .bind(source_id)
        .bind(bool_to_int(auto_download))
        .bind(now_epoch())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Apply `patch` and return the updated record, or `None` if the source is unknown
    pub async fn update(
        &self,
        source_id: &str,
        patch: &SubscriptionPatch,
    ) -> Result<Option<SubscriptionRecord>> {
        if let Some(enabled) = patch.enabled {
            if !self.set_enabled(source_id, enabled).await? {
                return Ok(None);
            }
        }
        if let Some(auto_download) = patch.auto_download {
            if !self.set_auto_download(source_id, auto_download).await? {
                return Ok(None);
            }
        }
        self.get(source_id).await
    }

    /// Remove a subscription. Its progress row is purged at the start of the next run.
    pub async fn remove(&self, source_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE source_id = ?1")
            .bind(source_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_upsert_and_get() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.subscriptions();

        let created = repo.upsert(UpsertSubscription::new("u1", "Alice")).await.unwrap();
        assert_eq!(created.nickname, "Alice");
        assert!(created.enabled);

        let updated = repo
            .upsert(UpsertSubscription {
                auto_download: false,
                ..UpsertSubscription::new("u1", "Alice B")
            })
            .await
            .unwrap();
        assert_eq!(updated.nickname, "Alice B");
        assert!(!updated.auto_download);
        assert_eq!(updated.created_at, created.created_at);

        assert_eq!(repo.list(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_nickname_falls_back_to_id() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.subscriptions();

        let record = repo
            .upsert(UpsertSubscription {
                source_id: "u2".into(),
                nickname: None,
                enabled: true,
                auto_download: true,
            })
            .await
            .unwrap();
        assert_eq!(record.nickname, "u2");
    }

    #[tokio::test]
    async fn test_enabled_filter_and_remove() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.subscriptions();

        repo.upsert(UpsertSubscription::new("a", "A")).await.unwrap();
        repo.upsert(UpsertSubscription::new("b", "B")).await.unwrap();
        assert!(repo.set_enabled("b", false).await.unwrap());
        assert!(!repo.set_enabled("missing", false).await.unwrap());

        let sources = repo.active_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source_id, "a");

        assert!(repo.set_auto_download("a", false).await.unwrap());
        assert!(!repo.get("a").await.unwrap().unwrap().auto_download);

        assert!(repo.remove("a").await.unwrap());
        assert!(!repo.remove("a").await.unwrap());
        assert!(repo.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_patch_touches_only_given_fields() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.subscriptions();
        repo.upsert(UpsertSubscription::new("a", "A")).await.unwrap();

        let patch = SubscriptionPatch {
            auto_download: Some(false),
            ..Default::default()
        };
        let record = repo.update("a", &patch).await.unwrap().unwrap();
        assert!(record.enabled);
        assert!(!record.auto_download);

        let patch = SubscriptionPatch {
            enabled: Some(false),
            ..Default::default()
        };
        let record = repo.update("a", &patch).await.unwrap().unwrap();
        assert!(!record.enabled);
        assert!(!record.auto_download);
        assert!(repo.active_sources().await.unwrap().is_empty());

        // An empty patch is a read
        let record = repo.update("a", &SubscriptionPatch::default()).await.unwrap();
        assert!(record.is_some());

        assert!(repo.update("missing", &patch).await.unwrap().is_none());
        assert!(repo.update("missing", &SubscriptionPatch::default()).await.unwrap().is_none());
    }
}
