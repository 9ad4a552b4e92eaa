//! Per-user feed settings (blocked tags and posters, pay bounds, radius,
//! personalization switch).

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use gigfeed_core::FeedPreferences;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

/// Last-writer-wins record per user.
#[async_trait]
pub trait FeedPreferenceStore: Send + Sync {
    async fn get(&self, user_uid: Uuid) -> Result<Option<FeedPreferences>>;

    async fn put(&self, preferences: &FeedPreferences) -> Result<()>;

    fn backend(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct MemoryFeedPreferenceStore {
    records: RwLock<HashMap<Uuid, FeedPreferences>>,
}

impl MemoryFeedPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedPreferenceStore for MemoryFeedPreferenceStore {
    async fn get(&self, user_uid: Uuid) -> Result<Option<FeedPreferences>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&user_uid).cloned())
    }

    async fn put(&self, preferences: &FeedPreferences) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.insert(preferences.user_uid, preferences.clone());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// `user_feed_preferences` table; the record is kept as one JSONB document.
#[derive(Debug, Clone)]
pub struct PgFeedPreferenceStore {
    pool: PgPool,
}

impl PgFeedPreferenceStore {
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_feed_preferences (
                user_uid UUID PRIMARY KEY,
                preferences JSONB NOT NULL,
                updated_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("creating user_feed_preferences")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl FeedPreferenceStore for PgFeedPreferenceStore {
    async fn get(&self, user_uid: Uuid) -> Result<Option<FeedPreferences>> {
        let row = sqlx::query("SELECT preferences FROM user_feed_preferences WHERE user_uid = $1")
            .bind(user_uid)
            .fetch_optional(&self.pool)
            .await
            .context("reading user_feed_preferences")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let doc: serde_json::Value = row.try_get("preferences")?;
        match serde_json::from_value::<FeedPreferences>(doc) {
            Ok(prefs) => Ok(Some(prefs)),
            Err(err) => {
                warn!(%user_uid, %err, "unreadable stored feed preferences; using defaults");
                Ok(None)
            }
        }
    }

    async fn put(&self, preferences: &FeedPreferences) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_feed_preferences (user_uid, preferences, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_uid) DO UPDATE
                SET preferences = EXCLUDED.preferences, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(preferences.user_uid)
        .bind(serde_json::to_value(preferences).context("encoding feed preferences")?)
        .bind(preferences.updated_at)
        .execute(&self.pool)
        .await
        .context("writing user_feed_preferences")?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_replaces_the_whole_record() {
        let store = MemoryFeedPreferenceStore::new();
        let uid = Uuid::new_v4();
        assert!(store.get(uid).await.unwrap().is_none());

        let mut prefs = FeedPreferences::defaults(uid);
        prefs.blocked_tags.insert(4);
        store.put(&prefs).await.unwrap();
        prefs.blocked_tags.clear();
        prefs.personalization_enabled = false;
        store.put(&prefs).await.unwrap();

        let stored = store.get(uid).await.unwrap().expect("stored");
        assert!(stored.blocked_tags.is_empty());
        assert!(!stored.personalization_enabled);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
