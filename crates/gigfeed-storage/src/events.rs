//! Append-only interaction event store.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gigfeed_core::{EventFilter, InteractionEvent, InteractionType};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SHARD_COUNT: usize = 16;

/// Durable append log of user-listing interactions.
///
/// `append` never deduplicates: the log keeps every delivery and the
/// aggregations drop exact replays. `query` is the only read path the batch
/// jobs use and returns events ordered by `occurred_at`.
#[async_trait]
pub trait InteractionLog: Send + Sync {
    async fn append(&self, event: InteractionEvent) -> Result<()>;

    async fn query(&self, filter: &EventFilter) -> Result<Vec<InteractionEvent>>;

    fn backend(&self) -> &'static str;
}

/// In-process log sharded by user so concurrent sessions append without
/// contending, with an optional JSON-lines journal for restarts.
#[derive(Debug)]
pub struct MemoryInteractionLog {
    shards: Vec<RwLock<Vec<InteractionEvent>>>,
    journal: Option<Mutex<fs::File>>,
    journal_path: Option<PathBuf>,
}

impl Default for MemoryInteractionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInteractionLog {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(Vec::new())).collect(),
            journal: None,
            journal_path: None,
        }
    }

    /// Replays an existing journal (if any) and appends new events to it.
    pub async fn open_journal(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let log = Self::new();

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking journal {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading journal {}", path.display()))?;
            let mut replayed = 0usize;
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InteractionEvent>(line) {
                    Ok(event) => {
                        log.push(event);
                        replayed += 1;
                    }
                    Err(err) => {
                        warn!(journal = %path.display(), line = line_no + 1, %err, "skipping unreadable journal line");
                    }
                }
            }
            info!(journal = %path.display(), replayed, "replayed interaction journal");
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating journal directory {}", parent.display()))?;
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening journal {}", path.display()))?;

        Ok(Self {
            journal: Some(Mutex::new(file)),
            journal_path: Some(path),
            ..log
        })
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal_path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_for(&self, user_uid: Uuid) -> &RwLock<Vec<InteractionEvent>> {
        let idx = (user_uid.as_u128() % self.shards.len() as u128) as usize;
        &self.shards[idx]
    }

    fn push(&self, event: InteractionEvent) {
        self.shard_for(event.user_uid)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn collect(shard: &RwLock<Vec<InteractionEvent>>, filter: &EventFilter, out: &mut Vec<InteractionEvent>) {
        let guard = shard.read().unwrap_or_else(PoisonError::into_inner);
        out.extend(guard.iter().filter(|e| filter.matches(e)).cloned());
    }
}

#[async_trait]
impl InteractionLog for MemoryInteractionLog {
    async fn append(&self, event: InteractionEvent) -> Result<()> {
        if let Some(journal) = &self.journal {
            let mut line = serde_json::to_vec(&event).context("serializing interaction event")?;
            line.push(b'\n');
            let mut file = journal.lock().await;
            file.write_all(&line)
                .await
                .context("appending to interaction journal")?;
            file.flush().await.context("flushing interaction journal")?;
        }
        debug!(user_uid = %event.user_uid, listing_id = %event.listing_id, kind = %event.interaction_type, "interaction recorded");
        self.push(event);
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<InteractionEvent>> {
        let mut out = Vec::new();
        match filter.user_uid {
            Some(uid) => Self::collect(self.shard_for(uid), filter, &mut out),
            None => {
                for shard in &self.shards {
                    Self::collect(shard, filter, &mut out);
                }
            }
        }
        out.sort_by_key(|e| e.occurred_at);
        Ok(out)
    }

    fn backend(&self) -> &'static str {
        if self.journal.is_some() {
            "memory+journal"
        } else {
            "memory"
        }
    }
}

/// PostgreSQL-backed log over the `user_interactions` table.
#[derive(Debug, Clone)]
pub struct PgInteractionLog {
    pool: PgPool,
}

impl PgInteractionLog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .context("connecting to interaction database")?;
        let log = Self { pool };
        log.ensure_table().await?;
        Ok(log)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Shared with the preference store so one engine holds one pool.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_interactions (
                id BIGSERIAL PRIMARY KEY,
                user_uid UUID NOT NULL,
                listing_id UUID NOT NULL,
                interaction_type TEXT NOT NULL,
                interaction_time TIMESTAMPTZ NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating user_interactions")?;
        for ddl in [
            "CREATE INDEX IF NOT EXISTS user_interactions_user_time ON user_interactions (user_uid, interaction_time)",
            "CREATE INDEX IF NOT EXISTS user_interactions_listing_time ON user_interactions (listing_id, interaction_time)",
            "CREATE INDEX IF NOT EXISTS user_interactions_time ON user_interactions (interaction_time)",
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("running `{ddl}`"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl InteractionLog for PgInteractionLog {
    async fn append(&self, event: InteractionEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_interactions
                (user_uid, listing_id, interaction_type, interaction_time, metadata)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.user_uid)
        .bind(event.listing_id)
        .bind(event.interaction_type.as_str())
        .bind(event.occurred_at)
        .bind(serde_json::Value::Object(event.metadata))
        .execute(&self.pool)
        .await
        .context("inserting interaction")?;
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<InteractionEvent>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT user_uid, listing_id, interaction_type, interaction_time, metadata FROM user_interactions WHERE TRUE",
        );
        if let Some(uid) = filter.user_uid {
            qb.push(" AND user_uid = ").push_bind(uid);
        }
        if let Some(listing_id) = filter.listing_id {
            qb.push(" AND listing_id = ").push_bind(listing_id);
        }
        if let Some(types) = &filter.types {
            let names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
            qb.push(" AND interaction_type = ANY(").push_bind(names).push(")");
        }
        if let Some(since) = filter.since {
            qb.push(" AND interaction_time >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND interaction_time < ").push_bind(until);
        }
        qb.push(" ORDER BY interaction_time, id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("querying user_interactions")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("interaction_type")?;
            let interaction_type: InteractionType = match kind.parse() {
                Ok(t) => t,
                Err(err) => {
                    warn!(%err, "skipping stored interaction with unknown type");
                    continue;
                }
            };
            let occurred_at: DateTime<Utc> = row.try_get("interaction_time")?;
            let metadata: serde_json::Value = row.try_get("metadata")?;
            out.push(InteractionEvent {
                user_uid: row.try_get("user_uid")?,
                listing_id: row.try_get("listing_id")?,
                interaction_type,
                occurred_at,
                metadata: match metadata {
                    serde_json::Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                },
            });
        }
        Ok(out)
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}
