//! Wires the collaborators, snapshot cells and orchestrator from an
//! [`EngineConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use gigfeed_core::RankingPolicy;
use gigfeed_storage::{
    ArtifactStore, Catalog, FeedPreferenceStore, HttpCatalog, HttpClientConfig, HttpFetcher, InteractionLog,
    MemoryCatalog, MemoryFeedPreferenceStore, MemoryInteractionLog, PgFeedPreferenceStore, PgInteractionLog,
    Snapshots,
};
use tracing::info;

use crate::{load_policy, EngineConfig, Orchestrator, ReportWriter};

pub struct Engine {
    pub config: EngineConfig,
    pub policy: RankingPolicy,
    pub catalog: Arc<dyn Catalog>,
    /// Set when the catalog is in-process, which is the only case seeding can write to.
    pub memory_catalog: Option<Arc<MemoryCatalog>>,
    pub log: Arc<dyn InteractionLog>,
    pub preferences: Arc<dyn FeedPreferenceStore>,
    pub snapshots: Arc<Snapshots>,
    pub orchestrator: Arc<Orchestrator>,
}

fn volatile_preferences() -> Arc<dyn FeedPreferenceStore> {
    Arc::new(MemoryFeedPreferenceStore::new())
}

impl Engine {
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let policy = load_policy(&config.policy_path)?;

        let (log, preferences): (Arc<dyn InteractionLog>, Arc<dyn FeedPreferenceStore>) =
            match (&config.database_url, &config.journal_path) {
                (Some(url), _) => {
                    info!("using postgres interaction and preference stores");
                    let pg = PgInteractionLog::connect(url).await.context("connecting interaction store")?;
                    let prefs = PgFeedPreferenceStore::from_pool(pg.pool())
                        .await
                        .context("preparing preference store")?;
                    let log: Arc<dyn InteractionLog> = Arc::new(pg);
                    let prefs: Arc<dyn FeedPreferenceStore> = Arc::new(prefs);
                    (log, prefs)
                }
                (None, Some(path)) => {
                    info!(path = %path.display(), "using journaled in-memory interaction store");
                    let log: Arc<dyn InteractionLog> = Arc::new(MemoryInteractionLog::open_journal(path).await?);
                    (log, volatile_preferences())
                }
                (None, None) => {
                    info!("using volatile in-memory interaction store");
                    let log: Arc<dyn InteractionLog> = Arc::new(MemoryInteractionLog::new());
                    (log, volatile_preferences())
                }
            };

        let (catalog, memory_catalog): (Arc<dyn Catalog>, Option<Arc<MemoryCatalog>>) = match &config.catalog_url {
            Some(url) => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: config.http_timeout(),
                    user_agent: Some(format!("gigfeed/{}", env!("CARGO_PKG_VERSION"))),
                    ..HttpClientConfig::default()
                })?;
                info!(%url, "using upstream catalog");
                (Arc::new(HttpCatalog::new(url.clone(), http)), None)
            }
            None => {
                let memory = Arc::new(MemoryCatalog::new());
                (memory.clone(), Some(memory))
            }
        };

        let snapshots = Arc::new(Snapshots::new());
        let reports = ReportWriter::new(config.reports_dir.clone(), ArtifactStore::new(config.artifacts_dir.clone()));
        let orchestrator = Arc::new(
            Orchestrator::new(
                Arc::clone(&catalog),
                Arc::clone(&log),
                Arc::clone(&snapshots),
                policy,
                config.job_timeout(),
            )
            .with_reports(reports),
        );

        Ok(Self {
            config,
            policy,
            catalog,
            memory_catalog,
            log,
            preferences,
            snapshots,
            orchestrator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobKind, TriggerOutcome, TriggerSource};
    use tempfile::tempdir;

    #[tokio::test]
    async fn defaults_wire_an_in_memory_engine() {
        let dir = tempdir().expect("tempdir");
        let config = EngineConfig {
            journal_path: Some(dir.path().join("events.jsonl")),
            artifacts_dir: dir.path().join("artifacts"),
            reports_dir: dir.path().join("reports"),
            policy_path: dir.path().join("absent.yaml"),
            ..EngineConfig::default()
        };
        let engine = Engine::from_config(config).await.expect("engine");

        assert!(engine.memory_catalog.is_some());
        assert_eq!(engine.preferences.backend(), "memory");
        assert_eq!(engine.policy, RankingPolicy::default());
        let outcome = engine.orchestrator.trigger(JobKind::Frequent, TriggerSource::Manual).await;
        assert!(matches!(outcome, TriggerOutcome::Success(_)));
        assert_eq!(engine.snapshots.versions().trending, 1);
    }

    #[tokio::test]
    async fn catalog_url_disables_the_memory_catalog() {
        let dir = tempdir().expect("tempdir");
        let config = EngineConfig {
            catalog_url: Some("http://127.0.0.1:9".into()),
            policy_path: dir.path().join("absent.yaml"),
            ..EngineConfig::default()
        };
        let engine = Engine::from_config(config).await.expect("engine");
        assert!(engine.memory_catalog.is_none());
    }
}
