use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, TriggerOutcome, TriggerSource};
use crate::{EngineConfig, JobKind};

/// Cron expression for each job class, in `JobKind::ALL` order.
pub fn cron_table(config: &EngineConfig) -> [(JobKind, String); 3] {
    [
        (JobKind::Daily, config.daily_cron.clone()),
        (JobKind::Hourly, config.hourly_cron.clone()),
        (JobKind::Frequent, config.frequent_cron.clone()),
    ]
}

/// Builds (but does not start) the periodic scheduler; `None` when disabled.
///
/// Ticks go through the same orchestrator as manual triggers, so a tick that
/// lands on a running class is skipped.
pub async fn maybe_build_scheduler(
    config: &EngineConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (kind, cron) in cron_table(config) {
        let orchestrator = Arc::clone(&orchestrator);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                match orchestrator.trigger(kind, TriggerSource::Scheduled).await {
                    TriggerOutcome::Success(summary) => {
                        info!(job = %kind, version = ?summary.generation_version, "scheduled run finished");
                    }
                    TriggerOutcome::Failed(summary) => {
                        warn!(job = %kind, error = ?summary.error, "scheduled run failed");
                    }
                    TriggerOutcome::AlreadyRunning { .. } => {
                        warn!(job = %kind, "scheduled tick skipped; previous run still in flight");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {kind} cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = %kind, %cron, "scheduled job registered");
    }
    Ok(Some(sched))
}

/// Builds and starts the scheduler when enabled. Keep the handle alive for as
/// long as ticks should fire.
pub async fn start_scheduler(config: &EngineConfig, orchestrator: Arc<Orchestrator>) -> Result<Option<JobScheduler>> {
    let Some(sched) = maybe_build_scheduler(config, orchestrator).await? else {
        info!("periodic scheduler disabled");
        return Ok(None);
    };
    sched.start().await.context("starting scheduler")?;
    info!("periodic scheduler started");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gigfeed_core::RankingPolicy;
    use gigfeed_storage::{MemoryCatalog, MemoryInteractionLog, Snapshots};
    use std::time::Duration;

    fn orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryInteractionLog::new()),
            Arc::new(Snapshots::new()),
            RankingPolicy::default(),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = EngineConfig::default();
        assert!(maybe_build_scheduler(&config, orchestrator()).await.expect("build").is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_the_default_cron_table() {
        let config = EngineConfig {
            scheduler_enabled: true,
            ..EngineConfig::default()
        };
        let sched = maybe_build_scheduler(&config, orchestrator()).await.expect("default crons parse");
        assert!(sched.is_some());
    }

    #[tokio::test]
    async fn malformed_cron_names_the_job_class() {
        let config = EngineConfig {
            scheduler_enabled: true,
            hourly_cron: "every hour".into(),
            ..EngineConfig::default()
        };
        let err = maybe_build_scheduler(&config, orchestrator()).await.err().expect("malformed cron must fail");
        assert!(format!("{err:#}").contains("hourly"));
    }

    #[test]
    fn cron_table_covers_every_job_class() {
        let table = cron_table(&EngineConfig::default());
        let kinds: Vec<JobKind> = table.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, JobKind::ALL.to_vec());
        assert_eq!(table[1].1, "0 0 * * * *");
    }
}
