//! Per-class job state machine with mutual exclusion, timeouts and
//! cancellation. Publishing happens only after a run finishes within its timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gigfeed_core::{EventFilter, InteractionEvent, Listing, RankingPolicy};
use gigfeed_storage::{Catalog, InteractionLog, SnapshotVersions, Snapshots};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::reports::ReportWriter;
use crate::{engagement, features, trending, CancelFlag, JobError, JobKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub events_read: usize,
    pub listings_read: usize,
    pub records_published: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub task_type: JobKind,
    pub source: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub message: String,
    pub generation_version: Option<u64>,
    pub stats: RunStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<String>,
}

/// What a trigger call reports back. `AlreadyRunning` is not a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Success(RunSummary),
    Failed(RunSummary),
    AlreadyRunning {
        task_type: JobKind,
        run_id: Option<Uuid>,
        started_at: Option<DateTime<Utc>>,
        message: String,
    },
}

impl TriggerOutcome {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            TriggerOutcome::Success(summary) | TriggerOutcome::Failed(summary) => Some(summary),
            TriggerOutcome::AlreadyRunning { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running {
        run_id: Uuid,
        source: TriggerSource,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        last_run: RunSummary,
    },
    Failed {
        last_run: RunSummary,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub task_type: JobKind,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub jobs: Vec<JobStatus>,
    pub generations: SnapshotVersions,
}

#[derive(Debug)]
struct JobSlot {
    kind: JobKind,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<JobState>,
    cancel: Mutex<Option<CancelFlag>>,
}

impl JobSlot {
    fn new(kind: JobKind) -> Self {
        Self {
            kind,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(JobState::Idle),
            cancel: Mutex::new(None),
        }
    }

    fn state(&self) -> JobState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, state: JobState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_cancel(&self, flag: Option<CancelFlag>) {
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = flag;
    }
}

/// Computed generation waiting to be published.
enum Computed {
    Features(gigfeed_core::FeatureGeneration),
    Engagement(gigfeed_core::EngagementGeneration),
    Trending(gigfeed_core::TrendingGeneration),
}

impl Computed {
    fn records(&self) -> usize {
        match self {
            Computed::Features(g) => g.feature_vectors.len(),
            Computed::Engagement(g) => g.scores.len(),
            Computed::Trending(g) => g.entries.len(),
        }
    }
}

pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    log: Arc<dyn InteractionLog>,
    snapshots: Arc<Snapshots>,
    policy: RankingPolicy,
    timeout: Duration,
    reports: Option<ReportWriter>,
    slots: [JobSlot; 3],
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        log: Arc<dyn InteractionLog>,
        snapshots: Arc<Snapshots>,
        policy: RankingPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            log,
            snapshots,
            policy,
            timeout,
            reports: None,
            slots: JobKind::ALL.map(JobSlot::new),
        }
    }

    pub fn with_reports(mut self, reports: ReportWriter) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn snapshots(&self) -> &Arc<Snapshots> {
        &self.snapshots
    }

    pub fn policy(&self) -> &RankingPolicy {
        &self.policy
    }

    fn slot(&self, kind: JobKind) -> &JobSlot {
        match kind {
            JobKind::Daily => &self.slots[0],
            JobKind::Hourly => &self.slots[1],
            JobKind::Frequent => &self.slots[2],
        }
    }

    pub fn state(&self, kind: JobKind) -> JobState {
        self.slot(kind).state()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            jobs: self
                .slots
                .iter()
                .map(|slot| JobStatus {
                    task_type: slot.kind,
                    state: slot.state(),
                })
                .collect(),
            generations: self.snapshots.versions(),
        }
    }

    /// Requests cancellation of the in-flight run of `kind`. Returns false when idle.
    pub fn cancel(&self, kind: JobKind) -> bool {
        let guard = self.slot(kind).cancel.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(flag) => {
                flag.cancel();
                info!(job = %kind, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Runs one job of `kind` unless one is already in flight.
    pub async fn trigger(&self, kind: JobKind, source: TriggerSource) -> TriggerOutcome {
        let slot = self.slot(kind);
        let Ok(_gate) = slot.gate.try_lock() else {
            let (run_id, started_at) = match slot.state() {
                JobState::Running {
                    run_id, started_at, ..
                } => (Some(run_id), Some(started_at)),
                _ => (None, None),
            };
            warn!(job = %kind, ?source, ?run_id, "job already running; trigger rejected");
            return TriggerOutcome::AlreadyRunning {
                task_type: kind,
                run_id,
                started_at,
                message: format!("{kind} job is already running"),
            };
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = CancelFlag::new();
        slot.set_cancel(Some(cancel.clone()));
        slot.set_state(JobState::Running {
            run_id,
            source,
            started_at,
        });

        let span = info_span!("job_run", job = %kind, %run_id, ?source);
        let summary = self
            .run(kind, source, run_id, started_at, cancel)
            .instrument(span)
            .await;

        slot.set_cancel(None);
        match summary.status {
            RunStatus::Succeeded => {
                slot.set_state(JobState::Succeeded {
                    last_run: summary.clone(),
                });
                TriggerOutcome::Success(summary)
            }
            RunStatus::Failed => {
                slot.set_state(JobState::Failed {
                    last_run: summary.clone(),
                });
                TriggerOutcome::Failed(summary)
            }
        }
    }

    async fn run(
        &self,
        kind: JobKind,
        source: TriggerSource,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        cancel: CancelFlag,
    ) -> RunSummary {
        info!("job started");
        let mut stats = RunStats::default();
        let deadline = Instant::now() + self.timeout;
        let computed = self
            .compute(kind, started_at, &cancel, &mut stats, deadline)
            .await
            .and_then(|c| cancel.check().map(|()| c));

        let finished_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            task_type: kind,
            source,
            started_at,
            finished_at,
            status: RunStatus::Failed,
            message: String::new(),
            generation_version: None,
            stats,
            error: None,
            report_dir: None,
        };

        match computed {
            Ok(computed) => {
                summary.stats.records_published = computed.records();
                let version = self.publish(computed, finished_at);
                summary.status = RunStatus::Succeeded;
                summary.generation_version = Some(version);
                summary.message = format!(
                    "{kind} job published generation {version} ({} records from {} events)",
                    summary.stats.records_published, summary.stats.events_read
                );
                info!(version, records = summary.stats.records_published, "generation published");
            }
            Err(err) => {
                summary.message = format!("{kind} job failed; previous generation remains live");
                summary.error = Some(err.to_string());
                match err {
                    JobError::Timeout { .. } | JobError::Cancelled => warn!(%err, "job aborted"),
                    _ => error!(%err, "job failed"),
                }
            }
        }

        if let Some(reports) = &self.reports {
            self.write_reports(reports, &mut summary).await;
        }
        summary
    }

    async fn compute(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
        stats: &mut RunStats,
        deadline: Instant,
    ) -> Result<Computed, JobError> {
        let (events, listings) = match tokio::time::timeout_at(deadline, self.load_inputs(kind, now)).await {
            Ok(inputs) => inputs?,
            Err(_) => return Err(self.timed_out(cancel)),
        };
        stats.events_read = events.len();
        stats.listings_read = listings.len();
        cancel.check()?;

        let policy = self.policy;
        let flag = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || -> Result<Computed, JobError> {
            match kind {
                JobKind::Daily => features::build_feature_generation(&events, &listings, &policy, now, &flag)
                    .map(Computed::Features),
                JobKind::Hourly => engagement::build_engagement_generation(&events, &listings, &policy, now, &flag)
                    .map(Computed::Engagement),
                JobKind::Frequent => trending::build_trending_generation(&events, &listings, &policy, now, &flag)
                    .map(Computed::Trending),
            }
        });
        join_within(handle, deadline, cancel, self.timeout).await
    }

    async fn load_inputs(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
    ) -> Result<(Vec<InteractionEvent>, Vec<Listing>), JobError> {
        let lookback = match kind {
            JobKind::Daily | JobKind::Hourly => chrono::Duration::days(self.policy.features.lookback_days),
            JobKind::Frequent => chrono::Duration::hours(self.policy.trending.window_hours),
        };
        let events = self
            .log
            .query(&EventFilter::since(now - lookback))
            .await
            .map_err(JobError::upstream)?;
        let listings = self.catalog.listings().await.map_err(JobError::upstream)?;
        Ok((events, listings))
    }

    fn timed_out(&self, cancel: &CancelFlag) -> JobError {
        cancel.cancel();
        JobError::Timeout {
            secs: self.timeout.as_secs(),
        }
    }

    fn publish(&self, computed: Computed, at: DateTime<Utc>) -> u64 {
        match computed {
            Computed::Features(g) => self.snapshots.features.publish(g, at),
            Computed::Engagement(g) => self.snapshots.engagement.publish(g, at),
            Computed::Trending(g) => self.snapshots.trending.publish(g, at),
        }
    }

    /// Report failures are logged and never change the run outcome.
    async fn write_reports(&self, reports: &ReportWriter, summary: &mut RunSummary) {
        summary.report_dir = Some(reports.run_dir(summary.run_id).display().to_string());
        if summary.task_type == JobKind::Daily && summary.status == RunStatus::Succeeded {
            let generation = self.snapshots.features.current();
            if let Err(err) = reports.export_feature_snapshot(summary.run_id, &generation.data).await {
                warn!(error = %format!("{err:#}"), "parquet snapshot export failed");
            }
            match reports
                .store_generation("features", &generation.data, summary.finished_at)
                .await
            {
                Ok(stored) => info!(
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "feature generation archived"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "feature generation archive failed"),
            }
        }
        if let Err(err) = reports.write_run_summary(summary).await {
            warn!(error = %format!("{err:#}"), "run summary write failed");
        }
    }
}

/// Awaits a blocking computation until `deadline`. On expiry the task is
/// cancelled and still awaited, so the class gate outlives the worker thread.
async fn join_within<T: Send + 'static>(
    mut handle: JoinHandle<Result<T, JobError>>,
    deadline: Instant,
    cancel: &CancelFlag,
    timeout: Duration,
) -> Result<T, JobError> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(joined) => joined.map_err(|err| JobError::Compute(format!("compute task aborted: {err}")))?,
        Err(_) => {
            cancel.cancel();
            if let Err(err) = handle.await {
                warn!(%err, "compute task ended abnormally after timeout");
            }
            Err(JobError::Timeout {
                secs: timeout.as_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use gigfeed_core::{InteractionEvent, InteractionType, Listing, ListingStatus, User};
    use gigfeed_storage::{MemoryCatalog, MemoryInteractionLog};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    fn listing(tags: &[u32]) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            name: "gig".into(),
            description: None,
            tags: tags.iter().copied().collect::<BTreeSet<_>>(),
            latitude: None,
            longitude: None,
            compensation: None,
            poster_uid: Uuid::new_v4(),
            poster_rating: None,
            status: ListingStatus::Open,
            created_at: Utc::now() - chrono::Duration::days(1),
        }
    }

    /// Blocks the first `listings()` call until released.
    struct GatedCatalog {
        inner: MemoryCatalog,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedCatalog {
        fn new(inner: MemoryCatalog) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(true),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl Catalog for GatedCatalog {
        async fn listings(&self) -> Result<Vec<Listing>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.listings().await
        }

        async fn listing(&self, id: Uuid) -> Result<Option<Listing>> {
            self.inner.listing(id).await
        }

        async fn users(&self) -> Result<Vec<User>> {
            self.inner.users().await
        }

        async fn user(&self, uid: Uuid) -> Result<Option<User>> {
            self.inner.user(uid).await
        }
    }

    /// Never answers.
    struct StalledCatalog;

    #[async_trait]
    impl Catalog for StalledCatalog {
        async fn listings(&self) -> Result<Vec<Listing>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }

        async fn listing(&self, _id: Uuid) -> Result<Option<Listing>> {
            Ok(None)
        }

        async fn users(&self) -> Result<Vec<User>> {
            Ok(Vec::new())
        }

        async fn user(&self, _uid: Uuid) -> Result<Option<User>> {
            Ok(None)
        }
    }

    async fn seeded_log(listings: &[Listing]) -> Arc<MemoryInteractionLog> {
        let log = Arc::new(MemoryInteractionLog::new());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for l in listings {
            for user in [a, b] {
                log.append(InteractionEvent::new(
                    user,
                    l.id,
                    InteractionType::Save,
                    Utc::now() - chrono::Duration::minutes(30),
                ))
                .await
                .expect("append");
            }
        }
        log
    }

    #[tokio::test]
    async fn manual_trigger_publishes_each_job_class() {
        let listings = vec![listing(&[1, 2]), listing(&[2, 3])];
        let log = seeded_log(&listings).await;
        let catalog = Arc::new(MemoryCatalog::with_records(listings, Vec::new()));
        let orchestrator = Orchestrator::new(
            catalog,
            log,
            Arc::new(Snapshots::new()),
            RankingPolicy::default(),
            Duration::from_secs(30),
        );

        for kind in JobKind::ALL {
            let outcome = orchestrator.trigger(kind, TriggerSource::Manual).await;
            let TriggerOutcome::Success(summary) = outcome else {
                panic!("{kind} run did not succeed: {outcome:?}");
            };
            assert_eq!(summary.generation_version, Some(1));
            assert_eq!(summary.stats.events_read, 4);
            assert!(matches!(orchestrator.state(kind), JobState::Succeeded { .. }));
        }
        let versions = orchestrator.snapshots().versions();
        assert_eq!((versions.features, versions.engagement, versions.trending), (1, 1, 1));
        assert_eq!(orchestrator.snapshots().trending.current().data.entries.len(), 2);
    }

    #[tokio::test]
    async fn overlapping_trigger_of_same_class_reports_already_running() {
        let listings = vec![listing(&[1])];
        let log = seeded_log(&listings).await;
        let catalog = Arc::new(GatedCatalog::new(MemoryCatalog::with_records(listings, Vec::new())));
        let orchestrator = Arc::new(Orchestrator::new(
            catalog.clone(),
            log,
            Arc::new(Snapshots::new()),
            RankingPolicy::default(),
            Duration::from_secs(30),
        ));

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.trigger(JobKind::Daily, TriggerSource::Scheduled).await })
        };
        catalog.entered.notified().await;

        let second = orchestrator.trigger(JobKind::Daily, TriggerSource::Manual).await;
        let TriggerOutcome::AlreadyRunning { task_type, run_id, .. } = second else {
            panic!("expected already running, got {second:?}");
        };
        assert_eq!(task_type, JobKind::Daily);
        assert!(run_id.is_some());

        // Other classes are not blocked by the daily run.
        let hourly = orchestrator.trigger(JobKind::Hourly, TriggerSource::Manual).await;
        assert!(matches!(hourly, TriggerOutcome::Success(_)));

        catalog.release.notify_one();
        let first = first.await.expect("join");
        assert!(matches!(first, TriggerOutcome::Success(_)));
        assert_eq!(orchestrator.snapshots().features.version(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_fails_and_keeps_previous_generation() {
        let snapshots = Arc::new(Snapshots::new());
        let previous = snapshots.features.current();
        let orchestrator = Orchestrator::new(
            Arc::new(StalledCatalog),
            Arc::new(MemoryInteractionLog::new()),
            Arc::clone(&snapshots),
            RankingPolicy::default(),
            Duration::from_secs(5),
        );

        let outcome = orchestrator.trigger(JobKind::Daily, TriggerSource::Manual).await;

        let TriggerOutcome::Failed(summary) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(summary.generation_version, None);
        assert!(summary.error.as_deref().unwrap_or_default().contains("timeout"));
        assert_eq!(snapshots.features.version(), 0);
        assert!(Arc::ptr_eq(&previous, &snapshots.features.current()));
        assert!(matches!(orchestrator.state(JobKind::Daily), JobState::Failed { .. }));

        let again = orchestrator.trigger(JobKind::Daily, TriggerSource::Manual).await;
        assert!(matches!(again, TriggerOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_generation_untouched() {
        let listings = vec![listing(&[1])];
        let log = seeded_log(&listings).await;
        let catalog = Arc::new(GatedCatalog::new(MemoryCatalog::with_records(listings, Vec::new())));
        let orchestrator = Arc::new(Orchestrator::new(
            catalog.clone(),
            log,
            Arc::new(Snapshots::new()),
            RankingPolicy::default(),
            Duration::from_secs(30),
        ));
        assert!(!orchestrator.cancel(JobKind::Hourly));

        let run = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.trigger(JobKind::Hourly, TriggerSource::Manual).await })
        };
        catalog.entered.notified().await;
        assert!(orchestrator.cancel(JobKind::Hourly));
        catalog.release.notify_one();

        let outcome = run.await.expect("join");
        assert!(matches!(outcome, TriggerOutcome::Failed(_)));
        assert_eq!(orchestrator.snapshots().engagement.version(), 0);
    }

    #[tokio::test]
    async fn daily_run_writes_summary_and_parquet_manifest() {
        let dir = tempdir().expect("tempdir");
        let listings = vec![listing(&[1, 2]), listing(&[2])];
        let log = seeded_log(&listings).await;
        let reports = ReportWriter::new(
            dir.path().join("reports"),
            gigfeed_storage::ArtifactStore::new(dir.path().join("artifacts")),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryCatalog::with_records(listings, Vec::new())),
            log,
            Arc::new(Snapshots::new()),
            RankingPolicy::default(),
            Duration::from_secs(30),
        )
        .with_reports(reports.clone());

        let outcome = orchestrator.trigger(JobKind::Daily, TriggerSource::Manual).await;
        let summary = outcome.summary().expect("summary").clone();

        let run_dir = reports.run_dir(summary.run_id);
        assert!(run_dir.join("run_summary.json").exists());
        assert!(run_dir.join("snapshots").join("manifest.json").exists());
        assert!(dir.path().join("artifacts").join("features").exists());
        let written: RunSummary =
            serde_json::from_slice(&std::fs::read(run_dir.join("run_summary.json")).expect("read")).expect("parse");
        assert_eq!(written.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn timed_out_compute_is_joined_before_the_gate_is_released() {
        let cancel = CancelFlag::new();
        let finished = Arc::new(AtomicBool::new(false));
        let handle = {
            let cancel = cancel.clone();
            let finished = Arc::clone(&finished);
            tokio::task::spawn_blocking(move || -> Result<(), JobError> {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                // Unwinding after the flag flips still takes a while.
                std::thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
                cancel.check()
            })
        };
        let deadline = Instant::now() + Duration::from_millis(40);

        let result = join_within(handle, deadline, &cancel, Duration::from_millis(40)).await;

        assert!(matches!(result, Err(JobError::Timeout { .. })));
        assert!(finished.load(Ordering::SeqCst));
        assert!(cancel.is_cancelled());
    }
}
