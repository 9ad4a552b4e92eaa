//! Batch recomputation of feed signals and the orchestration around it.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gigfeed_core::FeedError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod engagement;
pub mod engine;
pub mod features;
pub mod orchestrator;
pub mod reports;
pub mod sample;
pub mod schedule;
pub mod trending;

pub use config::{load_policy, EngineConfig};
pub use engine::Engine;
pub use orchestrator::{
    JobState, JobStatus, Orchestrator, RunStats, RunStatus, RunSummary, StatusReport, TriggerOutcome,
    TriggerSource,
};
pub use reports::ReportWriter;
pub use sample::{seed_sample_data, SampleData, SampleDataGenerator, SeedSummary};
pub use schedule::{maybe_build_scheduler, start_scheduler};

pub const CRATE_NAME: &str = "gigfeed-jobs";

/// The three job classes. Runs of the same class never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Feature vectors and similarity tables.
    Daily,
    /// Engagement scores and metrics.
    Hourly,
    /// Trending list.
    Frequent,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Daily, JobKind::Hourly, JobKind::Frequent];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Daily => "daily",
            JobKind::Hourly => "hourly",
            JobKind::Frequent => "frequent",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown task_type `{0}` (expected daily, hourly or frequent)")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(JobKind::Daily),
            "hourly" => Ok(JobKind::Hourly),
            "frequent" => Ok(JobKind::Frequent),
            _ => Err(UnknownJobKind(s.to_string())),
        }
    }
}

/// Why a run ended without publishing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error("run exceeded its {secs}s timeout")]
    Timeout { secs: u64 },
    #[error("run was cancelled")]
    Cancelled,
    #[error("upstream read failed: {0}")]
    Upstream(String),
    #[error("computation failed: {0}")]
    Compute(String),
    #[error(transparent)]
    Policy(#[from] FeedError),
}

impl JobError {
    pub fn upstream(err: anyhow::Error) -> Self {
        JobError::Upstream(format!("{err:#}"))
    }
}

/// Cooperative cancellation shared between the orchestrator and a running computation.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

/// Loop iterations between cancellation checks inside the batch builders.
pub(crate) const CANCEL_STRIDE: usize = 1024;

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}
