//! Versioned snapshot cells. Readers always resolve one immutable generation;
//! publishing swaps the pointer in a single step.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use gigfeed_core::{EngagementGeneration, FeatureGeneration, TrendingGeneration};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Generation<T> {
    /// 0 is the empty bootstrap generation served before any job has published.
    pub version: u64,
    pub published_at: Option<DateTime<Utc>>,
    pub data: T,
}

#[derive(Debug)]
pub struct GenerationCell<T> {
    current: RwLock<Arc<Generation<T>>>,
}

impl<T: Default> Default for GenerationCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> GenerationCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation {
                version: 0,
                published_at: None,
                data: initial,
            })),
        }
    }

    pub fn current(&self) -> Arc<Generation<T>> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    /// Installs a fully built generation and returns its version.
    pub fn publish(&self, data: T, published_at: DateTime<Utc>) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let version = guard.version + 1;
        *guard = Arc::new(Generation {
            version,
            published_at: Some(published_at),
            data,
        });
        version
    }
}

/// The three derived tables served to the online read paths.
#[derive(Debug, Default)]
pub struct Snapshots {
    pub features: GenerationCell<FeatureGeneration>,
    pub engagement: GenerationCell<EngagementGeneration>,
    pub trending: GenerationCell<TrendingGeneration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotVersions {
    pub features: u64,
    pub engagement: u64,
    pub trending: u64,
}

impl Snapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self) -> SnapshotVersions {
        SnapshotVersions {
            features: self.features.version(),
            engagement: self.engagement.version(),
            trending: self.trending.version(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn readers_keep_their_generation_across_publish() {
        let cell: GenerationCell<Vec<u32>> = GenerationCell::new(vec![1]);
        let before = cell.current();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap();

        let version = cell.publish(vec![2, 3], at);

        assert_eq!(version, 1);
        assert_eq!(before.version, 0);
        assert_eq!(before.data, vec![1]);
        let after = cell.current();
        assert_eq!(after.data, vec![2, 3]);
        assert_eq!(after.published_at, Some(at));
    }

    #[test]
    fn fresh_snapshots_start_at_bootstrap_version() {
        let snapshots = Snapshots::new();
        assert_eq!(
            snapshots.versions(),
            SnapshotVersions {
                features: 0,
                engagement: 0,
                trending: 0
            }
        );
        assert!(snapshots.trending.current().data.entries.is_empty());
    }
}
