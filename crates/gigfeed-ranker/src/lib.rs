//! Online read paths: ranked feed, similar listings, trending, nearby search,
//! learned tag preferences and interaction history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gigfeed_core::{EngagementMetrics, FeedError, FeedPreferences, FeedPreferencesUpdate, InteractionEvent, RankingPolicy};
use gigfeed_storage::{Catalog, FeedPreferenceStore, InteractionLog, MemoryFeedPreferenceStore, Snapshots};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod feed;
pub mod history;
pub mod nearby;
pub mod preferences;
pub mod similar;
pub mod trending;

pub use history::HistoryQuery;
pub use nearby::NearbyQuery;
pub use preferences::{PreferenceSource, TagPreference, TagPreferences};

pub const CRATE_NAME: &str = "gigfeed-ranker";

#[derive(Debug, Error)]
pub enum RankError {
    #[error(transparent)]
    Invalid(#[from] FeedError),
    #[error("upstream read failed: {0:#}")]
    Upstream(anyhow::Error),
    #[error("interaction store write failed: {0:#}")]
    EventStore(anyhow::Error),
    #[error("preference store write failed: {0:#}")]
    PreferenceStore(anyhow::Error),
}

/// Shared handle over the collaborators and published generations. Cheap to
/// clone; every method is read-only apart from [`FeedService::record`].
#[derive(Clone)]
pub struct FeedService {
    catalog: Arc<dyn Catalog>,
    log: Arc<dyn InteractionLog>,
    preferences: Arc<dyn FeedPreferenceStore>,
    snapshots: Arc<Snapshots>,
    policy: RankingPolicy,
}

impl FeedService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        log: Arc<dyn InteractionLog>,
        snapshots: Arc<Snapshots>,
        policy: RankingPolicy,
    ) -> Self {
        Self {
            catalog,
            log,
            preferences: Arc::new(MemoryFeedPreferenceStore::new()),
            snapshots,
            policy,
        }
    }

    pub fn with_preferences(mut self, preferences: Arc<dyn FeedPreferenceStore>) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn policy(&self) -> &RankingPolicy {
        &self.policy
    }

    pub fn snapshots(&self) -> &Arc<Snapshots> {
        &self.snapshots
    }

    /// Appends one event. The only hard-failing write path.
    pub async fn record(&self, event: InteractionEvent) -> Result<(), RankError> {
        debug!(user_uid = %event.user_uid, listing_id = %event.listing_id, kind = %event.interaction_type, "recording interaction");
        self.log.append(event).await.map_err(RankError::EventStore)
    }

    /// Stored feed settings, or the defaults for a user who never saved any.
    pub async fn feed_preferences(&self, user_uid: Uuid) -> Result<FeedPreferences, RankError> {
        Ok(self
            .preferences
            .get(user_uid)
            .await
            .map_err(RankError::Upstream)?
            .unwrap_or_else(|| FeedPreferences::defaults(user_uid)))
    }

    /// Merges `update` into the stored record. Invalid merges change nothing.
    pub async fn update_feed_preferences(
        &self,
        user_uid: Uuid,
        update: FeedPreferencesUpdate,
        now: DateTime<Utc>,
    ) -> Result<FeedPreferences, RankError> {
        let mut prefs = self.feed_preferences(user_uid).await?;
        prefs.apply(update, now)?;
        self.preferences.put(&prefs).await.map_err(RankError::PreferenceStore)?;
        debug!(%user_uid, personalization = prefs.personalization_enabled, "feed preferences updated");
        Ok(prefs)
    }

    /// Latest published metrics for one listing.
    pub fn metrics(&self, listing_id: Uuid) -> Option<EngagementMetrics> {
        self.snapshots.engagement.current().data.metrics.get(&listing_id).cloned()
    }
}

pub(crate) fn check_limit(limit: usize, max: usize) -> Result<(), FeedError> {
    if limit == 0 || limit > max {
        return Err(FeedError::InvalidLimit { got: limit, max });
    }
    Ok(())
}

pub(crate) fn check_window(name: &'static str, got: i64, min: i64, max: i64) -> Result<(), FeedError> {
    if got < min || got > max {
        return Err(FeedError::InvalidWindow { name, got, min, max });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use gigfeed_core::{InteractionType, Listing, ListingStatus, User};
    use gigfeed_storage::{MemoryCatalog, MemoryInteractionLog};
    use std::collections::BTreeSet;

    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap()
    }

    pub fn listing(tags: &[u32], days_old: i64, location: Option<(f64, f64)>) -> Listing {
        Listing {
            id: Uuid::new_v4(),
            name: "gig".into(),
            description: None,
            tags: tags.iter().copied().collect::<BTreeSet<_>>(),
            latitude: location.map(|l| l.0),
            longitude: location.map(|l| l.1),
            compensation: Some(500.0),
            poster_uid: Uuid::new_v4(),
            poster_rating: Some(4.0),
            status: ListingStatus::Open,
            created_at: now() - chrono::Duration::days(days_old),
        }
    }

    pub fn user(tags: &[u32], location: Option<(f64, f64)>) -> User {
        User {
            uid: Uuid::new_v4(),
            latitude: location.map(|l| l.0),
            longitude: location.map(|l| l.1),
            preferred_tags: tags.iter().copied().collect(),
            role: None,
            max_distance_km: None,
        }
    }

    pub fn event(user: &User, listing: &Listing, kind: InteractionType, hours_ago: i64) -> InteractionEvent {
        InteractionEvent::new(user.uid, listing.id, kind, now() - chrono::Duration::hours(hours_ago))
    }

    pub struct Fixture {
        pub catalog: Arc<MemoryCatalog>,
        pub log: Arc<MemoryInteractionLog>,
        pub snapshots: Arc<Snapshots>,
        pub service: FeedService,
    }

    pub fn fixture(listings: Vec<Listing>, users: Vec<User>) -> Fixture {
        let catalog = Arc::new(MemoryCatalog::with_records(listings, users));
        let log = Arc::new(MemoryInteractionLog::new());
        let snapshots = Arc::new(Snapshots::new());
        let service = FeedService::new(
            catalog.clone(),
            log.clone(),
            Arc::clone(&snapshots),
            RankingPolicy::default(),
        );
        Fixture {
            catalog,
            log,
            snapshots,
            service,
        }
    }

    impl Fixture {
        pub async fn record_all(&self, events: impl IntoIterator<Item = InteractionEvent>) {
            for e in events {
                self.service.record(e).await.expect("record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use gigfeed_core::{EngagementGeneration, InteractionType};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn recorded_events_reach_the_log() {
        let gig = listing(&[1], 1, None);
        let worker = user(&[1], None);
        let fx = fixture(vec![gig.clone()], vec![worker.clone()]);
        fx.record_all([event(&worker, &gig, InteractionType::Save, 1)]).await;
        assert_eq!(fx.log.len(), 1);
    }

    #[test]
    fn metrics_come_from_the_published_engagement_generation() {
        let gig = listing(&[1], 1, None);
        let fx = fixture(vec![gig.clone()], Vec::new());
        assert!(fx.service.metrics(gig.id).is_none());

        let metric = EngagementMetrics {
            listing_id: gig.id,
            view_count: 3,
            ..EngagementMetrics::default()
        };
        fx.snapshots.engagement.publish(
            EngagementGeneration {
                metrics: BTreeMap::from([(gig.id, metric)]),
                ..EngagementGeneration::default()
            },
            now(),
        );
        assert_eq!(fx.service.metrics(gig.id).map(|m| m.view_count), Some(3));
    }

    #[test]
    fn limit_and_window_bounds_are_inclusive() {
        assert!(check_limit(1, 100).is_ok());
        assert!(check_limit(100, 100).is_ok());
        assert_eq!(check_limit(0, 100), Err(FeedError::InvalidLimit { got: 0, max: 100 }));
        assert!(check_window("hours", 168, 1, 168).is_ok());
        assert!(check_window("hours", 169, 1, 168).is_err());
    }

    #[tokio::test]
    async fn preference_updates_persist_and_invalid_ones_change_nothing() {
        let fx = fixture(Vec::new(), Vec::new());
        let uid = Uuid::new_v4();
        assert_eq!(
            fx.service.feed_preferences(uid).await.expect("defaults"),
            FeedPreferences::defaults(uid)
        );

        let saved = fx
            .service
            .update_feed_preferences(
                uid,
                FeedPreferencesUpdate {
                    blocked_tags: Some([3, 4].into()),
                    ..FeedPreferencesUpdate::default()
                },
                now(),
            )
            .await
            .expect("update");
        assert_eq!(saved.updated_at, Some(now()));

        let err = fx
            .service
            .update_feed_preferences(
                uid,
                FeedPreferencesUpdate {
                    max_distance_km: Some(-1.0),
                    ..FeedPreferencesUpdate::default()
                },
                now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RankError::Invalid(FeedError::InvalidPreferences(_))));
        assert_eq!(fx.service.feed_preferences(uid).await.expect("stored"), saved);
    }
}
