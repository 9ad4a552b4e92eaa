use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use gigfeed_core::signals::rank_by_velocity;
use gigfeed_core::{EventFilter, Listing, ScoredListing, TrendingEntry};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{check_limit, check_window, FeedService, RankError};

pub const MAX_TRENDING_LIMIT: usize = 100;
pub const MAX_TRENDING_HOURS: i64 = 168;

impl FeedService {
    /// Trending open listings over the last `hours`.
    ///
    /// The published generation answers requests for its own window. Other
    /// windows are ranked live; an unreachable event store falls back to the
    /// published list.
    pub async fn trending(
        &self,
        limit: usize,
        hours: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredListing>, RankError> {
        check_limit(limit, MAX_TRENDING_LIMIT)?;
        check_window("hours", hours, 1, MAX_TRENDING_HOURS)?;

        let listings = self.catalog.listings().await.map_err(RankError::Upstream)?;
        let by_id: BTreeMap<Uuid, &Listing> = listings.iter().filter(|l| l.is_open()).map(|l| (l.id, l)).collect();

        let snapshot = self.snapshots.trending.current();
        let entries: Vec<TrendingEntry> = if hours == snapshot.data.window_hours {
            snapshot.data.entries.clone()
        } else {
            let window_start = now - Duration::hours(hours);
            match self.log.query(&EventFilter::since(window_start)).await {
                Ok(events) => {
                    let open: Vec<_> = events.into_iter().filter(|e| by_id.contains_key(&e.listing_id)).collect();
                    rank_by_velocity(&open, &self.policy.interaction_weights, window_start, now, usize::MAX)
                }
                Err(err) => {
                    warn!(hours, error = %format!("{err:#}"), "live trending read failed; serving published list");
                    snapshot.data.entries.clone()
                }
            }
        };

        let results: Vec<ScoredListing> = entries
            .iter()
            .filter_map(|entry| {
                by_id.get(&entry.listing_id).map(|listing| ScoredListing {
                    listing: (*listing).clone(),
                    recommendation_score: entry.score,
                    score_components: None,
                    distance_km: None,
                })
            })
            .take(limit)
            .collect();
        debug!(hours, returned = results.len(), trending_version = snapshot.version, "trending served");
        Ok(results)
    }
}
