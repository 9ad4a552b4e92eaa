use std::collections::BTreeMap;

use gigfeed_core::signals::jaccard;
use gigfeed_core::{Listing, ScoredListing};
use tracing::debug;
use uuid::Uuid;

use crate::feed::feed_order;
use crate::{check_limit, FeedService, RankError};

pub const MAX_SIMILAR_LIMIT: usize = 50;

fn as_scored(listing: &Listing, score: f64) -> ScoredListing {
    ScoredListing {
        listing: listing.clone(),
        recommendation_score: score,
        score_components: None,
        distance_km: None,
    }
}

impl FeedService {
    /// Top-N open listings by stored item similarity. Items with no open
    /// stored neighbour fall back to tag Jaccard. Unknown ids yield an empty list.
    pub async fn similar(&self, listing_id: Uuid, limit: usize) -> Result<Vec<ScoredListing>, RankError> {
        check_limit(limit, MAX_SIMILAR_LIMIT)?;
        let listings = self.catalog.listings().await.map_err(RankError::Upstream)?;
        let by_id: BTreeMap<Uuid, &Listing> = listings.iter().map(|l| (l.id, l)).collect();
        let Some(target) = by_id.get(&listing_id).copied() else {
            return Ok(Vec::new());
        };

        let features = self.snapshots.features.current();
        let mut results: Vec<ScoredListing> = features
            .data
            .item_neighbors
            .get(&listing_id)
            .into_iter()
            .flatten()
            .filter_map(|e| by_id.get(&e.neighbor_id).map(|l| (*l, e.score)))
            .filter(|(l, _)| l.is_open() && l.id != listing_id)
            .map(|(l, score)| as_scored(l, score))
            .collect();

        if results.is_empty() {
            debug!(%listing_id, "no open stored neighbours; falling back to tag overlap");
            results = listings
                .iter()
                .filter(|l| l.is_open() && l.id != listing_id)
                .map(|l| (l, jaccard(&target.tags, &l.tags)))
                .filter(|(_, score)| *score > 0.0)
                .map(|(l, score)| as_scored(l, score))
                .collect();
        }
        results.sort_by(feed_order);
        results.truncate(limit);
        Ok(results)
    }
}
