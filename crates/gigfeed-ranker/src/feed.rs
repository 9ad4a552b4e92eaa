//! Personalised feed: candidate generation, seven-component scoring,
//! deterministic ordering and offset/limit pagination.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use gigfeed_core::signals::{
    clamp_unit, dedup_events, haversine_km, jaccard, location_score, poster_quality_score, recency_score,
};
use gigfeed_core::{
    EngagementGeneration, EventFilter, FeatureGeneration, FeedPreferences, FeedRequest, InteractionEvent,
    InteractionType, Listing, ScoreComponents, ScoredListing, User,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{check_limit, FeedService, RankError};

/// Seven-component weighted blend.
pub const HYBRID_ALGORITHM: &str = "hybrid_v1";
/// Used when the user switched personalization off: half engagement, half recency.
pub const FALLBACK_ALGORITHM: &str = "recency_engagement_v1";

/// One served feed position, logged under the `gigfeed_ranker::impressions` target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedImpression {
    pub user_uid: Uuid,
    pub listing_id: Uuid,
    pub position: usize,
    pub score: f64,
    pub algorithm: &'static str,
}

/// Impressions for a served page; positions are absolute, starting at `offset`.
pub fn page_impressions(
    user_uid: Uuid,
    page: &[ScoredListing],
    offset: usize,
    algorithm: &'static str,
) -> Vec<FeedImpression> {
    page.iter()
        .enumerate()
        .map(|(i, item)| FeedImpression {
            user_uid,
            listing_id: item.listing.id,
            position: offset + i,
            score: item.recommendation_score,
            algorithm,
        })
        .collect()
}

/// What the user has already done, derived from deduplicated live history.
#[derive(Debug, Default)]
pub(crate) struct UserHistory {
    pub seen: BTreeSet<Uuid>,
    pub applied: BTreeSet<Uuid>,
    /// Listing → summed positive interaction weight.
    pub positive: BTreeMap<Uuid, f64>,
}

impl UserHistory {
    pub(crate) fn from_events(events: Vec<InteractionEvent>, service: &FeedService) -> Self {
        let mut history = Self::default();
        for event in dedup_events(events) {
            if event.interaction_type.marks_seen() {
                history.seen.insert(event.listing_id);
            }
            if event.interaction_type == InteractionType::Apply {
                history.applied.insert(event.listing_id);
            }
            let weight = service.policy.weight(event.interaction_type);
            if weight > 0.0 {
                *history.positive.entry(event.listing_id).or_default() += weight;
            }
        }
        history
    }
}

/// Everything one scoring pass reads, resolved once per request.
struct ScoringContext<'a> {
    service: &'a FeedService,
    user: &'a User,
    prefs: &'a FeedPreferences,
    history: &'a UserHistory,
    features: &'a FeatureGeneration,
    engagement: &'a EngagementGeneration,
    now: DateTime<Utc>,
}

impl ScoringContext<'_> {
    /// Saved feed setting, then the profile value, then the policy default.
    fn radius_km(&self) -> f64 {
        self.prefs
            .max_distance_km
            .or(self.user.max_distance_km)
            .filter(|r| r.is_finite() && *r > 0.0)
            .unwrap_or(self.service.policy.feed.location_radius_km)
    }

    /// Σ sim·affinity over stored neighbours, normalised by similarity mass.
    fn collaborative(&self, listing_id: Uuid) -> f64 {
        let Some(neighbors) = self.features.user_neighbors.get(&self.user.uid) else {
            return 0.0;
        };
        let mut weighted = 0.0;
        let mut mass = 0.0;
        for entry in neighbors {
            mass += entry.score;
            let affinity = self
                .features
                .positive_affinity
                .get(&entry.neighbor_id)
                .and_then(|row| row.get(&listing_id))
                .copied()
                .unwrap_or(0.0);
            weighted += entry.score * affinity;
        }
        if mass > 0.0 {
            clamp_unit(weighted / mass)
        } else {
            0.0
        }
    }

    /// Weighted mean item similarity to the user's positive history.
    fn content(&self, listing_id: Uuid) -> f64 {
        if self.history.positive.is_empty() {
            return 0.0;
        }
        let similar: BTreeMap<Uuid, f64> = self
            .features
            .item_neighbors
            .get(&listing_id)
            .map(|entries| entries.iter().map(|e| (e.neighbor_id, e.score)).collect())
            .unwrap_or_default();
        let total: f64 = self.history.positive.values().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = self
            .history
            .positive
            .iter()
            .filter(|(id, _)| **id != listing_id)
            .map(|(id, weight)| weight * similar.get(id).copied().unwrap_or(0.0))
            .sum();
        clamp_unit(weighted / total)
    }

    fn score(&self, listing: &Listing) -> ScoredListing {
        if self.prefs.personalization_enabled {
            self.personalized(listing)
        } else {
            self.unpersonalized(listing)
        }
    }

    /// Only listing-side signals; user-derived components stay at zero.
    fn unpersonalized(&self, listing: &Listing) -> ScoredListing {
        let components = ScoreComponents {
            engagement: clamp_unit(self.engagement.score(listing.id)),
            recency: recency_score(listing.created_at, self.now, self.service.policy.feed.recency_decay_days),
            ..ScoreComponents::default()
        };
        ScoredListing {
            listing: listing.clone(),
            recommendation_score: clamp_unit(0.5 * components.engagement + 0.5 * components.recency),
            score_components: Some(components),
            distance_km: match (self.user.location(), listing.location()) {
                (Some(u), Some(l)) => Some(haversine_km(u, l)),
                _ => None,
            },
        }
    }

    fn personalized(&self, listing: &Listing) -> ScoredListing {
        let user_location = self.user.location();
        let listing_location = listing.location();
        let policy = &self.service.policy;
        let components = ScoreComponents {
            location: location_score(user_location, listing_location, self.radius_km()),
            tags: jaccard(&self.user.preferred_tags, &listing.tags),
            engagement: clamp_unit(self.engagement.score(listing.id)),
            recency: recency_score(listing.created_at, self.now, policy.feed.recency_decay_days),
            poster_quality: poster_quality_score(listing.poster_rating),
            collaborative: self.collaborative(listing.id),
            content: self.content(listing.id),
        };
        let distance_km = match (user_location, listing_location) {
            (Some(u), Some(l)) => Some(haversine_km(u, l)),
            _ => None,
        };
        ScoredListing {
            listing: listing.clone(),
            recommendation_score: policy.component_weights.combine(&components),
            score_components: Some(components),
            distance_km,
        }
    }
}

/// Score desc, then newest first, then id so the order is total.
pub(crate) fn feed_order(a: &ScoredListing, b: &ScoredListing) -> Ordering {
    b.recommendation_score
        .total_cmp(&a.recommendation_score)
        .then_with(|| b.listing.created_at.cmp(&a.listing.created_at))
        .then_with(|| a.listing.id.cmp(&b.listing.id))
}

impl FeedService {
    pub(crate) async fn resolve_user(&self, uid: Uuid) -> Result<User, RankError> {
        Ok(self
            .catalog
            .user(uid)
            .await
            .map_err(RankError::Upstream)?
            .unwrap_or_else(|| User::anonymous(uid)))
    }

    pub(crate) async fn user_history(&self, uid: Uuid) -> Result<UserHistory, RankError> {
        let events = self
            .log
            .query(&EventFilter::for_user(uid))
            .await
            .map_err(RankError::Upstream)?;
        Ok(UserHistory::from_events(events, self))
    }

    /// Ranked, filtered, paginated feed for one user.
    ///
    /// Missing batch generations degrade to zero components; only invalid
    /// requests and unreachable collaborators are errors.
    pub async fn feed(&self, request: &FeedRequest, now: DateTime<Utc>) -> Result<Vec<ScoredListing>, RankError> {
        check_limit(request.limit, self.policy.feed.max_limit)?;

        let user = self.resolve_user(request.user_uid).await?;
        let prefs = self.feed_preferences(request.user_uid).await?;
        let history = self.user_history(request.user_uid).await?;
        let listings = self.catalog.listings().await.map_err(RankError::Upstream)?;

        let features = self.snapshots.features.current();
        let engagement = self.snapshots.engagement.current();
        let ctx = ScoringContext {
            service: self,
            user: &user,
            prefs: &prefs,
            history: &history,
            features: &features.data,
            engagement: &engagement.data,
            now,
        };

        let mut scored: Vec<ScoredListing> = listings
            .iter()
            .filter(|l| l.is_open())
            .filter(|l| l.poster_uid != user.uid)
            .filter(|l| prefs.admits(l))
            .filter(|l| !(request.exclude_seen && history.seen.contains(&l.id)))
            .filter(|l| !(request.exclude_applied && history.applied.contains(&l.id)))
            .map(|l| ctx.score(l))
            .collect();
        scored.sort_by(feed_order);

        let candidates = scored.len();
        let page: Vec<ScoredListing> = scored
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .collect();
        let algorithm = if prefs.personalization_enabled {
            HYBRID_ALGORITHM
        } else {
            FALLBACK_ALGORITHM
        };
        debug!(
            user_uid = %request.user_uid,
            candidates,
            returned = page.len(),
            algorithm,
            features_version = features.version,
            engagement_version = engagement.version,
            "feed scored"
        );
        for impression in page_impressions(request.user_uid, &page, request.offset, algorithm) {
            info!(
                target: "gigfeed_ranker::impressions",
                user_uid = %impression.user_uid,
                listing_id = %impression.listing_id,
                position = impression.position,
                score = impression.score,
                algorithm = impression.algorithm,
                "feed impression"
            );
        }
        Ok(page)
    }
}
