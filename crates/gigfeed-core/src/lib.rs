//! Core domain model for the gig marketplace feed engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod policy;
pub mod signals;

pub use policy::{
    ComponentWeights, EngagementParams, FeatureParams, FeedParams, InteractionWeights,
    RankingPolicy, TrendingParams,
};

pub const CRATE_NAME: &str = "gigfeed-core";

/// Synchronous rejections surfaced to callers. Cold-start conditions never land here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeedError {
    #[error("malformed user_uid `{0}`")]
    InvalidUserUid(String),
    #[error("malformed listing id `{0}`")]
    InvalidListingId(String),
    #[error("unknown interaction_type `{0}` (expected view, click, apply, save, share or dismiss)")]
    UnknownInteractionType(String),
    #[error("limit must be between 1 and {max}, got {got}")]
    InvalidLimit { got: usize, max: usize },
    #[error("{name} must be between {min} and {max}, got {got}")]
    InvalidWindow {
        name: &'static str,
        got: i64,
        min: i64,
        max: i64,
    },
    #[error("radius_km must be between {min} and {max}, got {got}")]
    InvalidRadius { got: f64, min: f64, max: f64 },
    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("invalid ranking policy: {0}")]
    InvalidPolicy(String),
    #[error("invalid feed preferences: {0}")]
    InvalidPreferences(String),
}

pub fn parse_user_uid(raw: &str) -> Result<Uuid, FeedError> {
    Uuid::parse_str(raw.trim()).map_err(|_| FeedError::InvalidUserUid(raw.to_string()))
}

pub fn parse_listing_id(raw: &str) -> Result<Uuid, FeedError> {
    Uuid::parse_str(raw.trim()).map_err(|_| FeedError::InvalidListingId(raw.to_string()))
}

/// Closed set of user-listing interactions. Weights live in [`InteractionWeights`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    View,
    Click,
    Apply,
    Save,
    Share,
    Dismiss,
}

impl InteractionType {
    pub const ALL: [InteractionType; 6] = [
        InteractionType::View,
        InteractionType::Click,
        InteractionType::Apply,
        InteractionType::Save,
        InteractionType::Share,
        InteractionType::Dismiss,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InteractionType::View => "view",
            InteractionType::Click => "click",
            InteractionType::Apply => "apply",
            InteractionType::Save => "save",
            InteractionType::Share => "share",
            InteractionType::Dismiss => "dismiss",
        }
    }

    /// Interactions that mark a listing as already seen by the user.
    pub fn marks_seen(self) -> bool {
        matches!(self, InteractionType::View | InteractionType::Click)
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionType {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        InteractionType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| FeedError::UnknownInteractionType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Open,
    InProgress,
    PendingConfirmation,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, FeedError> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if !valid {
            return Err(FeedError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Listing record as served by the catalog collaborator. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<u32>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub compensation: Option<f64>,
    pub poster_uid: Uuid,
    #[serde(default)]
    pub poster_rating: Option<f64>,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
}

impl Listing {
    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ListingStatus::Open
    }
}

/// User record as served by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub uid: Uuid,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub preferred_tags: BTreeSet<u32>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub max_distance_km: Option<f64>,
}

impl User {
    /// Stand-in profile for a uid the catalog does not know yet.
    pub fn anonymous(uid: Uuid) -> Self {
        Self {
            uid,
            latitude: None,
            longitude: None,
            preferred_tags: BTreeSet::new(),
            role: None,
            max_distance_km: None,
        }
    }

    pub fn location(&self) -> Option<GeoPoint> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoPoint {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// Append-only ground truth for every derived signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub user_uid: Uuid,
    pub listing_id: Uuid,
    pub interaction_type: InteractionType,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Exact-duplicate identity used by every aggregation.
pub type EventKey = (Uuid, Uuid, InteractionType, DateTime<Utc>);

impl InteractionEvent {
    pub fn new(
        user_uid: Uuid,
        listing_id: Uuid,
        interaction_type: InteractionType,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_uid,
            listing_id,
            interaction_type,
            occurred_at,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn dedup_key(&self) -> EventKey {
        (
            self.user_uid,
            self.listing_id,
            self.interaction_type,
            self.occurred_at,
        )
    }

    pub fn time_spent_seconds(&self) -> Option<f64> {
        self.metadata
            .get("time_spent_seconds")
            .and_then(serde_json::Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
    }
}

/// Range-scan filter over the event store. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub user_uid: Option<Uuid>,
    pub listing_id: Option<Uuid>,
    pub types: Option<Vec<InteractionType>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_user(user_uid: Uuid) -> Self {
        Self {
            user_uid: Some(user_uid),
            ..Self::default()
        }
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &InteractionEvent) -> bool {
        self.user_uid.map_or(true, |u| u == event.user_uid)
            && self.listing_id.map_or(true, |l| l == event.listing_id)
            && self
                .types
                .as_ref()
                .map_or(true, |types| types.contains(&event.interaction_type))
            && self.since.map_or(true, |s| event.occurred_at >= s)
            && self.until.map_or(true, |u| event.occurred_at < u)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserFeatureVector {
    pub user_uid: Uuid,
    pub tag_weights: BTreeMap<u32, f64>,
    pub interaction_count: usize,
    pub activity_level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityKind {
    UserUser,
    ItemItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEntry {
    pub subject_id: Uuid,
    pub neighbor_id: Uuid,
    pub kind: SimilarityKind,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub listing_id: Uuid,
    pub view_count: u64,
    pub click_count: u64,
    pub apply_count: u64,
    pub save_count: u64,
    pub share_count: u64,
    pub dismiss_count: u64,
    pub avg_time_spent_seconds: f64,
    pub engagement_score: f64,
    pub trending_score: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl EngagementMetrics {
    pub fn record(&mut self, interaction_type: InteractionType) {
        let slot = match interaction_type {
            InteractionType::View => &mut self.view_count,
            InteractionType::Click => &mut self.click_count,
            InteractionType::Apply => &mut self.apply_count,
            InteractionType::Save => &mut self.save_count,
            InteractionType::Share => &mut self.share_count,
            InteractionType::Dismiss => &mut self.dismiss_count,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendingEntry {
    pub rank: usize,
    pub listing_id: Uuid,
    pub score: f64,
    pub velocity: f64,
    pub interaction_count: usize,
}

/// Daily-job output: feature vectors plus the user/item neighbour tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureGeneration {
    pub generation_id: Uuid,
    pub computed_at: Option<DateTime<Utc>>,
    pub feature_vectors: BTreeMap<Uuid, UserFeatureVector>,
    pub user_neighbors: BTreeMap<Uuid, Vec<SimilarityEntry>>,
    pub item_neighbors: BTreeMap<Uuid, Vec<SimilarityEntry>>,
    /// Positive user→listing affinity in [0,1], normalised per user.
    pub positive_affinity: BTreeMap<Uuid, BTreeMap<Uuid, f64>>,
}

impl FeatureGeneration {
    pub fn item_similarity(&self, subject: Uuid, neighbor: Uuid) -> f64 {
        self.item_neighbors
            .get(&subject)
            .and_then(|entries| entries.iter().find(|e| e.neighbor_id == neighbor))
            .map(|e| e.score)
            .unwrap_or(0.0)
    }
}

/// Hourly-job output.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngagementGeneration {
    pub generation_id: Uuid,
    pub computed_at: Option<DateTime<Utc>>,
    pub lookback_hours: i64,
    pub scores: BTreeMap<Uuid, f64>,
    pub metrics: BTreeMap<Uuid, EngagementMetrics>,
}

impl EngagementGeneration {
    pub fn score(&self, listing_id: Uuid) -> f64 {
        self.scores.get(&listing_id).copied().unwrap_or(0.0)
    }
}

/// Frequent-job output, fully replaced on each run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrendingGeneration {
    pub generation_id: Uuid,
    pub computed_at: Option<DateTime<Utc>>,
    pub window_hours: i64,
    pub entries: Vec<TrendingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub user_uid: Uuid,
    pub limit: usize,
    pub offset: usize,
    pub exclude_seen: bool,
    pub exclude_applied: bool,
}

impl FeedRequest {
    pub fn new(user_uid: Uuid, limit: usize) -> Self {
        Self {
            user_uid,
            limit,
            offset: 0,
            exclude_seen: true,
            exclude_applied: true,
        }
    }
}

pub const MAX_PREFERRED_DISTANCE_KM: f64 = 1_000.0;

fn personalization_default() -> bool {
    true
}

/// Per-user feed settings. Absent records behave like [`FeedPreferences::defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPreferences {
    pub user_uid: Uuid,
    #[serde(default)]
    pub max_distance_km: Option<f64>,
    #[serde(default)]
    pub preferred_compensation_min: Option<f64>,
    #[serde(default)]
    pub preferred_compensation_max: Option<f64>,
    #[serde(default)]
    pub blocked_tags: BTreeSet<u32>,
    #[serde(default)]
    pub blocked_users: BTreeSet<Uuid>,
    #[serde(default = "personalization_default")]
    pub personalization_enabled: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl FeedPreferences {
    pub fn defaults(user_uid: Uuid) -> Self {
        Self {
            user_uid,
            max_distance_km: None,
            preferred_compensation_min: None,
            preferred_compensation_max: None,
            blocked_tags: BTreeSet::new(),
            blocked_users: BTreeSet::new(),
            personalization_enabled: true,
            updated_at: None,
        }
    }

    /// Candidate filter. A compensation bound excludes listings that state no
    /// compensation at all.
    pub fn admits(&self, listing: &Listing) -> bool {
        if self.blocked_users.contains(&listing.poster_uid) {
            return false;
        }
        if !self.blocked_tags.is_disjoint(&listing.tags) {
            return false;
        }
        let bounded = self.preferred_compensation_min.is_some() || self.preferred_compensation_max.is_some();
        match listing.compensation {
            Some(pay) => {
                self.preferred_compensation_min.map_or(true, |min| pay >= min)
                    && self.preferred_compensation_max.map_or(true, |max| pay <= max)
            }
            None => !bounded,
        }
    }

    /// Merges a partial update; the merged record must still be valid.
    pub fn apply(&mut self, update: FeedPreferencesUpdate, now: DateTime<Utc>) -> Result<(), FeedError> {
        let mut merged = self.clone();
        if let Some(km) = update.max_distance_km {
            merged.max_distance_km = Some(km);
        }
        if let Some(min) = update.preferred_compensation_min {
            merged.preferred_compensation_min = Some(min);
        }
        if let Some(max) = update.preferred_compensation_max {
            merged.preferred_compensation_max = Some(max);
        }
        if let Some(tags) = update.blocked_tags {
            merged.blocked_tags = tags;
        }
        if let Some(users) = update.blocked_users {
            merged.blocked_users = users;
        }
        if let Some(enabled) = update.personalization_enabled {
            merged.personalization_enabled = enabled;
        }
        merged.validate()?;
        merged.updated_at = Some(now);
        *self = merged;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if let Some(km) = self.max_distance_km {
            if !(km.is_finite() && km > 0.0 && km <= MAX_PREFERRED_DISTANCE_KM) {
                return Err(FeedError::InvalidPreferences(format!(
                    "max_distance_km must be in (0, {MAX_PREFERRED_DISTANCE_KM}], got {km}"
                )));
            }
        }
        for (name, bound) in [
            ("preferred_compensation_min", self.preferred_compensation_min),
            ("preferred_compensation_max", self.preferred_compensation_max),
        ] {
            if let Some(value) = bound.filter(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(FeedError::InvalidPreferences(format!("{name} must be >= 0, got {value}")));
            }
        }
        if let (Some(min), Some(max)) = (self.preferred_compensation_min, self.preferred_compensation_max) {
            if min > max {
                return Err(FeedError::InvalidPreferences(format!(
                    "preferred_compensation_min {min} exceeds preferred_compensation_max {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Partial update; `None` leaves a field as it is. Lists replace wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedPreferencesUpdate {
    pub max_distance_km: Option<f64>,
    pub preferred_compensation_min: Option<f64>,
    pub preferred_compensation_max: Option<f64>,
    pub blocked_tags: Option<BTreeSet<u32>>,
    pub blocked_users: Option<BTreeSet<Uuid>>,
    pub personalization_enabled: Option<bool>,
}

/// Per-component breakdown, each value in [0,1] before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub location: f64,
    pub tags: f64,
    pub engagement: f64,
    pub recency: f64,
    pub poster_quality: f64,
    pub collaborative: f64,
    pub content: f64,
}

impl ScoreComponents {
    pub fn values(&self) -> [f64; 7] {
        [
            self.location,
            self.tags,
            self.engagement,
            self.recency,
            self.poster_quality,
            self.collaborative,
            self.content,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredListing {
    #[serde(flatten)]
    pub listing: Listing,
    pub recommendation_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_components: Option<ScoreComponents>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}
