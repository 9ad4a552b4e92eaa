use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{check_limit, FeedService, RankError};

pub const DEFAULT_PREFERENCE_LIMIT: usize = 10;
pub const MAX_PREFERENCE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceSource {
    /// Read from the published daily feature generation.
    FeatureVector,
    /// Tag frequency over the user's live positive history.
    LiveHistory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPreference {
    pub tag_id: u32,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPreferences {
    pub user_uid: Uuid,
    pub source: PreferenceSource,
    pub tags: Vec<TagPreference>,
}

fn top_tags(weights: &BTreeMap<u32, f64>, limit: usize) -> Vec<TagPreference> {
    let mut tags: Vec<TagPreference> = weights
        .iter()
        .filter(|(_, w)| **w > 0.0)
        .map(|(tag_id, weight)| TagPreference {
            tag_id: *tag_id,
            weight: *weight,
        })
        .collect();
    tags.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.tag_id.cmp(&b.tag_id)));
    tags.truncate(limit);
    tags
}

impl FeedService {
    /// Tags the user gravitates to, strongest first.
    pub async fn tag_preferences(&self, user_uid: Uuid, limit: usize) -> Result<TagPreferences, RankError> {
        check_limit(limit, MAX_PREFERENCE_LIMIT)?;

        let features = self.snapshots.features.current();
        if let Some(vector) = features
            .data
            .feature_vectors
            .get(&user_uid)
            .filter(|v| v.tag_weights.values().any(|w| *w > 0.0))
        {
            return Ok(TagPreferences {
                user_uid,
                source: PreferenceSource::FeatureVector,
                tags: top_tags(&vector.tag_weights, limit),
            });
        }

        let history = self.user_history(user_uid).await?;
        let listings = self.catalog.listings().await.map_err(RankError::Upstream)?;
        let mut weights: BTreeMap<u32, f64> = BTreeMap::new();
        for listing in listings.iter() {
            let Some(weight) = history.positive.get(&listing.id) else {
                continue;
            };
            for tag in &listing.tags {
                *weights.entry(*tag).or_default() += weight;
            }
        }
        let max = weights.values().copied().fold(0.0_f64, f64::max);
        if max > 0.0 {
            weights.values_mut().for_each(|w| *w /= max);
        }
        debug!(%user_uid, tags = weights.len(), "tag preferences from live history");
        Ok(TagPreferences {
            user_uid,
            source: PreferenceSource::LiveHistory,
            tags: top_tags(&weights, limit),
        })
    }
}
