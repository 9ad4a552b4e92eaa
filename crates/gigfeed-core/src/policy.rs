//! Ranking policy: interaction weights, component weights and decay parameters.

use serde::{Deserialize, Serialize};

use crate::{FeedError, InteractionType, ScoreComponents};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionWeights {
    pub view: f64,
    pub click: f64,
    pub apply: f64,
    pub save: f64,
    pub share: f64,
    pub dismiss: f64,
}

impl Default for InteractionWeights {
    fn default() -> Self {
        Self {
            view: 1.0,
            click: 2.0,
            apply: 10.0,
            save: 5.0,
            share: 3.0,
            dismiss: -5.0,
        }
    }
}

impl InteractionWeights {
    pub fn weight(&self, interaction_type: InteractionType) -> f64 {
        match interaction_type {
            InteractionType::View => self.view,
            InteractionType::Click => self.click,
            InteractionType::Apply => self.apply,
            InteractionType::Save => self.save,
            InteractionType::Share => self.share,
            InteractionType::Dismiss => self.dismiss,
        }
    }

    pub fn is_positive(&self, interaction_type: InteractionType) -> bool {
        self.weight(interaction_type) > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentWeights {
    pub location: f64,
    pub tags: f64,
    pub engagement: f64,
    pub recency: f64,
    pub poster_quality: f64,
    pub collaborative: f64,
    pub content: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            location: 0.15,
            tags: 0.20,
            engagement: 0.15,
            recency: 0.10,
            poster_quality: 0.10,
            collaborative: 0.15,
            content: 0.15,
        }
    }
}

impl ComponentWeights {
    fn as_array(&self) -> [f64; 7] {
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

    pub fn validate(&self) -> Result<(), FeedError> {
        let weights = self.as_array();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(FeedError::InvalidPolicy(
                "component weights must be finite and non-negative".into(),
            ));
        }
        let total: f64 = weights.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(FeedError::InvalidPolicy(format!(
                "component weights must sum to 1, got {total}"
            )));
        }
        Ok(())
    }

    /// Weighted linear blend, clipped to [0,1].
    pub fn combine(&self, components: &ScoreComponents) -> f64 {
        let score: f64 = self
            .as_array()
            .iter()
            .zip(components.values())
            .map(|(w, c)| w * c)
            .sum();
        score.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureParams {
    pub half_life_days: f64,
    pub lookback_days: i64,
    pub top_k: usize,
    pub min_similarity: f64,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            half_life_days: 14.0,
            lookback_days: 90,
            top_k: 50,
            min_similarity: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementParams {
    pub lookback_hours: i64,
    pub half_life_hours: f64,
    pub saturation: f64,
}

impl Default for EngagementParams {
    fn default() -> Self {
        Self {
            lookback_hours: 72,
            half_life_hours: 24.0,
            saturation: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendingParams {
    pub window_hours: i64,
    pub size: usize,
}

impl Default for TrendingParams {
    fn default() -> Self {
        Self {
            window_hours: 24,
            size: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedParams {
    pub recency_decay_days: f64,
    pub location_radius_km: f64,
    pub default_limit: usize,
    pub max_limit: usize,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            recency_decay_days: 10.0,
            location_radius_km: 25.0,
            default_limit: 50,
            max_limit: 100,
        }
    }
}

/// Every policy knob the engine reads. Loaded from YAML, defaults when absent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingPolicy {
    pub component_weights: ComponentWeights,
    pub interaction_weights: InteractionWeights,
    pub features: FeatureParams,
    pub engagement: EngagementParams,
    pub trending: TrendingParams,
    pub feed: FeedParams,
}

impl RankingPolicy {
    pub fn from_yaml_str(text: &str) -> Result<Self, FeedError> {
        let policy: RankingPolicy = serde_yaml::from_str(text)
            .map_err(|err| FeedError::InvalidPolicy(err.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        self.component_weights.validate()?;
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(FeedError::InvalidPolicy(format!("{name} must be positive")))
            }
        };
        positive("features.half_life_days", self.features.half_life_days)?;
        positive("features.lookback_days", self.features.lookback_days as f64)?;
        positive("engagement.lookback_hours", self.engagement.lookback_hours as f64)?;
        positive("engagement.half_life_hours", self.engagement.half_life_hours)?;
        positive("engagement.saturation", self.engagement.saturation)?;
        positive("trending.window_hours", self.trending.window_hours as f64)?;
        positive("feed.recency_decay_days", self.feed.recency_decay_days)?;
        positive("feed.location_radius_km", self.feed.location_radius_km)?;
        if !(0.0..1.0).contains(&self.features.min_similarity) {
            return Err(FeedError::InvalidPolicy(
                "features.min_similarity must be in [0,1)".into(),
            ));
        }
        if self.features.top_k == 0 || self.trending.size == 0 {
            return Err(FeedError::InvalidPolicy(
                "features.top_k and trending.size must be at least 1".into(),
            ));
        }
        if self.feed.default_limit == 0 || self.feed.default_limit > self.feed.max_limit {
            return Err(FeedError::InvalidPolicy(
                "feed.default_limit must be between 1 and feed.max_limit".into(),
            ));
        }
        Ok(())
    }

    pub fn weight(&self, interaction_type: InteractionType) -> f64 {
        self.interaction_weights.weight(interaction_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        RankingPolicy::default().validate().unwrap();
    }

    #[test]
    fn apply_outweighs_save_click_view_and_dismiss_is_negative() {
        let w = InteractionWeights::default();
        assert!(w.apply > w.save && w.save > w.click && w.click > w.view);
        assert!(w.dismiss < 0.0);
        assert!(!w.is_positive(InteractionType::Dismiss));
    }

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let policy = RankingPolicy::from_yaml_str(
            r#"
component_weights:
  location: 0.3
  tags: 0.2
  engagement: 0.1
  recency: 0.1
  poster_quality: 0.1
  collaborative: 0.1
  content: 0.1
trending:
  size: 5
"#,
        )
        .unwrap();
        assert_eq!(policy.component_weights.location, 0.3);
        assert_eq!(policy.trending.size, 5);
        assert_eq!(policy.trending.window_hours, 24);
        assert_eq!(policy.features.top_k, 50);
    }

    #[test]
    fn weights_not_summing_to_one_are_rejected() {
        let err = RankingPolicy::from_yaml_str("component_weights:\n  location: 0.9\n").unwrap_err();
        assert!(matches!(err, FeedError::InvalidPolicy(_)));
    }

    #[test]
    fn combine_clips_to_unit_interval() {
        let weights = ComponentWeights::default();
        let all_ones = ScoreComponents {
            location: 1.0,
            tags: 1.0,
            engagement: 1.0,
            recency: 1.0,
            poster_quality: 1.0,
            collaborative: 1.0,
            content: 1.0,
        };
        assert!((weights.combine(&all_ones) - 1.0).abs() < 1e-9);
        assert_eq!(weights.combine(&ScoreComponents::default()), 0.0);
    }
}
