//! Hourly job: decayed engagement scores and per-listing metrics.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use gigfeed_core::signals::{age_seconds, clamp_unit, dedup_events, half_life_decay, rank_by_velocity};
use gigfeed_core::{EngagementGeneration, EngagementMetrics, InteractionEvent, InteractionType, Listing, RankingPolicy};
use uuid::Uuid;

use crate::{CancelFlag, JobError, CANCEL_STRIDE};

const SECONDS_PER_HOUR: f64 = 3_600.0;

/// Scores every known listing; listings without recent activity score 0.
///
/// `events` may reach further back than the engagement lookback: metric counts
/// cover the whole slice, the score only the lookback window.
pub fn build_engagement_generation(
    events: &[InteractionEvent],
    listings: &[Listing],
    policy: &RankingPolicy,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<EngagementGeneration, JobError> {
    let events = dedup_events(events.iter().cloned());
    let params = policy.engagement;
    let window_start = now - Duration::hours(params.lookback_hours);
    let half_life = params.half_life_hours * SECONDS_PER_HOUR;

    let mut ids: BTreeSet<Uuid> = listings.iter().map(|l| l.id).collect();
    ids.extend(events.iter().map(|e| e.listing_id));

    let mut raw: BTreeMap<Uuid, f64> = ids.iter().map(|id| (*id, 0.0)).collect();
    let mut metrics: BTreeMap<Uuid, EngagementMetrics> = ids
        .iter()
        .map(|id| {
            let metric = EngagementMetrics {
                listing_id: *id,
                last_updated: Some(now),
                ..EngagementMetrics::default()
            };
            (*id, metric)
        })
        .collect();
    let mut time_spent: BTreeMap<Uuid, (f64, usize)> = BTreeMap::new();

    for (i, event) in events.iter().enumerate() {
        if i % CANCEL_STRIDE == 0 {
            cancel.check()?;
        }
        if let Some(metric) = metrics.get_mut(&event.listing_id) {
            metric.record(event.interaction_type);
        }
        if event.interaction_type == InteractionType::View {
            if let Some(secs) = event.time_spent_seconds() {
                let slot = time_spent.entry(event.listing_id).or_default();
                slot.0 += secs;
                slot.1 += 1;
            }
        }
        if event.occurred_at >= window_start && event.occurred_at <= now {
            let decay = half_life_decay(age_seconds(event.occurred_at, now), half_life);
            *raw.entry(event.listing_id).or_default() += policy.weight(event.interaction_type) * decay;
        }
    }
    cancel.check()?;

    let trending_window = now - Duration::hours(policy.trending.window_hours);
    let velocity: BTreeMap<Uuid, f64> = rank_by_velocity(
        &events,
        &policy.interaction_weights,
        trending_window,
        now,
        usize::MAX,
    )
    .into_iter()
    .map(|entry| (entry.listing_id, entry.score))
    .collect();

    let scores: BTreeMap<Uuid, f64> = raw
        .into_iter()
        .map(|(id, r)| {
            let r = r.max(0.0);
            (id, clamp_unit(r / (r + params.saturation)))
        })
        .collect();

    for (i, (id, metric)) in metrics.iter_mut().enumerate() {
        if i % CANCEL_STRIDE == 0 {
            cancel.check()?;
        }
        metric.engagement_score = scores.get(id).copied().unwrap_or(0.0);
        metric.trending_score = velocity.get(id).copied().unwrap_or(0.0);
        if let Some((total, count)) = time_spent.get(id).filter(|(_, n)| *n > 0) {
            metric.avg_time_spent_seconds = total / *count as f64;
        }
    }

    Ok(EngagementGeneration {
        generation_id: Uuid::new_v4(),
        computed_at: Some(now),
        lookback_hours: params.lookback_hours,
        scores,
        metrics,
    })
}
