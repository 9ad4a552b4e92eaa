//! Frequent job: rolling top-N trending list over open listings.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use gigfeed_core::signals::rank_by_velocity;
use gigfeed_core::{InteractionEvent, Listing, RankingPolicy, TrendingGeneration};
use uuid::Uuid;

use crate::{CancelFlag, JobError, CANCEL_STRIDE};

pub fn build_trending_generation(
    events: &[InteractionEvent],
    listings: &[Listing],
    policy: &RankingPolicy,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<TrendingGeneration, JobError> {
    let open: BTreeSet<Uuid> = listings.iter().filter(|l| l.is_open()).map(|l| l.id).collect();
    let mut eligible = Vec::with_capacity(events.len());
    for (i, event) in events.iter().enumerate() {
        if i % CANCEL_STRIDE == 0 {
            cancel.check()?;
        }
        if open.contains(&event.listing_id) {
            eligible.push(event.clone());
        }
    }
    let window_hours = policy.trending.window_hours;
    let entries = rank_by_velocity(
        &eligible,
        &policy.interaction_weights,
        now - Duration::hours(window_hours),
        now,
        policy.trending.size,
    );

    cancel.check()?;

    Ok(TrendingGeneration {
        generation_id: Uuid::new_v4(),
        computed_at: Some(now),
        window_hours,
        entries,
    })
}
