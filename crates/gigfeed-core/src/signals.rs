//! Pure signal math shared by the batch jobs and the online scorer.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{GeoPoint, InteractionEvent, InteractionWeights, TrendingEntry};

const EARTH_RADIUS_KM: f64 = 6371.0;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS_KM * c
}

/// Inverse-distance decay. Missing geodata on either side is not penalised.
pub fn location_score(user: Option<GeoPoint>, listing: Option<GeoPoint>, radius_km: f64) -> f64 {
    match (user, listing) {
        (Some(u), Some(l)) if radius_km > 0.0 => {
            clamp_unit((-haversine_km(u, l) / radius_km).exp())
        }
        _ => 1.0,
    }
}

pub fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Cosine similarity over sparse vectors, clipped to [0,1].
pub fn cosine<K: Ord>(a: &BTreeMap<K, f64>, b: &BTreeMap<K, f64>) -> f64 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let dot: f64 = small
        .iter()
        .filter_map(|(k, v)| large.get(k).map(|w| v * w))
        .sum();
    clamp_unit(dot / (norm_a * norm_b))
}

pub fn l2_norm<K>(v: &BTreeMap<K, f64>) -> f64 {
    v.values().map(|x| x * x).sum::<f64>().sqrt()
}

pub fn l2_normalize<K: Ord + Clone>(v: &BTreeMap<K, f64>) -> BTreeMap<K, f64> {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return BTreeMap::new();
    }
    v.iter().map(|(k, x)| (k.clone(), x / norm)).collect()
}

/// `0.5^(age / half_life)`; negative ages count as fresh.
pub fn half_life_decay(age_seconds: f64, half_life_seconds: f64) -> f64 {
    if half_life_seconds <= 0.0 {
        return 0.0;
    }
    0.5_f64.powf(age_seconds.max(0.0) / half_life_seconds)
}

pub fn age_seconds(at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - at).num_milliseconds() as f64 / 1000.0
}

pub fn recency_score(created_at: DateTime<Utc>, now: DateTime<Utc>, decay_days: f64) -> f64 {
    if decay_days <= 0.0 {
        return 0.0;
    }
    let age_days = age_seconds(created_at, now).max(0.0) / SECONDS_PER_DAY;
    clamp_unit((-age_days / decay_days).exp())
}

/// Maps a 1–5 aggregate rating onto [0,1]; unrated posters are neutral.
pub fn poster_quality_score(rating: Option<f64>) -> f64 {
    match rating.filter(|r| r.is_finite()) {
        Some(r) => clamp_unit((r - 1.0) / 4.0),
        None => 0.5,
    }
}

pub fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Drops exact duplicates on (user, listing, type, timestamp), keeping first occurrence order.
pub fn dedup_events<I>(events: I) -> Vec<InteractionEvent>
where
    I: IntoIterator<Item = InteractionEvent>,
{
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert(e.dedup_key()))
        .collect()
}

/// Ranks listings by type-weighted interaction count inside `[window_start, now]`.
///
/// Only positive velocities are kept; `score` is velocity relative to the top entry.
pub fn rank_by_velocity(
    events: &[InteractionEvent],
    weights: &InteractionWeights,
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
    size: usize,
) -> Vec<TrendingEntry> {
    let mut seen = HashSet::new();
    let mut totals: BTreeMap<Uuid, (f64, usize)> = BTreeMap::new();
    for event in events {
        if event.occurred_at < window_start || event.occurred_at > now {
            continue;
        }
        if !seen.insert(event.dedup_key()) {
            continue;
        }
        let slot = totals.entry(event.listing_id).or_insert((0.0, 0));
        slot.0 += weights.weight(event.interaction_type);
        slot.1 += 1;
    }

    let mut ranked: Vec<(Uuid, f64, usize)> = totals
        .into_iter()
        .filter(|(_, (velocity, _))| *velocity > 0.0)
        .map(|(id, (velocity, count))| (id, velocity, count))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then_with(|| b.2.cmp(&a.2))
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(size);

    let top = ranked.first().map(|r| r.1).unwrap_or(1.0);
    ranked
        .into_iter()
        .enumerate()
        .map(|(idx, (listing_id, velocity, interaction_count))| TrendingEntry {
            rank: idx + 1,
            listing_id,
            score: clamp_unit(velocity / top),
            velocity,
            interaction_count,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InteractionType;
    use chrono::TimeZone;

    #[test]
    fn haversine_matches_known_city_distance() {
        let sf = GeoPoint {
            latitude: 37.7749,
            longitude: -122.4194,
        };
        let la = GeoPoint {
            latitude: 34.0522,
            longitude: -118.2437,
        };
        let d = haversine_km(sf, la);
        assert!((d - 559.0).abs() < 5.0, "got {d}");
        assert_eq!(haversine_km(sf, sf), 0.0);
    }

    #[test]
    fn missing_geodata_scores_full_location() {
        let p = GeoPoint {
            latitude: 1.0,
            longitude: 1.0,
        };
        assert_eq!(location_score(None, Some(p), 25.0), 1.0);
        assert_eq!(location_score(Some(p), None, 25.0), 1.0);
        assert_eq!(location_score(Some(p), Some(p), 25.0), 1.0);
    }

    #[test]
    fn location_decays_with_distance() {
        let a = GeoPoint {
            latitude: 40.0,
            longitude: -74.0,
        };
        let near = GeoPoint {
            latitude: 40.05,
            longitude: -74.0,
        };
        let far = GeoPoint {
            latitude: 42.0,
            longitude: -74.0,
        };
        let s_near = location_score(Some(a), Some(near), 25.0);
        let s_far = location_score(Some(a), Some(far), 25.0);
        assert!(s_near > s_far);
        assert!((0.0..=1.0).contains(&s_far));
    }

    #[test]
    fn jaccard_of_empty_sets_is_zero() {
        let empty: BTreeSet<u32> = BTreeSet::new();
        assert_eq!(jaccard(&empty, &empty), 0.0);
        let a: BTreeSet<u32> = [1, 2, 3].into();
        let b: BTreeSet<u32> = [2, 3, 4].into();
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn cosine_clips_opposed_vectors_to_zero() {
        let a: BTreeMap<u32, f64> = [(1, 1.0), (2, 1.0)].into();
        let b: BTreeMap<u32, f64> = [(1, -1.0), (2, -1.0)].into();
        assert_eq!(cosine(&a, &b), 0.0);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn half_life_halves_at_one_half_life() {
        assert!((half_life_decay(10.0, 10.0) - 0.5).abs() < 1e-12);
        assert_eq!(half_life_decay(-5.0, 10.0), 1.0);
    }

    #[test]
    fn recency_and_quality_stay_in_unit_range() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap();
        let future = now + chrono::Duration::days(3);
        assert_eq!(recency_score(future, now, 10.0), 1.0);
        let old = now - chrono::Duration::days(400);
        assert!(recency_score(old, now, 10.0) < 1e-6);
        assert_eq!(poster_quality_score(None), 0.5);
        assert_eq!(poster_quality_score(Some(3.0)), 0.5);
        assert_eq!(poster_quality_score(Some(9.0)), 1.0);
        assert_eq!(poster_quality_score(Some(0.0)), 0.0);
    }

    #[test]
    fn dedup_drops_exact_replays_only() {
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap();
        let (u, l) = (Uuid::new_v4(), Uuid::new_v4());
        let e = InteractionEvent::new(u, l, InteractionType::Click, at);
        let later = InteractionEvent::new(u, l, InteractionType::Click, at + chrono::Duration::seconds(1));
        let out = dedup_events(vec![e.clone(), e.clone(), later.clone()]);
        assert_eq!(out, vec![e, later]);
    }

    #[test]
    fn velocity_ranking_orders_by_weighted_count_inside_window() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let (hot, warm, cold, stale) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut events = Vec::new();
        for (listing, n) in [(hot, 10), (warm, 5), (cold, 1)] {
            for i in 0..n {
                events.push(InteractionEvent::new(
                    Uuid::new_v4(),
                    listing,
                    InteractionType::View,
                    now - chrono::Duration::minutes(i64::from(i) + 1),
                ));
            }
        }
        for i in 0..50 {
            events.push(InteractionEvent::new(
                Uuid::new_v4(),
                stale,
                InteractionType::Apply,
                now - chrono::Duration::hours(25) - chrono::Duration::minutes(i),
            ));
        }

        let ranked = rank_by_velocity(
            &events,
            &InteractionWeights::default(),
            now - chrono::Duration::hours(24),
            now,
            20,
        );

        let ids: Vec<Uuid> = ranked.iter().map(|e| e.listing_id).collect();
        assert_eq!(ids, vec![hot, warm, cold]);
        assert_eq!(ranked[0].score, 1.0);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[1].interaction_count, 5);
    }

    #[test]
    fn dismiss_only_listings_never_trend() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let listing = Uuid::new_v4();
        let events = vec![InteractionEvent::new(Uuid::new_v4(), listing, InteractionType::Dismiss, now)];
        let ranked = rank_by_velocity(
            &events,
            &InteractionWeights::default(),
            now - chrono::Duration::hours(1),
            now,
            5,
        );
        assert!(ranked.is_empty());
    }
}
