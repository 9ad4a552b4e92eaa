//! Daily job: per-user tag feature vectors and the user/item neighbour tables.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use gigfeed_core::signals::{age_seconds, cosine, dedup_events, half_life_decay, l2_normalize};
use gigfeed_core::{
    FeatureGeneration, InteractionEvent, Listing, RankingPolicy, SimilarityEntry, SimilarityKind,
    UserFeatureVector,
};
use uuid::Uuid;

use crate::{CancelFlag, JobError};

const SECONDS_PER_DAY: f64 = 86_400.0;
const ACTIVITY_SATURATION: f64 = 100.0;

/// Item vector dimension: a user's positive weight or a tag indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Dim {
    User(Uuid),
    Tag(u32),
}

/// Decayed interaction weights keyed user → listing.
#[derive(Debug, Default)]
struct InteractionMatrix {
    signed: BTreeMap<Uuid, BTreeMap<Uuid, f64>>,
    positive: BTreeMap<Uuid, BTreeMap<Uuid, f64>>,
    counts: BTreeMap<Uuid, usize>,
}

impl InteractionMatrix {
    fn build(events: &[InteractionEvent], policy: &RankingPolicy, now: DateTime<Utc>) -> Self {
        let half_life = policy.features.half_life_days * SECONDS_PER_DAY;
        let mut matrix = Self::default();
        for event in events {
            let weight = policy.weight(event.interaction_type);
            let decayed = weight * half_life_decay(age_seconds(event.occurred_at, now), half_life);
            *matrix
                .signed
                .entry(event.user_uid)
                .or_default()
                .entry(event.listing_id)
                .or_default() += decayed;
            if weight > 0.0 {
                *matrix
                    .positive
                    .entry(event.user_uid)
                    .or_default()
                    .entry(event.listing_id)
                    .or_default() += decayed;
            }
            *matrix.counts.entry(event.user_uid).or_default() += 1;
        }
        matrix
    }
}

/// Builds a complete feature generation from the deduplicated event window.
///
/// Pure over its inputs apart from the generation id; checks `cancel` between
/// phases so an aborted run returns before anything is published.
pub fn build_feature_generation(
    events: &[InteractionEvent],
    listings: &[Listing],
    policy: &RankingPolicy,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<FeatureGeneration, JobError> {
    let events = dedup_events(events.iter().cloned());
    let matrix = InteractionMatrix::build(&events, policy, now);
    let tags_by_listing: BTreeMap<Uuid, &BTreeSet<u32>> =
        listings.iter().map(|l| (l.id, &l.tags)).collect();
    cancel.check()?;

    let feature_vectors = user_feature_vectors(&matrix, &tags_by_listing);
    cancel.check()?;

    let user_neighbors = top_k_neighbors(
        feature_vectors
            .iter()
            .map(|(uid, v)| (*uid, v.tag_weights.clone()))
            .collect(),
        SimilarityKind::UserUser,
        policy,
        cancel,
    )?;

    let item_vectors = item_vectors(&matrix, listings);
    let item_neighbors = top_k_neighbors(item_vectors, SimilarityKind::ItemItem, policy, cancel)?;

    let positive_affinity: BTreeMap<Uuid, BTreeMap<Uuid, f64>> = matrix
        .positive
        .iter()
        .filter_map(|(uid, row)| {
            let max = row.values().copied().fold(0.0_f64, f64::max);
            (max > 0.0).then(|| {
                let normalized = row.iter().map(|(l, w)| (*l, w / max)).collect::<BTreeMap<_, _>>();
                (*uid, normalized)
            })
        })
        .collect();

    Ok(FeatureGeneration {
        generation_id: Uuid::new_v4(),
        computed_at: Some(now),
        feature_vectors,
        user_neighbors,
        item_neighbors,
        positive_affinity,
    })
}

fn user_feature_vectors(
    matrix: &InteractionMatrix,
    tags_by_listing: &BTreeMap<Uuid, &BTreeSet<u32>>,
) -> BTreeMap<Uuid, UserFeatureVector> {
    matrix
        .signed
        .iter()
        .map(|(uid, row)| {
            let mut tag_weights: BTreeMap<u32, f64> = BTreeMap::new();
            for (listing_id, weight) in row {
                let Some(tags) = tags_by_listing.get(listing_id) else {
                    continue;
                };
                for tag in tags.iter() {
                    *tag_weights.entry(*tag).or_default() += weight;
                }
            }
            tag_weights.retain(|_, w| w.abs() > f64::EPSILON);
            let interaction_count = matrix.counts.get(uid).copied().unwrap_or(0);
            let vector = UserFeatureVector {
                user_uid: *uid,
                tag_weights,
                interaction_count,
                activity_level: (interaction_count as f64 / ACTIVITY_SATURATION).min(1.0),
            };
            (*uid, vector)
        })
        .collect()
}

/// Concatenates each listing's normalised positive-user column with its
/// normalised tag indicator so both halves carry equal weight.
fn item_vectors(matrix: &InteractionMatrix, listings: &[Listing]) -> BTreeMap<Uuid, BTreeMap<Dim, f64>> {
    let mut columns: BTreeMap<Uuid, BTreeMap<Uuid, f64>> = BTreeMap::new();
    for (uid, row) in &matrix.positive {
        for (listing_id, weight) in row {
            columns.entry(*listing_id).or_default().insert(*uid, *weight);
        }
    }

    let mut ids: BTreeSet<Uuid> = columns.keys().copied().collect();
    ids.extend(listings.iter().map(|l| l.id));
    let tags_by_listing: BTreeMap<Uuid, &BTreeSet<u32>> =
        listings.iter().map(|l| (l.id, &l.tags)).collect();

    ids.into_iter()
        .filter_map(|id| {
            let mut vector: BTreeMap<Dim, f64> = columns
                .get(&id)
                .map(|column| {
                    l2_normalize(column)
                        .into_iter()
                        .map(|(uid, w)| (Dim::User(uid), w))
                        .collect()
                })
                .unwrap_or_default();
            if let Some(tags) = tags_by_listing.get(&id).filter(|t| !t.is_empty()) {
                let value = 1.0 / (tags.len() as f64).sqrt();
                vector.extend(tags.iter().map(|t| (Dim::Tag(*t), value)));
            }
            (!vector.is_empty()).then_some((id, vector))
        })
        .collect()
}

fn top_k_neighbors<K: Ord>(
    vectors: BTreeMap<Uuid, BTreeMap<K, f64>>,
    kind: SimilarityKind,
    policy: &RankingPolicy,
    cancel: &CancelFlag,
) -> Result<BTreeMap<Uuid, Vec<SimilarityEntry>>, JobError> {
    let ids: Vec<Uuid> = vectors.keys().copied().collect();
    let rows: Vec<&BTreeMap<K, f64>> = vectors.values().collect();
    let mut neighbors: BTreeMap<Uuid, Vec<SimilarityEntry>> = BTreeMap::new();

    for i in 0..ids.len() {
        cancel.check()?;
        for j in (i + 1)..ids.len() {
            let score = cosine(rows[i], rows[j]);
            if score <= policy.features.min_similarity {
                continue;
            }
            for (subject, neighbor) in [(ids[i], ids[j]), (ids[j], ids[i])] {
                neighbors.entry(subject).or_default().push(SimilarityEntry {
                    subject_id: subject,
                    neighbor_id: neighbor,
                    kind,
                    score,
                });
            }
        }
    }

    for entries in neighbors.values_mut() {
        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.neighbor_id.cmp(&b.neighbor_id))
        });
        entries.truncate(policy.features.top_k);
    }
    Ok(neighbors)
}
