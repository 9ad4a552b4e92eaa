//! Synthetic users, listings and interaction funnels for bootstrapping a
//! development instance.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use gigfeed_core::signals::haversine_km;
use gigfeed_core::{InteractionEvent, InteractionType, Listing, ListingStatus, User};
use gigfeed_storage::{InteractionLog, MemoryCatalog};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

const SKILLS: &[&str] = &[
    "Programming",
    "Design",
    "Writing",
    "Marketing",
    "Sales",
    "Customer Service",
    "Data Analysis",
    "Project Management",
    "Teaching",
    "Translation",
    "Photography",
    "Video Editing",
    "Accounting",
    "Legal",
    "HR",
    "Research",
];

const INDUSTRIES: &[&str] = &[
    "Tech",
    "Healthcare",
    "Education",
    "Finance",
    "Retail",
    "Hospitality",
    "Manufacturing",
    "Real Estate",
    "Media",
    "Non-Profit",
    "Government",
    "Consulting",
    "Agriculture",
];

const JOB_TYPES: &[&str] = &[
    "Remote",
    "On-Site",
    "Hybrid",
    "Part-Time",
    "Full-Time",
    "Contract",
    "Freelance",
    "Internship",
    "Temporary",
    "Permanent",
];

const CITIES: &[(&str, f64, f64)] = &[
    ("New York", 40.7128, -74.0060),
    ("Los Angeles", 34.0522, -118.2437),
    ("Chicago", 41.8781, -87.6298),
    ("Houston", 29.7604, -95.3698),
    ("Phoenix", 33.4484, -112.0740),
    ("San Francisco", 37.7749, -122.4194),
    ("Seattle", 47.6062, -122.3321),
    ("Boston", 42.3601, -71.0589),
    ("Austin", 30.2672, -97.7431),
    ("Denver", 39.7392, -104.9903),
    ("Miami", 25.7617, -80.1918),
    ("Portland", 45.5152, -122.6784),
];

const JOB_TITLES: &[&str] = &[
    "Software Developer",
    "Graphic Designer",
    "Content Writer",
    "Marketing Manager",
    "Sales Representative",
    "Customer Support",
    "Data Analyst",
    "Project Manager",
    "Tutor",
    "Translator",
    "Photographer",
    "Video Editor",
    "Accountant",
    "Legal Assistant",
    "HR Coordinator",
    "Research Assistant",
    "Social Media Manager",
    "Web Developer",
    "UX Designer",
    "Copywriter",
];

/// Follow-up step probabilities after a view; apply and dismiss end the funnel.
const FUNNEL: &[(InteractionType, f64)] = &[
    (InteractionType::Click, 0.30),
    (InteractionType::Save, 0.08),
    (InteractionType::Apply, 0.05),
    (InteractionType::Share, 0.02),
    (InteractionType::Dismiss, 0.15),
];

/// Tag id → display name, ids assigned in category order starting at 1.
pub fn tag_catalog() -> BTreeMap<u32, &'static str> {
    SKILLS
        .iter()
        .chain(INDUSTRIES)
        .chain(JOB_TYPES)
        .enumerate()
        .map(|(i, name)| (i as u32 + 1, *name))
        .collect()
}

#[derive(Debug, Clone)]
pub struct SampleData {
    pub users: Vec<User>,
    pub listings: Vec<Listing>,
    pub events: Vec<InteractionEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeedSummary {
    pub num_users: usize,
    pub num_listings: usize,
    pub num_interactions: usize,
    pub interaction_breakdown: BTreeMap<InteractionType, usize>,
}

pub struct SampleDataGenerator {
    rng: StdRng,
    pub num_users: usize,
    pub num_listings: usize,
    pub interactions_per_user: usize,
}

impl SampleDataGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            num_users: 30,
            num_listings: 25,
            interactions_per_user: 30,
        }
    }

    pub fn with_sizes(mut self, num_users: usize, num_listings: usize, interactions_per_user: usize) -> Self {
        self.num_users = num_users;
        self.num_listings = num_listings;
        self.interactions_per_user = interactions_per_user;
        self
    }

    fn uuid(&mut self) -> Uuid {
        uuid::Builder::from_random_bytes(self.rng.gen()).into_uuid()
    }

    fn jitter(&mut self, spread: f64) -> f64 {
        self.rng.gen_range(-spread..=spread)
    }

    pub fn generate(&mut self, now: DateTime<Utc>) -> SampleData {
        let tag_ids: Vec<u32> = tag_catalog().into_keys().collect();
        let users = self.users(&tag_ids);
        let listings = self.listings(&users, &tag_ids, now);
        let events = self.interactions(&users, &listings, now);
        SampleData {
            users,
            listings,
            events,
        }
    }

    fn users(&mut self, tag_ids: &[u32]) -> Vec<User> {
        (0..self.num_users)
            .map(|_| {
                let (_, lat, lon) = CITIES[self.rng.gen_range(0..CITIES.len())];
                let preferred = self.rng.gen_range(3..=7);
                let preferred_tags: BTreeSet<u32> =
                    tag_ids.choose_multiple(&mut self.rng, preferred).copied().collect();
                let max_distance_km = [25.0, 50.0, 100.0, 200.0][self.rng.gen_range(0..4)];
                User {
                    uid: self.uuid(),
                    latitude: Some(lat + self.jitter(0.5)),
                    longitude: Some(lon + self.jitter(0.5)),
                    preferred_tags,
                    role: Some("worker".to_string()),
                    max_distance_km: Some(max_distance_km),
                }
            })
            .collect()
    }

    fn listings(&mut self, users: &[User], tag_ids: &[u32], now: DateTime<Utc>) -> Vec<Listing> {
        if users.is_empty() {
            return Vec::new();
        }
        (0..self.num_listings)
            .map(|_| {
                let poster = &users[self.rng.gen_range(0..users.len())];
                let (lat, lon) = if self.rng.gen_bool(0.8) {
                    (
                        poster.latitude.unwrap_or_default() + self.jitter(0.3),
                        poster.longitude.unwrap_or_default() + self.jitter(0.3),
                    )
                } else {
                    let (_, lat, lon) = CITIES[self.rng.gen_range(0..CITIES.len())];
                    (lat + self.jitter(0.5), lon + self.jitter(0.5))
                };
                let tag_count = self.rng.gen_range(2..=5);
                let tags: BTreeSet<u32> = tag_ids.choose_multiple(&mut self.rng, tag_count).copied().collect();
                let compensation = match self.rng.gen_range(0..5) {
                    0 => None,
                    1 => Some(f64::from(self.rng.gen_range(15..=25) * 100)),
                    2 => Some(f64::from(self.rng.gen_range(25..=50) * 100)),
                    3 => Some(f64::from(self.rng.gen_range(50..=100) * 100)),
                    _ => Some(f64::from(self.rng.gen_range(100..=200) * 100)),
                };
                let title = JOB_TITLES[self.rng.gen_range(0..JOB_TITLES.len())];
                let created_at = now
                    - Duration::days(self.rng.gen_range(1..=60))
                    - Duration::hours(self.rng.gen_range(0..=23));
                let poster_rating = self
                    .rng
                    .gen_bool(0.7)
                    .then(|| (self.rng.gen_range(25..=50) as f64) / 10.0);
                Listing {
                    id: self.uuid(),
                    name: title.to_string(),
                    description: Some(format!("Sample listing for {title}")),
                    tags,
                    latitude: Some(lat),
                    longitude: Some(lon),
                    compensation,
                    poster_uid: poster.uid,
                    poster_rating,
                    status: ListingStatus::Open,
                    created_at,
                }
            })
            .collect()
    }

    /// Picks listings biased toward tag overlap, proximity and freshness, then
    /// walks a view → follow-up funnel for each.
    fn interactions(&mut self, users: &[User], listings: &[Listing], now: DateTime<Utc>) -> Vec<InteractionEvent> {
        let mut events = Vec::new();
        for user in users {
            let mut ranked: Vec<(f64, &Listing)> = listings
                .iter()
                .filter(|l| l.poster_uid != user.uid)
                .map(|listing| {
                    let overlap = user.preferred_tags.intersection(&listing.tags).count() as f64;
                    let mut score = overlap * 2.0;
                    if let (Some(u), Some(l)) = (user.location(), listing.location()) {
                        let radius = user.max_distance_km.unwrap_or(50.0);
                        let distance = haversine_km(u, l);
                        if distance < radius {
                            score += (1.0 - distance / radius) * 3.0;
                        }
                    }
                    let days_old = (now - listing.created_at).num_days() as f64;
                    score += (1.0 - days_old / 60.0).max(0.0) * 2.0;
                    score += self.rng.gen_range(0.0..2.0);
                    (score, listing)
                })
                .collect();
            ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
            ranked.truncate(self.interactions_per_user * 2);

            let mut touched = BTreeSet::new();
            for _ in 0..self.interactions_per_user {
                let Some((_, listing)) = ranked.choose(&mut self.rng).copied() else {
                    break;
                };
                if !touched.insert(listing.id) {
                    continue;
                }
                let span_hours = (now - listing.created_at).num_hours().max(1);
                let viewed_at = listing.created_at + Duration::hours(self.rng.gen_range(0..span_hours));
                let mut view = InteractionEvent::new(user.uid, listing.id, InteractionType::View, viewed_at);
                view.metadata.insert(
                    "time_spent_seconds".into(),
                    serde_json::json!(self.rng.gen_range(5..=120)),
                );
                events.push(view);

                for (kind, probability) in FUNNEL {
                    if self.rng.gen_bool(*probability) {
                        let at = viewed_at + Duration::seconds(self.rng.gen_range(5..=300));
                        events.push(InteractionEvent::new(user.uid, listing.id, *kind, at));
                        if matches!(kind, InteractionType::Apply | InteractionType::Dismiss) {
                            break;
                        }
                    }
                }
            }
        }
        events
    }
}

pub fn summarize(data: &SampleData) -> SeedSummary {
    let mut interaction_breakdown = BTreeMap::new();
    for event in &data.events {
        *interaction_breakdown.entry(event.interaction_type).or_default() += 1;
    }
    SeedSummary {
        num_users: data.users.len(),
        num_listings: data.listings.len(),
        num_interactions: data.events.len(),
        interaction_breakdown,
    }
}

/// Loads generated records into the in-memory catalog and appends the events.
pub async fn seed_sample_data(
    generator: &mut SampleDataGenerator,
    catalog: &MemoryCatalog,
    log: &dyn InteractionLog,
    now: DateTime<Utc>,
) -> Result<SeedSummary> {
    let data = generator.generate(now);
    let summary = summarize(&data);
    catalog.upsert_users(data.users);
    catalog.upsert_listings(data.listings);
    for event in data.events {
        log.append(event).await.context("appending sample interaction")?;
    }
    info!(
        users = summary.num_users,
        listings = summary.num_listings,
        interactions = summary.num_interactions,
        "sample data seeded"
    );
    Ok(summary)
}
