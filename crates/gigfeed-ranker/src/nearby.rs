use gigfeed_core::signals::{haversine_km, location_score};
use gigfeed_core::{FeedError, GeoPoint, ScoredListing};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{check_limit, FeedService, RankError};

pub const MIN_RADIUS_KM: f64 = 0.1;
pub const MAX_RADIUS_KM: f64 = 100.0;
pub const MAX_NEARBY_LIMIT: usize = 100;

fn default_radius_km() -> f64 {
    10.0
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NearbyQuery {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl NearbyQuery {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            radius_km: default_radius_km(),
            limit: default_limit(),
        }
    }

    fn validate(&self) -> Result<GeoPoint, FeedError> {
        let origin = GeoPoint::new(self.latitude, self.longitude)?;
        if !(MIN_RADIUS_KM..=MAX_RADIUS_KM).contains(&self.radius_km) {
            return Err(FeedError::InvalidRadius {
                got: self.radius_km,
                min: MIN_RADIUS_KM,
                max: MAX_RADIUS_KM,
            });
        }
        check_limit(self.limit, MAX_NEARBY_LIMIT)?;
        Ok(origin)
    }
}

impl FeedService {
    /// Open listings within `radius_km` of a point, nearest first. Listings
    /// without coordinates never match.
    pub async fn nearby(&self, query: &NearbyQuery) -> Result<Vec<ScoredListing>, RankError> {
        let origin = query.validate()?;
        let listings = self.catalog.listings().await.map_err(RankError::Upstream)?;

        let mut hits: Vec<(f64, ScoredListing)> = listings
            .into_iter()
            .filter(|l| l.is_open())
            .filter_map(|l| {
                let point = l.location()?;
                let distance = haversine_km(origin, point);
                (distance <= query.radius_km).then(|| {
                    let score = location_score(Some(origin), Some(point), query.radius_km);
                    (
                        distance,
                        ScoredListing {
                            listing: l,
                            recommendation_score: score,
                            score_components: None,
                            distance_km: Some(distance),
                        },
                    )
                })
            })
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.listing.id.cmp(&b.1.listing.id)));
        hits.truncate(query.limit);
        debug!(radius_km = query.radius_km, returned = hits.len(), "nearby search");
        Ok(hits.into_iter().map(|(_, scored)| scored).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;
    use gigfeed_core::ListingStatus;
    use uuid::Uuid;

    const AUSTIN: (f64, f64) = (30.2672, -97.7431);

    #[tokio::test]
    async fn returns_open_listings_inside_the_radius_nearest_first() {
        let far = listing(&[1], 1, Some((30.3072, -97.7431)));
        let near = listing(&[1], 1, Some((30.2702, -97.7431)));
        let outside = listing(&[1], 1, Some((31.2672, -97.7431)));
        let no_geo = listing(&[1], 1, None);
        let mut closed = listing(&[1], 1, Some(AUSTIN));
        closed.status = ListingStatus::Cancelled;
        let fx = fixture(vec![far.clone(), near.clone(), outside, no_geo, closed], Vec::new());

        let hits = fx.service.nearby(&NearbyQuery::new(AUSTIN.0, AUSTIN.1)).await.expect("nearby");

        let ids: Vec<Uuid> = hits.iter().map(|s| s.listing.id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
        let d0 = hits[0].distance_km.expect("distance");
        let d1 = hits[1].distance_km.expect("distance");
        assert!(d0 < 1.0 && d1 > 4.0 && d1 < 5.0, "{d0} {d1}");
        assert!(hits[0].recommendation_score > hits[1].recommendation_score);
    }

    #[tokio::test]
    async fn limit_caps_the_result() {
        let gigs = (0..4).map(|_| listing(&[1], 1, Some(AUSTIN))).collect();
        let fx = fixture(gigs, Vec::new());
        let query = NearbyQuery {
            limit: 3,
            ..NearbyQuery::new(AUSTIN.0, AUSTIN.1)
        };
        assert_eq!(fx.service.nearby(&query).await.expect("nearby").len(), 3);
    }

    #[tokio::test]
    async fn invalid_radius_coordinates_and_limit_are_rejected() {
        let fx = fixture(Vec::new(), Vec::new());
        let base = NearbyQuery::new(AUSTIN.0, AUSTIN.1);
        for (query, want) in [
            (NearbyQuery { radius_km: 0.05, ..base }, "radius"),
            (NearbyQuery { radius_km: 100.5, ..base }, "radius"),
            (NearbyQuery { latitude: 91.0, ..base }, "coords"),
            (NearbyQuery { limit: 0, ..base }, "limit"),
        ] {
            let err = fx.service.nearby(&query).await.expect_err("rejected");
            let matched = match (want, &err) {
                ("radius", RankError::Invalid(FeedError::InvalidRadius { .. })) => true,
                ("coords", RankError::Invalid(FeedError::InvalidCoordinates { .. })) => true,
                ("limit", RankError::Invalid(FeedError::InvalidLimit { .. })) => true,
                _ => false,
            };
            assert!(matched, "{want}: {err}");
        }
    }

    #[test]
    fn body_defaults_fill_radius_and_limit() {
        let query: NearbyQuery = serde_json::from_str(r#"{"latitude": 1.0, "longitude": 2.0}"#).expect("parse");
        assert_eq!(query.radius_km, 10.0);
        assert_eq!(query.limit, 20);
    }
}
