//! Read-only access to the listing and user collaborators.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use gigfeed_core::{Listing, User};
use uuid::Uuid;

use crate::fetch::HttpFetcher;

/// Listing/user read API owned by the marketplace CRUD services.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn listings(&self) -> Result<Vec<Listing>>;

    async fn listing(&self, id: Uuid) -> Result<Option<Listing>>;

    async fn users(&self) -> Result<Vec<User>>;

    async fn user(&self, uid: Uuid) -> Result<Option<User>>;
}

/// In-process catalog used for development, seeding and tests.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    listings: RwLock<BTreeMap<Uuid, Listing>>,
    users: RwLock<BTreeMap<Uuid, User>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(listings: Vec<Listing>, users: Vec<User>) -> Self {
        let catalog = Self::new();
        catalog.upsert_listings(listings);
        catalog.upsert_users(users);
        catalog
    }

    pub fn upsert_listings(&self, listings: impl IntoIterator<Item = Listing>) {
        let mut guard = self.listings.write().unwrap_or_else(PoisonError::into_inner);
        for listing in listings {
            guard.insert(listing.id, listing);
        }
    }

    pub fn upsert_users(&self, users: impl IntoIterator<Item = User>) {
        let mut guard = self.users.write().unwrap_or_else(PoisonError::into_inner);
        for user in users {
            guard.insert(user.uid, user);
        }
    }

    pub fn listing_count(&self) -> usize {
        self.listings.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn listings(&self) -> Result<Vec<Listing>> {
        let guard = self.listings.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.values().cloned().collect())
    }

    async fn listing(&self, id: Uuid) -> Result<Option<Listing>> {
        let guard = self.listings.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(&id).cloned())
    }

    async fn users(&self) -> Result<Vec<User>> {
        let guard = self.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.values().cloned().collect())
    }

    async fn user(&self, uid: Uuid) -> Result<Option<User>> {
        let guard = self.users.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(&uid).cloned())
    }
}

/// Catalog served by an upstream JSON API (`/listings`, `/listings/{id}`,
/// `/users`, `/users/{uid}`).
#[derive(Debug)]
pub struct HttpCatalog {
    base_url: String,
    http: HttpFetcher,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn listings(&self) -> Result<Vec<Listing>> {
        let url = self.url("listings");
        let mut listings: Vec<Listing> = self
            .http
            .get_json(&url)
            .await
            .with_context(|| format!("fetching {url}"))?
            .unwrap_or_default();
        listings.sort_by_key(|l| l.id);
        Ok(listings)
    }

    async fn listing(&self, id: Uuid) -> Result<Option<Listing>> {
        let url = self.url(&format!("listings/{id}"));
        self.http
            .get_json(&url)
            .await
            .with_context(|| format!("fetching {url}"))
    }

    async fn users(&self) -> Result<Vec<User>> {
        let url = self.url("users");
        let mut users: Vec<User> = self
            .http
            .get_json(&url)
            .await
            .with_context(|| format!("fetching {url}"))?
            .unwrap_or_default();
        users.sort_by_key(|u| u.uid);
        Ok(users)
    }

    async fn user(&self, uid: Uuid) -> Result<Option<User>> {
        let url = self.url(&format!("users/{uid}"));
        self.http
            .get_json(&url)
            .await
            .with_context(|| format!("fetching {url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpClientConfig;
    use chrono::{TimeZone, Utc};
    use gigfeed_core::ListingStatus;

    fn listing(id: Uuid) -> Listing {
        Listing {
            id,
            name: "Dog walking".into(),
            description: None,
            tags: [1, 2].into(),
            latitude: None,
            longitude: None,
            compensation: Some(20.0),
            poster_uid: Uuid::new_v4(),
            poster_rating: None,
            status: ListingStatus::Open,
            created_at: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn memory_catalog_upserts_replace_by_id() {
        let id = Uuid::new_v4();
        let catalog = MemoryCatalog::with_records(vec![listing(id)], vec![]);
        let mut updated = listing(id);
        updated.status = ListingStatus::Completed;
        catalog.upsert_listings([updated]);

        assert_eq!(catalog.listing_count(), 1);
        let stored = catalog.listing(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ListingStatus::Completed);
        assert!(catalog.user(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[test]
    fn http_catalog_joins_paths_without_double_slashes() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let catalog = HttpCatalog::new("http://catalog.local/api/", http);
        assert_eq!(catalog.url("/listings"), "http://catalog.local/api/listings");
    }
}
