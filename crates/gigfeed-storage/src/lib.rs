//! Interaction event store, feed preference store, catalog collaborators,
//! published generations and immutable artifact storage for the feed engine.

pub mod artifact;
pub mod catalog;
pub mod events;
pub mod fetch;
pub mod generations;
pub mod preferences;

pub use artifact::{ArtifactStore, StoredArtifact};
pub use catalog::{Catalog, HttpCatalog, MemoryCatalog};
pub use events::{InteractionLog, MemoryInteractionLog, PgInteractionLog};
pub use fetch::{FetchError, HttpClientConfig, HttpFetcher, RetryPlan};
pub use generations::{Generation, GenerationCell, SnapshotVersions, Snapshots};
pub use preferences::{FeedPreferenceStore, MemoryFeedPreferenceStore, PgFeedPreferenceStore};

pub const CRATE_NAME: &str = "gigfeed-storage";
