//! Catalog persistence, retry/backoff and HTTP fetch utilities for carwatch.

use async_trait::async_trait;
use carwatch_core::{
    Listing, ListingStatus, NotificationSetting, PriceHistoryEntry, SavedSearch, ScrapeLogEntry,
    ScrapeProgress, SiteKey, Vehicle,
};
use thiserror::Error;
use uuid::Uuid;

mod http;
mod memory;
mod postgres;
mod retry;

pub use http::{FetchError, HttpClientConfig, HttpFetcher, TokenBucket};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::{with_retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Every read and write the reconciliation core performs against the catalog.
///
/// Implementations must enforce the uniqueness of `vehicles.vin`,
/// `listings(search_id, url)` and `listings(search_id, vehicle_id, source_site)`
/// and report a violation as [`StoreError::Conflict`].
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn active_searches(&self) -> StoreResult<Vec<SavedSearch>>;
    async fn search(&self, id: Uuid) -> StoreResult<Option<SavedSearch>>;
    async fn update_progress(&self, search_id: Uuid, progress: ScrapeProgress) -> StoreResult<()>;

    async fn vehicle(&self, id: Uuid) -> StoreResult<Option<Vehicle>>;
    async fn vehicle_by_vin(&self, vin: &str) -> StoreResult<Option<Vehicle>>;
    async fn insert_vehicle(&self, vehicle: &Vehicle) -> StoreResult<()>;
    async fn set_vehicle_vin(&self, vehicle_id: Uuid, vin: &str) -> StoreResult<()>;
    /// Removes a vehicle unless a listing still references it.
    async fn delete_vehicle(&self, vehicle_id: Uuid) -> StoreResult<()>;

    async fn listing_by_url(&self, search_id: Uuid, url: &str) -> StoreResult<Option<Listing>>;
    async fn listing_by_vehicle_site(
        &self,
        search_id: Uuid,
        vehicle_id: Uuid,
        site: SiteKey,
    ) -> StoreResult<Option<Listing>>;
    async fn insert_listing(&self, listing: &Listing) -> StoreResult<()>;
    /// Writes the mutable columns: prices, status, `last_seen`.
    async fn update_listing(&self, listing: &Listing) -> StoreResult<()>;
    async fn listings_for_vehicle(
        &self,
        vehicle_id: Uuid,
        statuses: &[ListingStatus],
    ) -> StoreResult<Vec<Listing>>;
    async fn listings_for_search(
        &self,
        search_id: Uuid,
        status: Option<ListingStatus>,
    ) -> StoreResult<Vec<Listing>>;
    async fn set_listing_status(&self, ids: &[Uuid], status: ListingStatus) -> StoreResult<u64>;

    async fn latest_price(&self, listing_id: Uuid) -> StoreResult<Option<PriceHistoryEntry>>;
    async fn append_price(&self, entry: &PriceHistoryEntry) -> StoreResult<()>;
    /// Oldest first.
    async fn price_history(&self, listing_id: Uuid) -> StoreResult<Vec<PriceHistoryEntry>>;

    async fn append_scrape_log(&self, entry: &ScrapeLogEntry) -> StoreResult<()>;
    async fn scrape_logs(&self, search_id: Uuid) -> StoreResult<Vec<ScrapeLogEntry>>;

    async fn notification_settings(&self, search_id: Uuid) -> StoreResult<Vec<NotificationSetting>>;
}

/// External identity lookup for an account's registered address.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn registered_email(&self, user_id: Uuid) -> StoreResult<Option<String>>;
}
