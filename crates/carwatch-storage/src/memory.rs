use std::collections::HashMap;

use async_trait::async_trait;
use carwatch_core::{
    Listing, ListingStatus, NotificationSetting, PriceHistoryEntry, SavedSearch, ScrapeLogEntry,
    ScrapeProgress, SiteKey, Vehicle,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{AccountDirectory, CatalogStore, StoreError, StoreResult};

/// In-process catalog with the same uniqueness rules as the Postgres schema.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    searches: HashMap<Uuid, SavedSearch>,
    vehicles: HashMap<Uuid, Vehicle>,
    // insertion order keeps listing scans deterministic
    listings: Vec<Listing>,
    prices: HashMap<Uuid, Vec<PriceHistoryEntry>>,
    scrape_logs: Vec<ScrapeLogEntry>,
    settings: Vec<NotificationSetting>,
    accounts: HashMap<Uuid, String>,
    reject_listing_inserts: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_search(&self, search: SavedSearch) {
        self.state.lock().await.searches.insert(search.id, search);
    }

    pub async fn insert_setting(&self, setting: NotificationSetting) {
        self.state.lock().await.settings.push(setting);
    }

    pub async fn register_account(&self, user_id: Uuid, email: &str) {
        self.state
            .lock()
            .await
            .accounts
            .insert(user_id, email.to_string());
    }

    pub async fn all_listings(&self) -> Vec<Listing> {
        self.state.lock().await.listings.clone()
    }

    pub async fn all_vehicles(&self) -> Vec<Vehicle> {
        let state = self.state.lock().await;
        let mut vehicles = state.vehicles.values().cloned().collect::<Vec<_>>();
        vehicles.sort_by_key(|v| v.created_at);
        vehicles
    }

    pub async fn price_row_count(&self) -> usize {
        self.state.lock().await.prices.values().map(Vec::len).sum()
    }

    /// Make every later `insert_listing` fail, to exercise store error paths.
    pub async fn reject_listing_inserts(&self, reject: bool) {
        self.state.lock().await.reject_listing_inserts = reject;
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn active_searches(&self) -> StoreResult<Vec<SavedSearch>> {
        let state = self.state.lock().await;
        let mut out = state
            .searches
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn search(&self, id: Uuid) -> StoreResult<Option<SavedSearch>> {
        Ok(self.state.lock().await.searches.get(&id).cloned())
    }

    async fn update_progress(&self, search_id: Uuid, progress: ScrapeProgress) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let search = state
            .searches
            .get_mut(&search_id)
            .ok_or(StoreError::NotFound {
                entity: "saved search",
                id: search_id,
            })?;
        search.scrape_status = progress.status;
        search.scrape_step = progress.step;
        search.scrape_total_steps = progress.total_steps;
        search.scrape_current_site = progress.current_site;
        Ok(())
    }

    async fn vehicle(&self, id: Uuid) -> StoreResult<Option<Vehicle>> {
        Ok(self.state.lock().await.vehicles.get(&id).cloned())
    }

    async fn vehicle_by_vin(&self, vin: &str) -> StoreResult<Option<Vehicle>> {
        Ok(self
            .state
            .lock()
            .await
            .vehicles
            .values()
            .find(|v| v.vin == vin)
            .cloned())
    }

    async fn insert_vehicle(&self, vehicle: &Vehicle) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.vehicles.values().any(|v| v.vin == vehicle.vin) {
            return Err(StoreError::Conflict(format!("vehicles.vin={}", vehicle.vin)));
        }
        state.vehicles.insert(vehicle.id, vehicle.clone());
        Ok(())
    }

    async fn set_vehicle_vin(&self, vehicle_id: Uuid, vin: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .vehicles
            .values()
            .any(|v| v.vin == vin && v.id != vehicle_id)
        {
            return Err(StoreError::Conflict(format!("vehicles.vin={vin}")));
        }
        let vehicle = state
            .vehicles
            .get_mut(&vehicle_id)
            .ok_or(StoreError::NotFound {
                entity: "vehicle",
                id: vehicle_id,
            })?;
        vehicle.vin = vin.to_string();
        Ok(())
    }

    async fn delete_vehicle(&self, vehicle_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.listings.iter().any(|l| l.vehicle_id == vehicle_id) {
            state.vehicles.remove(&vehicle_id);
        }
        Ok(())
    }

    async fn listing_by_url(&self, search_id: Uuid, url: &str) -> StoreResult<Option<Listing>> {
        Ok(self
            .state
            .lock()
            .await
            .listings
            .iter()
            .find(|l| l.search_id == search_id && l.url == url)
            .cloned())
    }

    async fn listing_by_vehicle_site(
        &self,
        search_id: Uuid,
        vehicle_id: Uuid,
        site: SiteKey,
    ) -> StoreResult<Option<Listing>> {
        Ok(self
            .state
            .lock()
            .await
            .listings
            .iter()
            .find(|l| l.search_id == search_id && l.vehicle_id == vehicle_id && l.source_site == site)
            .cloned())
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.reject_listing_inserts {
            return Err(StoreError::Conflict(format!("listing insert rejected: {}", listing.url)));
        }
        for existing in &state.listings {
            if existing.search_id != listing.search_id {
                continue;
            }
            if existing.url == listing.url {
                return Err(StoreError::Conflict(format!(
                    "listings(search_id, url)=({}, {})",
                    listing.search_id, listing.url
                )));
            }
            if existing.vehicle_id == listing.vehicle_id && existing.source_site == listing.source_site {
                return Err(StoreError::Conflict(format!(
                    "listings(search_id, vehicle_id, source_site)=({}, {}, {})",
                    listing.search_id, listing.vehicle_id, listing.source_site
                )));
            }
        }
        state.listings.push(listing.clone());
        Ok(())
    }

    async fn update_listing(&self, listing: &Listing) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let row = state
            .listings
            .iter_mut()
            .find(|l| l.id == listing.id)
            .ok_or(StoreError::NotFound {
                entity: "listing",
                id: listing.id,
            })?;
        row.current_price = listing.current_price;
        row.sale_price = listing.sale_price;
        row.status = listing.status;
        row.last_seen = listing.last_seen;
        Ok(())
    }

    async fn listings_for_vehicle(
        &self,
        vehicle_id: Uuid,
        statuses: &[ListingStatus],
    ) -> StoreResult<Vec<Listing>> {
        Ok(self
            .state
            .lock()
            .await
            .listings
            .iter()
            .filter(|l| l.vehicle_id == vehicle_id && statuses.contains(&l.status))
            .cloned()
            .collect())
    }

    async fn listings_for_search(
        &self,
        search_id: Uuid,
        status: Option<ListingStatus>,
    ) -> StoreResult<Vec<Listing>> {
        Ok(self
            .state
            .lock()
            .await
            .listings
            .iter()
            .filter(|l| l.search_id == search_id && status.map_or(true, |s| l.status == s))
            .cloned()
            .collect())
    }

    async fn set_listing_status(&self, ids: &[Uuid], status: ListingStatus) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut changed = 0;
        for listing in state.listings.iter_mut().filter(|l| ids.contains(&l.id)) {
            listing.status = status;
            changed += 1;
        }
        Ok(changed)
    }

    async fn latest_price(&self, listing_id: Uuid) -> StoreResult<Option<PriceHistoryEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .prices
            .get(&listing_id)
            .and_then(|entries| entries.last())
            .cloned())
    }

    async fn append_price(&self, entry: &PriceHistoryEntry) -> StoreResult<()> {
        self.state
            .lock()
            .await
            .prices
            .entry(entry.listing_id)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn price_history(&self, listing_id: Uuid) -> StoreResult<Vec<PriceHistoryEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .prices
            .get(&listing_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_scrape_log(&self, entry: &ScrapeLogEntry) -> StoreResult<()> {
        self.state.lock().await.scrape_logs.push(entry.clone());
        Ok(())
    }

    async fn scrape_logs(&self, search_id: Uuid) -> StoreResult<Vec<ScrapeLogEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .scrape_logs
            .iter()
            .filter(|e| e.search_id == search_id)
            .cloned()
            .collect())
    }

    async fn notification_settings(&self, search_id: Uuid) -> StoreResult<Vec<NotificationSetting>> {
        Ok(self
            .state
            .lock()
            .await
            .settings
            .iter()
            .filter(|s| s.search_id == search_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn registered_email(&self, user_id: Uuid) -> StoreResult<Option<String>> {
        Ok(self.state.lock().await.accounts.get(&user_id).cloned())
    }
}
