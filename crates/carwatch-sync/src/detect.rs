use std::collections::{BTreeSet, HashSet};

use carwatch_core::ListingStatus;
use carwatch_storage::{CatalogStore, StoreResult};
use tracing::info;
use uuid::Uuid;

/// When a vehicle's active or cross-listed listings span more than one site,
/// mark them all cross-listed. Returns the number of listings that changed.
///
/// Nothing here moves a listing back out of `cross_listed`.
pub async fn detect_cross_listings(store: &dyn CatalogStore, vehicle_id: Uuid) -> StoreResult<u64> {
    let listings = store
        .listings_for_vehicle(vehicle_id, &[ListingStatus::Active, ListingStatus::CrossListed])
        .await?;
    let sites = listings.iter().map(|l| l.source_site).collect::<BTreeSet<_>>();
    if sites.len() <= 1 {
        return Ok(0);
    }

    let pending = listings
        .iter()
        .filter(|l| l.status != ListingStatus::CrossListed)
        .map(|l| l.id)
        .collect::<Vec<_>>();
    if pending.is_empty() {
        return Ok(0);
    }
    let changed = store
        .set_listing_status(&pending, ListingStatus::CrossListed)
        .await?;
    info!(%vehicle_id, sites = sites.len(), changed, "vehicle cross-listed");
    Ok(changed)
}

/// Active listings of the search whose URL was not seen this run become delisted.
pub async fn detect_delisted(
    store: &dyn CatalogStore,
    search_id: Uuid,
    found_urls: &HashSet<String>,
) -> StoreResult<u64> {
    let missing = store
        .listings_for_search(search_id, Some(ListingStatus::Active))
        .await?
        .into_iter()
        .filter(|l| !found_urls.contains(&l.url))
        .map(|l| l.id)
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return Ok(0);
    }
    let changed = store
        .set_listing_status(&missing, ListingStatus::Delisted)
        .await?;
    info!(%search_id, changed, "listings delisted");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carwatch_core::vin::placeholder_vin;
    use carwatch_core::{Listing, SiteKey, Vehicle};
    use carwatch_storage::MemoryStore;
    use chrono::Utc;

    async fn vehicle(store: &MemoryStore) -> Uuid {
        let vehicle = Vehicle {
            id: Uuid::new_v4(),
            vin: placeholder_vin(),
            make: "Mazda".into(),
            model: "RX-7".into(),
            year: Some(1993),
            mileage: None,
            created_at: Utc::now(),
        };
        store.insert_vehicle(&vehicle).await.unwrap();
        vehicle.id
    }

    async fn listing(
        store: &MemoryStore,
        search_id: Uuid,
        vehicle_id: Uuid,
        site: SiteKey,
        url: &str,
        status: ListingStatus,
    ) -> Uuid {
        let now = Utc::now();
        let listing = Listing {
            id: Uuid::new_v4(),
            vehicle_id,
            search_id,
            source_site: site,
            url: url.to_string(),
            current_price: 3_500_000,
            sale_price: None,
            status,
            geography: String::new(),
            image_url: None,
            first_seen: now,
            last_seen: now,
        };
        store.insert_listing(&listing).await.unwrap();
        listing.id
    }

    async fn status_of(store: &MemoryStore, id: Uuid) -> ListingStatus {
        store
            .all_listings()
            .await
            .into_iter()
            .find(|l| l.id == id)
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn two_active_sites_become_cross_listed() {
        let store = MemoryStore::new();
        let search = Uuid::new_v4();
        let v = vehicle(&store).await;
        let a = listing(&store, search, v, SiteKey::Bat, "a", ListingStatus::Active).await;
        let b = listing(&store, search, v, SiteKey::Hagerty, "b", ListingStatus::Active).await;

        assert_eq!(detect_cross_listings(&store, v).await.unwrap(), 2);
        assert_eq!(status_of(&store, a).await, ListingStatus::CrossListed);
        assert_eq!(status_of(&store, b).await, ListingStatus::CrossListed);

        assert_eq!(detect_cross_listings(&store, v).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn single_site_vehicle_is_untouched() {
        let store = MemoryStore::new();
        let v = vehicle(&store).await;
        let a = listing(&store, Uuid::new_v4(), v, SiteKey::Bat, "a", ListingStatus::Active).await;
        let sold = listing(&store, Uuid::new_v4(), v, SiteKey::Bat, "b", ListingStatus::Sold).await;

        assert_eq!(detect_cross_listings(&store, v).await.unwrap(), 0);
        assert_eq!(status_of(&store, a).await, ListingStatus::Active);
        assert_eq!(status_of(&store, sold).await, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn sold_and_delisted_listings_do_not_count_as_a_second_site() {
        let store = MemoryStore::new();
        let search = Uuid::new_v4();
        let v = vehicle(&store).await;
        let a = listing(&store, search, v, SiteKey::Bat, "a", ListingStatus::Active).await;
        listing(&store, search, v, SiteKey::Hemmings, "b", ListingStatus::Delisted).await;
        listing(&store, search, v, SiteKey::Hagerty, "c", ListingStatus::Sold).await;

        assert_eq!(detect_cross_listings(&store, v).await.unwrap(), 0);
        assert_eq!(status_of(&store, a).await, ListingStatus::Active);
    }

    #[tokio::test]
    async fn only_missing_active_listings_are_delisted() {
        let store = MemoryStore::new();
        let search = Uuid::new_v4();
        let u = listing(&store, search, vehicle(&store).await, SiteKey::Bat, "U", ListingStatus::Active).await;
        let v = listing(&store, search, vehicle(&store).await, SiteKey::Bat, "V", ListingStatus::Active).await;
        let sold = listing(&store, search, vehicle(&store).await, SiteKey::Bat, "S", ListingStatus::Sold).await;
        let cross =
            listing(&store, search, vehicle(&store).await, SiteKey::Bat, "C", ListingStatus::CrossListed).await;

        let found = HashSet::from(["V".to_string()]);
        assert_eq!(detect_delisted(&store, search, &found).await.unwrap(), 1);
        assert_eq!(status_of(&store, u).await, ListingStatus::Delisted);
        assert_eq!(status_of(&store, v).await, ListingStatus::Active);
        assert_eq!(status_of(&store, sold).await, ListingStatus::Sold);
        assert_eq!(status_of(&store, cross).await, ListingStatus::CrossListed);
    }
}
