use std::collections::HashSet;

use carwatch_core::{
    drop_pct, Listing, ListingStatus, NewListingAlert, PriceDropAlert, RecordStatus, RunAlerts,
    SavedSearch, ScrapedRecord, SoldAlert,
};
use carwatch_storage::{CatalogStore, StoreResult};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::detect::detect_cross_listings;
use crate::identity::{resolve_vehicle, upgrade_vin};
use crate::prices::record_price;

/// What one reconciliation pass did to the catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub alerts: RunAlerts,
    /// Every URL seen this run, used by the delisting pass.
    pub found_urls: HashSet<String>,
    pub created: usize,
    pub updated: usize,
    /// Records without a positive price.
    pub discarded: usize,
    /// Records skipped because a store call failed.
    pub failed: usize,
}

enum Applied {
    Created,
    Updated,
}

/// Price a record settles at: the sale price for sold records when one was read.
fn effective_price(record: &ScrapedRecord) -> i64 {
    match (record.status, record.sale_price) {
        (RecordStatus::Sold, Some(sale)) if sale > 0 => sale,
        _ => record.price_cents,
    }
}

/// Fold a run's scraped records into the catalog for `search`.
///
/// Store failures skip the affected record and are counted, they never abort the pass.
pub async fn reconcile(
    store: &dyn CatalogStore,
    search: &SavedSearch,
    records: &[ScrapedRecord],
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    for record in records {
        if record.price_cents <= 0 {
            outcome.discarded += 1;
            continue;
        }
        outcome.found_urls.insert(record.url.clone());

        match reconcile_record(store, search, record, &mut outcome).await {
            Ok(Applied::Created) => outcome.created += 1,
            Ok(Applied::Updated) => outcome.updated += 1,
            Err(err) => {
                outcome.failed += 1;
                warn!(
                    search_id = %search.id,
                    site = %record.source_site,
                    url = %record.url,
                    error = %err,
                    "skipping record after store failure"
                );
            }
        }
    }
    debug!(
        search_id = %search.id,
        created = outcome.created,
        updated = outcome.updated,
        discarded = outcome.discarded,
        failed = outcome.failed,
        "reconciliation pass finished"
    );
    outcome
}

async fn reconcile_record(
    store: &dyn CatalogStore,
    search: &SavedSearch,
    record: &ScrapedRecord,
    outcome: &mut ReconcileOutcome,
) -> StoreResult<Applied> {
    if let Some(listing) = store.listing_by_url(search.id, &record.url).await? {
        let vehicle_id = listing.vehicle_id;
        if let Some(vin) = record.real_vin() {
            upgrade_vin(store, vehicle_id, vin).await?;
        }
        apply_update(store, listing, record, &mut outcome.alerts).await?;
        if record.real_vin().is_some() {
            detect_cross_listings(store, vehicle_id).await?;
        }
        return Ok(Applied::Updated);
    }

    let vehicle_id = resolve_vehicle(store, record, &search.make, &search.model).await?;
    let applied = match store
        .listing_by_vehicle_site(search.id, vehicle_id, record.source_site)
        .await?
    {
        Some(listing) => {
            // the vehicle's listing moved to a new URL on the same site
            outcome.found_urls.insert(listing.url.clone());
            apply_update(store, listing, record, &mut outcome.alerts).await?;
            Applied::Updated
        }
        None => {
            if let Err(err) = insert_listing(store, search.id, vehicle_id, record, &mut outcome.alerts).await {
                // a placeholder vehicle is unreachable once its only listing is gone
                if record.real_vin().is_none() {
                    if let Err(cleanup) = store.delete_vehicle(vehicle_id).await {
                        warn!(%vehicle_id, error = %cleanup, "removing orphaned placeholder vehicle failed");
                    }
                }
                return Err(err);
            }
            Applied::Created
        }
    };
    if record.real_vin().is_some() {
        detect_cross_listings(store, vehicle_id).await?;
    }
    Ok(applied)
}

async fn apply_update(
    store: &dyn CatalogStore,
    listing: Listing,
    record: &ScrapedRecord,
    alerts: &mut RunAlerts,
) -> StoreResult<()> {
    let price = effective_price(record);
    let old_price = listing.current_price;
    let mut next = listing;
    next.last_seen = Utc::now();
    next.current_price = price;

    if record.status == RecordStatus::Sold && next.status != ListingStatus::Sold {
        next.status = ListingStatus::Sold;
        next.sale_price = Some(price);
        alerts.sold.push(SoldAlert {
            title: record.title.clone(),
            sale_price: price,
            source_site: record.source_site,
            url: record.url.clone(),
        });
    } else {
        if next.status == ListingStatus::Delisted {
            next.status = ListingStatus::Active;
        }
        if old_price > 0 && price < old_price {
            alerts.price_drops.push(PriceDropAlert {
                listing_title: record.title.clone(),
                old_price,
                new_price: price,
                drop_pct: drop_pct(old_price, price),
                url: record.url.clone(),
            });
        }
    }

    store.update_listing(&next).await?;
    record_price(store, next.id, price).await?;
    Ok(())
}

async fn insert_listing(
    store: &dyn CatalogStore,
    search_id: Uuid,
    vehicle_id: Uuid,
    record: &ScrapedRecord,
    alerts: &mut RunAlerts,
) -> StoreResult<()> {
    let price = effective_price(record);
    let sold = record.status == RecordStatus::Sold;
    let now = Utc::now();
    let listing = Listing {
        id: Uuid::new_v4(),
        vehicle_id,
        search_id,
        source_site: record.source_site,
        url: record.url.clone(),
        current_price: price,
        sale_price: sold.then_some(price),
        status: if sold {
            ListingStatus::Sold
        } else {
            ListingStatus::Active
        },
        geography: record.location.clone(),
        image_url: record.image_url.clone(),
        first_seen: now,
        last_seen: now,
    };
    store.insert_listing(&listing).await?;
    record_price(store, listing.id, price).await?;
    alerts.new_listings.push(NewListingAlert {
        title: record.title.clone(),
        price,
        source_site: record.source_site,
        url: record.url.clone(),
    });
    debug!(listing_id = %listing.id, site = %record.source_site, "listing created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use carwatch_core::SiteKey;
    use carwatch_storage::MemoryStore;

    fn search() -> SavedSearch {
        SavedSearch::new(Uuid::new_v4(), "Porsche", "911", 1989, 1998)
    }

    fn record(url: &str, price: i64) -> ScrapedRecord {
        ScrapedRecord::new(SiteKey::Bat, url, "1995 Porsche 911 Carrera", price)
    }

    #[tokio::test]
    async fn price_drop_on_url_match() {
        let store = MemoryStore::new();
        let search = search();
        reconcile(&store, &search, &[record("u1", 2_000_000)]).await;

        let outcome = reconcile(&store, &search, &[record("u1", 1_800_000)]).await;
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.alerts.price_drops.len(), 1);
        let alert = &outcome.alerts.price_drops[0];
        assert_eq!((alert.old_price, alert.new_price), (2_000_000, 1_800_000));
        assert_eq!(alert.drop_pct, 10.0);

        let listing = &store.all_listings().await[0];
        assert_eq!(listing.current_price, 1_800_000);
        assert_eq!(store.price_row_count().await, 2);
    }

    #[tokio::test]
    async fn price_increase_is_recorded_without_alert() {
        let store = MemoryStore::new();
        let search = search();
        reconcile(&store, &search, &[record("u1", 2_000_000)]).await;
        let outcome = reconcile(&store, &search, &[record("u1", 2_100_000)]).await;
        assert!(outcome.alerts.is_empty());
        assert_eq!(store.price_row_count().await, 2);
    }

    #[tokio::test]
    async fn delisted_listing_seen_again_is_active() {
        let store = MemoryStore::new();
        let search = search();
        reconcile(&store, &search, &[record("u1", 2_000_000)]).await;
        let id = store.all_listings().await[0].id;
        store.set_listing_status(&[id], ListingStatus::Delisted).await.unwrap();

        reconcile(&store, &search, &[record("u1", 2_000_000)]).await;
        assert_eq!(store.all_listings().await[0].status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn sold_listing_is_never_reopened() {
        let store = MemoryStore::new();
        let search = search();
        let mut sold = record("u1", 2_000_000);
        sold.status = RecordStatus::Sold;
        reconcile(&store, &search, &[sold]).await;

        let outcome = reconcile(&store, &search, &[record("u1", 2_000_000)]).await;
        assert!(outcome.alerts.is_empty());
        assert_eq!(store.all_listings().await[0].status, ListingStatus::Sold);
    }

    #[tokio::test]
    async fn vin_arriving_later_upgrades_placeholder_vehicle() {
        let store = MemoryStore::new();
        let search = search();
        reconcile(&store, &search, &[record("u1", 2_000_000)]).await;

        let mut with_vin = record("u1", 2_000_000);
        with_vin.vin = Some("WP0AA2995SS320456".into());
        reconcile(&store, &search, &[with_vin]).await;

        let vehicles = store.all_vehicles().await;
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].vin, "WP0AA2995SS320456");
    }

    #[tokio::test]
    async fn same_vin_on_two_sites_cross_lists() {
        let store = MemoryStore::new();
        let search = search();
        let vin = "WP0AA2995SS320456";
        let mut bat = record("https://bringatrailer.com/listing/a", 2_000_000);
        bat.vin = Some(vin.into());
        let mut hemmings = ScrapedRecord::new(
            SiteKey::Hemmings,
            "https://www.hemmings.com/classifieds/cars/for-sale/a",
            "1995 Porsche 911",
            2_050_000,
        );
        hemmings.vin = Some(vin.into());

        let outcome = reconcile(&store, &search, &[bat, hemmings]).await;
        assert_eq!(outcome.created, 2);
        assert_eq!(store.all_vehicles().await.len(), 1);
        assert!(store
            .all_listings()
            .await
            .iter()
            .all(|l| l.status == ListingStatus::CrossListed));
    }

    #[tokio::test]
    async fn vehicle_site_match_counts_old_url_as_found() {
        let store = MemoryStore::new();
        let search = search();
        let vin = "WP0AA2995SS320456";
        let mut first = record("https://bringatrailer.com/listing/a", 2_000_000);
        first.vin = Some(vin.into());
        reconcile(&store, &search, &[first]).await;

        let mut moved = record("https://bringatrailer.com/listing/a-relisted", 1_900_000);
        moved.vin = Some(vin.into());
        let outcome = reconcile(&store, &search, &[moved]).await;
        assert_eq!(outcome.updated, 1);
        assert_eq!(store.all_listings().await.len(), 1);
        assert!(outcome.found_urls.contains("https://bringatrailer.com/listing/a"));
        assert_eq!(outcome.alerts.price_drops.len(), 1);
    }

    #[tokio::test]
    async fn failed_insert_leaves_no_placeholder_vehicle() {
        let store = MemoryStore::new();
        let search = search();
        store.reject_listing_inserts(true).await;

        let outcome = reconcile(&store, &search, &[record("u1", 2_000_000)]).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.created, 0);
        assert!(outcome.alerts.is_empty());
        assert!(store.all_listings().await.is_empty());
        assert!(store.all_vehicles().await.is_empty());
    }

    #[tokio::test]
    async fn vin_owned_elsewhere_keeps_listing_on_its_placeholder() {
        let store = MemoryStore::new();
        let search = search();
        let vin = "WP0AA2995SS320456";
        reconcile(&store, &search, &[record("https://bringatrailer.com/listing/b", 2_000_000)]).await;
        let mut hemmings = ScrapedRecord::new(
            SiteKey::Hemmings,
            "https://www.hemmings.com/classifieds/b",
            "1995 Porsche 911 Carrera",
            2_050_000,
        );
        hemmings.vin = Some(vin.into());
        reconcile(&store, &search, &[hemmings]).await;

        let mut bat = record("https://bringatrailer.com/listing/b", 2_000_000);
        bat.vin = Some(vin.into());
        let outcome = reconcile(&store, &search, &[bat]).await;

        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.failed, 0);
        let vehicles = store.all_vehicles().await;
        assert_eq!(vehicles.len(), 2);
        assert_eq!(vehicles.iter().filter(|v| v.has_real_vin()).count(), 1);
        assert!(store
            .all_listings()
            .await
            .iter()
            .all(|l| l.status == ListingStatus::Active));
    }
}
