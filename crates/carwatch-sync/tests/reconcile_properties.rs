use std::collections::HashSet;

use carwatch_core::{ListingStatus, RecordStatus, SavedSearch, ScrapedRecord, SiteKey};
use carwatch_storage::{CatalogStore, MemoryStore};
use carwatch_sync::reconcile;
use uuid::Uuid;

fn search() -> SavedSearch {
    SavedSearch::new(Uuid::new_v4(), "Acura", "NSX", 1991, 2005)
}

fn record(site: SiteKey, url: &str, price: i64) -> ScrapedRecord {
    ScrapedRecord::new(site, url, "1991 Acura NSX 5-Speed", price)
}

/// A realistic mixed batch: VIN'd and VIN-less records, the same car on two
/// sites, an auction sale, and noise.
fn batch() -> Vec<ScrapedRecord> {
    let vin = "JH4NA1157MT001234";
    let mut bat = record(SiteKey::Bat, "https://bringatrailer.com/listing/1991-acura-nsx-1/", 8_500_000);
    bat.vin = Some(vin.into());
    let mut hemmings = record(SiteKey::Hemmings, "https://www.hemmings.com/classifieds/nsx-1", 8_700_000);
    hemmings.vin = Some(vin.into());
    let mut sold = record(SiteKey::CarsAndBids, "https://carsandbids.com/auctions/nsx-2", 9_900_000);
    sold.status = RecordStatus::Sold;
    sold.sale_price = Some(9_600_000);
    vec![
        bat,
        hemmings,
        sold,
        record(SiteKey::Autotrader, "https://www.autotrader.com/cars-for-sale/vehicle/1", 7_900_000),
        record(SiteKey::Hagerty, "https://www.hagerty.com/marketplace/auction/nsx-3", 0),
        // same URL reported twice in one run
        record(SiteKey::Autotrader, "https://www.autotrader.com/cars-for-sale/vehicle/1", 7_900_000),
    ]
}

async fn assert_unique_keys(store: &MemoryStore) {
    let listings = store.all_listings().await;
    let by_url = listings
        .iter()
        .map(|l| (l.search_id, l.url.clone()))
        .collect::<HashSet<_>>();
    let by_vehicle_site = listings
        .iter()
        .map(|l| (l.search_id, l.vehicle_id, l.source_site))
        .collect::<HashSet<_>>();
    assert_eq!(by_url.len(), listings.len());
    assert_eq!(by_vehicle_site.len(), listings.len());
}

async fn assert_history_distinct_and_current(store: &MemoryStore) {
    for listing in store.all_listings().await {
        let history = store.price_history(listing.id).await.unwrap();
        assert!(!history.is_empty());
        for pair in history.windows(2) {
            assert_ne!(pair[0].price, pair[1].price);
        }
        assert_eq!(history.last().unwrap().price, listing.current_price);
    }
}

#[tokio::test]
async fn dedup_invariant_holds_for_mixed_batch() {
    let store = MemoryStore::new();
    let search = search();
    let outcome = reconcile(&store, &search, &batch()).await;

    assert_eq!(outcome.discarded, 1);
    assert_eq!(outcome.failed, 0);
    assert_eq!(store.all_listings().await.len(), 4);
    assert_unique_keys(&store).await;
    assert_history_distinct_and_current(&store).await;
}

#[tokio::test]
async fn second_identical_pass_changes_nothing() {
    let store = MemoryStore::new();
    let search = search();
    reconcile(&store, &search, &batch()).await;

    let before = store.all_listings().await;
    let prices_before = store.price_row_count().await;
    let vehicles_before = store.all_vehicles().await.len();

    let outcome = reconcile(&store, &search, &batch()).await;
    let after = store.all_listings().await;

    assert!(outcome.alerts.is_empty());
    assert_eq!(after.len(), before.len());
    for (a, b) in before.iter().zip(&after) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.status, b.status);
        assert_eq!(a.current_price, b.current_price);
        assert_eq!(a.sale_price, b.sale_price);
    }
    assert_eq!(store.price_row_count().await, prices_before);
    assert_eq!(store.all_vehicles().await.len(), vehicles_before);
}

#[tokio::test]
async fn price_history_stays_distinct_across_many_runs() {
    let store = MemoryStore::new();
    let search = search();
    let url = "https://www.hemmings.com/classifieds/nsx-9";
    for price in [8_000_000, 8_000_000, 7_800_000, 7_800_000, 8_000_000, 7_500_000, 7_500_000] {
        reconcile(&store, &search, &[record(SiteKey::Hemmings, url, price)]).await;
    }

    let listing = store.listing_by_url(search.id, url).await.unwrap().unwrap();
    let prices = store
        .price_history(listing.id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.price)
        .collect::<Vec<_>>();
    assert_eq!(prices, vec![8_000_000, 7_800_000, 8_000_000, 7_500_000]);
    assert_history_distinct_and_current(&store).await;
}

#[tokio::test]
async fn new_listing_scenario() {
    let store = MemoryStore::new();
    let search = search();
    let outcome = reconcile(&store, &search, &[record(SiteKey::Bat, "u1", 1_000_000)]).await;

    let vehicles = store.all_vehicles().await;
    assert_eq!(vehicles.len(), 1);
    assert!(!vehicles[0].has_real_vin());

    let listings = store.all_listings().await;
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].status, ListingStatus::Active);
    assert_eq!(listings[0].current_price, 1_000_000);

    let history = store.price_history(listings[0].id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, 1_000_000);

    assert_eq!(outcome.alerts.new_listings.len(), 1);
    assert_eq!(outcome.alerts.total(), 1);
}

#[tokio::test]
async fn sold_transition_scenario() {
    let store = MemoryStore::new();
    let search = search();
    reconcile(&store, &search, &[record(SiteKey::Bat, "u1", 1_000_000)]).await;

    let mut sold = record(SiteKey::Bat, "u1", 1_000_000);
    sold.status = RecordStatus::Sold;
    sold.sale_price = Some(950_000);
    let outcome = reconcile(&store, &search, &[sold]).await;

    let listing = &store.all_listings().await[0];
    assert_eq!(listing.status, ListingStatus::Sold);
    assert_eq!(listing.sale_price, Some(950_000));
    assert_eq!(listing.current_price, 950_000);
    assert_eq!(outcome.alerts.sold.len(), 1);
    assert_eq!(outcome.alerts.sold[0].sale_price, 950_000);
    assert!(outcome.alerts.price_drops.is_empty());
    assert_history_distinct_and_current(&store).await;
}

#[tokio::test]
async fn sold_without_sale_price_uses_listed_price() {
    let store = MemoryStore::new();
    let search = search();
    reconcile(&store, &search, &[record(SiteKey::Bat, "u1", 1_000_000)]).await;

    let mut sold = record(SiteKey::Bat, "u1", 1_020_000);
    sold.status = RecordStatus::Sold;
    reconcile(&store, &search, &[sold]).await;

    let listing = &store.all_listings().await[0];
    assert_eq!(listing.sale_price, Some(1_020_000));
}

#[tokio::test]
async fn zero_price_scenario() {
    let store = MemoryStore::new();
    let search = search();
    let outcome = reconcile(&store, &search, &[record(SiteKey::Bat, "u0", 0)]).await;

    assert_eq!(outcome.discarded, 1);
    assert_eq!(outcome.failed, 0);
    assert!(outcome.found_urls.is_empty());
    assert!(store.all_listings().await.is_empty());
    assert!(store.all_vehicles().await.is_empty());
}

#[tokio::test]
async fn cross_listed_listing_is_not_reverted_by_later_runs() {
    let store = MemoryStore::new();
    let search = search();
    reconcile(&store, &search, &batch()).await;

    let bat_url = "https://bringatrailer.com/listing/1991-acura-nsx-1/";
    let mut bat = record(SiteKey::Bat, bat_url, 8_400_000);
    bat.vin = Some("JH4NA1157MT001234".into());
    reconcile(&store, &search, &[bat]).await;

    let listing = store.listing_by_url(search.id, bat_url).await.unwrap().unwrap();
    assert_eq!(listing.status, ListingStatus::CrossListed);
    assert_eq!(listing.current_price, 8_400_000);
}
