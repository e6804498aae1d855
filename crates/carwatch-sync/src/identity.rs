use carwatch_core::vin::{is_placeholder, parse_year, placeholder_vin};
use carwatch_core::{ScrapedRecord, Vehicle};
use carwatch_storage::{CatalogStore, StoreError, StoreResult};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Map a scraped record to a vehicle: by real VIN when it carries one,
/// otherwise a fresh vehicle under a placeholder VIN.
pub async fn resolve_vehicle(
    store: &dyn CatalogStore,
    record: &ScrapedRecord,
    make: &str,
    model: &str,
) -> StoreResult<Uuid> {
    let vin = match record.real_vin() {
        Some(vin) => {
            if let Some(existing) = store.vehicle_by_vin(vin).await? {
                return Ok(existing.id);
            }
            vin.to_string()
        }
        None => placeholder_vin(),
    };

    let vehicle = Vehicle {
        id: Uuid::new_v4(),
        vin,
        make: make.to_string(),
        model: model.to_string(),
        year: parse_year(&record.title),
        mileage: record.mileage,
        created_at: Utc::now(),
    };
    match store.insert_vehicle(&vehicle).await {
        Ok(()) => {
            debug!(vehicle_id = %vehicle.id, vin = %vehicle.vin, "vehicle created");
            Ok(vehicle.id)
        }
        // a concurrent run registered the same VIN first
        Err(StoreError::Conflict(_)) if !is_placeholder(&vehicle.vin) => store
            .vehicle_by_vin(&vehicle.vin)
            .await?
            .map(|v| v.id)
            .ok_or_else(|| StoreError::Conflict(format!("vehicles.vin={}", vehicle.vin))),
        Err(err) => Err(err),
    }
}

/// Replace a placeholder VIN with a real one. A real VIN is never overwritten.
/// Returns whether the vehicle changed.
pub async fn upgrade_vin(store: &dyn CatalogStore, vehicle_id: Uuid, vin: &str) -> StoreResult<bool> {
    let Some(vehicle) = store.vehicle(vehicle_id).await? else {
        return Ok(false);
    };
    if !is_placeholder(&vehicle.vin) {
        return Ok(false);
    }
    match store.set_vehicle_vin(vehicle_id, vin).await {
        Ok(()) => {
            debug!(%vehicle_id, vin, "placeholder vin upgraded");
            Ok(true)
        }
        Err(StoreError::Conflict(reason)) => {
            warn!(
                %vehicle_id,
                vin,
                reason = %reason,
                "vin already belongs to another vehicle, keeping placeholder; its listings are not cross-listed with that vehicle"
            );
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carwatch_core::SiteKey;
    use carwatch_storage::MemoryStore;

    const VIN: &str = "JT2JA82J5R0012345";

    fn record(vin: Option<&str>) -> ScrapedRecord {
        let mut record = ScrapedRecord::new(
            SiteKey::Bat,
            "https://bringatrailer.com/listing/1994-toyota-supra/",
            "1994 Toyota Supra Turbo 6-Speed",
            6_000_000,
        );
        record.vin = vin.map(str::to_string);
        record.mileage = Some(48_000);
        record
    }

    #[tokio::test]
    async fn reuses_vehicle_with_same_vin() {
        let store = MemoryStore::new();
        let first = resolve_vehicle(&store, &record(Some(VIN)), "Toyota", "Supra").await.unwrap();
        let second = resolve_vehicle(&store, &record(Some(VIN)), "Toyota", "Supra").await.unwrap();
        assert_eq!(first, second);

        let vehicle = store.vehicle(first).await.unwrap().unwrap();
        assert_eq!(vehicle.year, Some(1994));
        assert_eq!(vehicle.mileage, Some(48_000));
        assert_eq!(vehicle.make, "Toyota");
    }

    #[tokio::test]
    async fn records_without_vin_get_distinct_placeholders() {
        let store = MemoryStore::new();
        let a = resolve_vehicle(&store, &record(None), "Toyota", "Supra").await.unwrap();
        let b = resolve_vehicle(&store, &record(Some("not-a-vin")), "Toyota", "Supra").await.unwrap();
        assert_ne!(a, b);
        for id in [a, b] {
            let vehicle = store.vehicle(id).await.unwrap().unwrap();
            assert!(!vehicle.has_real_vin());
        }
    }

    #[tokio::test]
    async fn upgrade_is_one_way() {
        let store = MemoryStore::new();
        let id = resolve_vehicle(&store, &record(None), "Toyota", "Supra").await.unwrap();

        assert!(upgrade_vin(&store, id, VIN).await.unwrap());
        assert_eq!(store.vehicle(id).await.unwrap().unwrap().vin, VIN);

        assert!(!upgrade_vin(&store, id, "JT2JA82J5R0099999").await.unwrap());
        assert_eq!(store.vehicle(id).await.unwrap().unwrap().vin, VIN);
    }

    #[tokio::test]
    async fn upgrade_skips_vins_owned_elsewhere() {
        let store = MemoryStore::new();
        let owner = resolve_vehicle(&store, &record(Some(VIN)), "Toyota", "Supra").await.unwrap();
        let placeholder = resolve_vehicle(&store, &record(None), "Toyota", "Supra").await.unwrap();

        assert!(!upgrade_vin(&store, placeholder, VIN).await.unwrap());
        assert_ne!(owner, placeholder);
        assert!(!store.vehicle(placeholder).await.unwrap().unwrap().has_real_vin());
    }
}
