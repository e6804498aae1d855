use async_trait::async_trait;
use carwatch_core::{
    LogStatus, Listing, ListingStatus, NotificationSetting, PriceHistoryEntry, SavedSearch,
    ScrapeLogEntry, ScrapeProgress, ScrapeStatus, SiteKey, Vehicle, DEFAULT_PRICE_DROP_PCT,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{AccountDirectory, CatalogStore, StoreError, StoreResult};

const SEARCH_COLUMNS: &str = "id, user_id, make, model, trim, year_min, year_max, enabled_sites, \
     is_active, scrape_status, scrape_step, scrape_total_steps, scrape_current_site";
const LISTING_COLUMNS: &str = "id, vehicle_id, search_id, source_site, url, current_price, \
     sale_price, status, geography, image_url, first_seen, last_seen";
const VEHICLE_COLUMNS: &str = "id, vin, make, model, year, mileage, created_at";

/// Postgres-backed catalog.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("catalog migrations applied");
        Ok(())
    }
}

fn write_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn site_col(row: &PgRow, col: &str) -> StoreResult<SiteKey> {
    let raw: String = row.try_get(col)?;
    raw.parse().map_err(|e: carwatch_core::UnknownSiteKey| StoreError::Corrupt(e.to_string()))
}

fn search_from_row(row: &PgRow) -> StoreResult<SavedSearch> {
    let sites: Vec<String> = row.try_get("enabled_sites")?;
    let enabled_sites = sites
        .iter()
        .map(|s| s.parse::<SiteKey>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let status: String = row.try_get("scrape_status")?;
    let current: Option<String> = row.try_get("scrape_current_site")?;
    Ok(SavedSearch {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        trim: row.try_get("trim")?,
        year_min: row.try_get("year_min")?,
        year_max: row.try_get("year_max")?,
        enabled_sites,
        is_active: row.try_get("is_active")?,
        scrape_status: status.parse::<ScrapeStatus>().map_err(StoreError::Corrupt)?,
        scrape_step: row.try_get("scrape_step")?,
        scrape_total_steps: row.try_get("scrape_total_steps")?,
        scrape_current_site: current
            .map(|s| s.parse::<SiteKey>())
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
    })
}

fn vehicle_from_row(row: &PgRow) -> StoreResult<Vehicle> {
    Ok(Vehicle {
        id: row.try_get("id")?,
        vin: row.try_get("vin")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        year: row.try_get("year")?,
        mileage: row.try_get("mileage")?,
        created_at: row.try_get("created_at")?,
    })
}

fn listing_from_row(row: &PgRow) -> StoreResult<Listing> {
    let status: String = row.try_get("status")?;
    Ok(Listing {
        id: row.try_get("id")?,
        vehicle_id: row.try_get("vehicle_id")?,
        search_id: row.try_get("search_id")?,
        source_site: site_col(row, "source_site")?,
        url: row.try_get("url")?,
        current_price: row.try_get("current_price")?,
        sale_price: row.try_get("sale_price")?,
        status: status.parse::<ListingStatus>().map_err(StoreError::Corrupt)?,
        geography: row.try_get("geography")?,
        image_url: row.try_get("image_url")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn price_from_row(row: &PgRow) -> StoreResult<PriceHistoryEntry> {
    Ok(PriceHistoryEntry {
        id: row.try_get("id")?,
        listing_id: row.try_get("listing_id")?,
        price: row.try_get("price")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn scrape_log_from_row(row: &PgRow) -> StoreResult<ScrapeLogEntry> {
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "success" => LogStatus::Success,
        "error" => LogStatus::Error,
        other => return Err(StoreError::Corrupt(format!("unknown scrape log status: {other}"))),
    };
    Ok(ScrapeLogEntry {
        id: row.try_get("id")?,
        search_id: row.try_get("search_id")?,
        source_site: site_col(row, "source_site")?,
        fallback: row.try_get("fallback")?,
        status,
        listings_found: row.try_get("listings_found")?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
        created_at: row.try_get("created_at")?,
    })
}

fn setting_from_row(row: &PgRow) -> StoreResult<NotificationSetting> {
    let pct: Option<f64> = row.try_get("price_drop_pct")?;
    Ok(NotificationSetting {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        search_id: row.try_get("search_id")?,
        price_drop_enabled: row.try_get("price_drop_enabled")?,
        price_drop_pct: pct.unwrap_or(DEFAULT_PRICE_DROP_PCT),
        new_listing_enabled: row.try_get("new_listing_enabled")?,
        sold_alert_enabled: row.try_get("sold_alert_enabled")?,
        email: row
            .try_get::<Option<String>, _>("email")?
            .filter(|e| !e.trim().is_empty()),
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn active_searches(&self) -> StoreResult<Vec<SavedSearch>> {
        let rows = sqlx::query(&format!(
            "SELECT {SEARCH_COLUMNS} FROM saved_searches WHERE is_active ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(search_from_row).collect()
    }

    async fn search(&self, id: Uuid) -> StoreResult<Option<SavedSearch>> {
        let row = sqlx::query(&format!(
            "SELECT {SEARCH_COLUMNS} FROM saved_searches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(search_from_row).transpose()
    }

    async fn update_progress(&self, search_id: Uuid, progress: ScrapeProgress) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE saved_searches
               SET scrape_status = $2,
                   scrape_step = $3,
                   scrape_total_steps = $4,
                   scrape_current_site = $5
             WHERE id = $1
            "#,
        )
        .bind(search_id)
        .bind(progress.status.as_str())
        .bind(progress.step)
        .bind(progress.total_steps)
        .bind(progress.current_site.map(SiteKey::as_str))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "saved search",
                id: search_id,
            });
        }
        Ok(())
    }

    async fn vehicle(&self, id: Uuid) -> StoreResult<Option<Vehicle>> {
        let row = sqlx::query(&format!("SELECT {VEHICLE_COLUMNS} FROM vehicles WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(vehicle_from_row).transpose()
    }

    async fn vehicle_by_vin(&self, vin: &str) -> StoreResult<Option<Vehicle>> {
        let row = sqlx::query(&format!("SELECT {VEHICLE_COLUMNS} FROM vehicles WHERE vin = $1"))
            .bind(vin)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(vehicle_from_row).transpose()
    }

    async fn insert_vehicle(&self, vehicle: &Vehicle) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vehicles (id, vin, make, model, year, mileage, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(vehicle.id)
        .bind(&vehicle.vin)
        .bind(&vehicle.make)
        .bind(&vehicle.model)
        .bind(vehicle.year)
        .bind(vehicle.mileage)
        .bind(vehicle.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn set_vehicle_vin(&self, vehicle_id: Uuid, vin: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE vehicles SET vin = $2 WHERE id = $1")
            .bind(vehicle_id)
            .bind(vin)
            .execute(&self.pool)
            .await
            .map_err(write_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "vehicle",
                id: vehicle_id,
            });
        }
        Ok(())
    }

    async fn delete_vehicle(&self, vehicle_id: Uuid) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM vehicles WHERE id = $1 \
             AND NOT EXISTS (SELECT 1 FROM listings WHERE vehicle_id = $1)",
        )
        .bind(vehicle_id)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn listing_by_url(&self, search_id: Uuid, url: &str) -> StoreResult<Option<Listing>> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE search_id = $1 AND url = $2"
        ))
        .bind(search_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn listing_by_vehicle_site(
        &self,
        search_id: Uuid,
        vehicle_id: Uuid,
        site: SiteKey,
    ) -> StoreResult<Option<Listing>> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             WHERE search_id = $1 AND vehicle_id = $2 AND source_site = $3"
        ))
        .bind(search_id)
        .bind(vehicle_id)
        .bind(site.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn insert_listing(&self, listing: &Listing) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO listings (
                id, vehicle_id, search_id, source_site, url, current_price, sale_price,
                status, geography, image_url, first_seen, last_seen
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(listing.id)
        .bind(listing.vehicle_id)
        .bind(listing.search_id)
        .bind(listing.source_site.as_str())
        .bind(&listing.url)
        .bind(listing.current_price)
        .bind(listing.sale_price)
        .bind(listing.status.as_str())
        .bind(&listing.geography)
        .bind(&listing.image_url)
        .bind(listing.first_seen)
        .bind(listing.last_seen)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn update_listing(&self, listing: &Listing) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET current_price = $2,
                   sale_price = $3,
                   status = $4,
                   last_seen = $5
             WHERE id = $1
            "#,
        )
        .bind(listing.id)
        .bind(listing.current_price)
        .bind(listing.sale_price)
        .bind(listing.status.as_str())
        .bind(listing.last_seen)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "listing",
                id: listing.id,
            });
        }
        Ok(())
    }

    async fn listings_for_vehicle(
        &self,
        vehicle_id: Uuid,
        statuses: &[ListingStatus],
    ) -> StoreResult<Vec<Listing>> {
        let statuses = statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             WHERE vehicle_id = $1 AND status = ANY($2) ORDER BY first_seen, id"
        ))
        .bind(vehicle_id)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn listings_for_search(
        &self,
        search_id: Uuid,
        status: Option<ListingStatus>,
    ) -> StoreResult<Vec<Listing>> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings \
             WHERE search_id = $1 AND ($2::text IS NULL OR status = $2) ORDER BY first_seen, id"
        ))
        .bind(search_id)
        .bind(status.map(ListingStatus::as_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    async fn set_listing_status(&self, ids: &[Uuid], status: ListingStatus) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("UPDATE listings SET status = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn latest_price(&self, listing_id: Uuid) -> StoreResult<Option<PriceHistoryEntry>> {
        let row = sqlx::query(
            r#"
            SELECT id, listing_id, price, recorded_at
              FROM price_history
             WHERE listing_id = $1
             ORDER BY recorded_at DESC
             LIMIT 1
            "#,
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(price_from_row).transpose()
    }

    async fn append_price(&self, entry: &PriceHistoryEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO price_history (id, listing_id, price, recorded_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(entry.id)
        .bind(entry.listing_id)
        .bind(entry.price)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn price_history(&self, listing_id: Uuid) -> StoreResult<Vec<PriceHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, listing_id, price, recorded_at
              FROM price_history
             WHERE listing_id = $1
             ORDER BY recorded_at ASC
            "#,
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(price_from_row).collect()
    }

    async fn append_scrape_log(&self, entry: &ScrapeLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_log (
                id, search_id, source_site, fallback, status, listings_found,
                error_message, duration_ms, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.id)
        .bind(entry.search_id)
        .bind(entry.source_site.as_str())
        .bind(entry.fallback)
        .bind(entry.status.as_str())
        .bind(entry.listings_found)
        .bind(&entry.error_message)
        .bind(entry.duration_ms)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;
        Ok(())
    }

    async fn scrape_logs(&self, search_id: Uuid) -> StoreResult<Vec<ScrapeLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, search_id, source_site, fallback, status, listings_found,
                   error_message, duration_ms, created_at
              FROM scrape_log
             WHERE search_id = $1
             ORDER BY created_at ASC
            "#,
        )
        .bind(search_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scrape_log_from_row).collect()
    }

    async fn notification_settings(&self, search_id: Uuid) -> StoreResult<Vec<NotificationSetting>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, search_id, price_drop_enabled, price_drop_pct,
                   new_listing_enabled, sold_alert_enabled, email
              FROM notification_settings
             WHERE search_id = $1
            "#,
        )
        .bind(search_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(setting_from_row).collect()
    }
}

#[async_trait]
impl AccountDirectory for PgStore {
    async fn registered_email(&self, user_id: Uuid) -> StoreResult<Option<String>> {
        let email: Option<String> = sqlx::query_scalar("SELECT email FROM accounts WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email)
    }
}
