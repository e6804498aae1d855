//! Core domain model for the carwatch listing tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod vin;

/// Marketplaces known to the tracker, in the order a search visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteKey {
    Bat,
    CarsAndBids,
    Autotrader,
    Hemmings,
    Pcarmarket,
    Hagerty,
    Autohunter,
    /// Aggregator key. Records may carry it but no adapter is scheduled for it.
    Autotempest,
}

impl SiteKey {
    /// Sites a search scrapes by default, in declared order.
    pub const SCHEDULED: [SiteKey; 7] = [
        SiteKey::Bat,
        SiteKey::CarsAndBids,
        SiteKey::Autotrader,
        SiteKey::Hemmings,
        SiteKey::Pcarmarket,
        SiteKey::Hagerty,
        SiteKey::Autohunter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SiteKey::Bat => "bat",
            SiteKey::CarsAndBids => "carsandbids",
            SiteKey::Autotrader => "autotrader",
            SiteKey::Hemmings => "hemmings",
            SiteKey::Pcarmarket => "pcarmarket",
            SiteKey::Hagerty => "hagerty",
            SiteKey::Autohunter => "autohunter",
            SiteKey::Autotempest => "autotempest",
        }
    }

    pub fn domain(self) -> &'static str {
        match self {
            SiteKey::Bat => "bringatrailer.com",
            SiteKey::CarsAndBids => "carsandbids.com",
            SiteKey::Autotrader => "autotrader.com",
            SiteKey::Hemmings => "hemmings.com",
            SiteKey::Pcarmarket => "pcarmarket.com",
            SiteKey::Hagerty => "hagerty.com",
            SiteKey::Autohunter => "autohunter.com",
            SiteKey::Autotempest => "autotempest.com",
        }
    }
}

impl fmt::Display for SiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown site key: {0}")]
pub struct UnknownSiteKey(pub String);

impl FromStr for SiteKey {
    type Err = UnknownSiteKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        SiteKey::SCHEDULED
            .into_iter()
            .chain([SiteKey::Autotempest])
            .find(|k| k.as_str() == key)
            .ok_or(UnknownSiteKey(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    #[default]
    Idle,
    Running,
    Complete,
}

impl ScrapeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrapeStatus::Idle => "idle",
            ScrapeStatus::Running => "running",
            ScrapeStatus::Complete => "complete",
        }
    }
}

impl FromStr for ScrapeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(ScrapeStatus::Idle),
            "running" => Ok(ScrapeStatus::Running),
            "complete" => Ok(ScrapeStatus::Complete),
            other => Err(format!("unknown scrape status: {other}")),
        }
    }
}

/// Lifecycle of a listing row. Rows never disappear, they only move between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Sold,
    Delisted,
    CrossListed,
}

impl ListingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Sold => "sold",
            ListingStatus::Delisted => "delisted",
            ListingStatus::CrossListed => "cross_listed",
        }
    }
}

impl FromStr for ListingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ListingStatus::Active),
            "sold" => Ok(ListingStatus::Sold),
            "delisted" => Ok(ListingStatus::Delisted),
            "cross_listed" => Ok(ListingStatus::CrossListed),
            other => Err(format!("unknown listing status: {other}")),
        }
    }
}

/// Status as reported by a marketplace for one scraped record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Active,
    Sold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Error,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
        }
    }
}

/// Filter handed to every adapter for one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub year_min: i32,
    pub year_max: i32,
}

impl SearchParams {
    /// Free-text query such as `Porsche 911 Carrera`.
    pub fn query(&self) -> String {
        match self.trim.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(trim) => format!("{} {} {}", self.make, self.model, trim),
            None => format!("{} {}", self.make, self.model),
        }
    }

    pub fn year_in_range(&self, year: i32) -> bool {
        year >= self.year_min && year <= self.year_max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: Uuid,
    pub user_id: Uuid,
    pub make: String,
    pub model: String,
    pub trim: Option<String>,
    pub year_min: i32,
    pub year_max: i32,
    /// Empty means every scheduled site.
    #[serde(default)]
    pub enabled_sites: Vec<SiteKey>,
    pub is_active: bool,
    pub scrape_status: ScrapeStatus,
    pub scrape_step: i32,
    pub scrape_total_steps: i32,
    pub scrape_current_site: Option<SiteKey>,
}

impl SavedSearch {
    pub fn new(user_id: Uuid, make: &str, model: &str, year_min: i32, year_max: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            make: make.to_string(),
            model: model.to_string(),
            trim: None,
            year_min,
            year_max,
            enabled_sites: Vec::new(),
            is_active: true,
            scrape_status: ScrapeStatus::Idle,
            scrape_step: 0,
            scrape_total_steps: 0,
            scrape_current_site: None,
        }
    }

    pub fn params(&self) -> SearchParams {
        SearchParams {
            make: self.make.clone(),
            model: self.model.clone(),
            trim: self.trim.clone(),
            year_min: self.year_min,
            year_max: self.year_max,
        }
    }

    pub fn label(&self) -> String {
        format!(
            "{} {} ({}-{})",
            self.make, self.model, self.year_min, self.year_max
        )
    }

    /// Enabled sites in the fixed declared order, independent of how they were stored.
    pub fn scheduled_sites(&self) -> Vec<SiteKey> {
        SiteKey::SCHEDULED
            .into_iter()
            .filter(|k| self.enabled_sites.is_empty() || self.enabled_sites.contains(k))
            .collect()
    }

    pub fn progress(&self) -> ScrapeProgress {
        ScrapeProgress {
            status: self.scrape_status,
            step: self.scrape_step,
            total_steps: self.scrape_total_steps,
            current_site: self.scrape_current_site,
        }
    }
}

/// The externally polled progress columns of a saved search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeProgress {
    pub status: ScrapeStatus,
    pub step: i32,
    pub total_steps: i32,
    pub current_site: Option<SiteKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    /// Real 17-character VIN or a placeholder token, see [`vin::placeholder_vin`].
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: Option<i32>,
    pub mileage: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Vehicle {
    pub fn has_real_vin(&self) -> bool {
        !vin::is_placeholder(&self.vin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub search_id: Uuid,
    pub source_site: SiteKey,
    pub url: String,
    pub current_price: i64,
    pub sale_price: Option<i64>,
    pub status: ListingStatus,
    pub geography: String,
    pub image_url: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub price: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeLogEntry {
    pub id: Uuid,
    pub search_id: Uuid,
    pub source_site: SiteKey,
    /// Set when the row records the AI-assisted fallback rather than the site adapter.
    pub fallback: bool,
    pub status: LogStatus,
    pub listings_found: i32,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_PRICE_DROP_PCT: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSetting {
    pub id: Uuid,
    pub user_id: Uuid,
    pub search_id: Uuid,
    pub price_drop_enabled: bool,
    pub price_drop_pct: f64,
    pub new_listing_enabled: bool,
    pub sold_alert_enabled: bool,
    /// Overrides the account's registered address.
    pub email: Option<String>,
}

impl NotificationSetting {
    pub fn new(user_id: Uuid, search_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            search_id,
            price_drop_enabled: true,
            price_drop_pct: DEFAULT_PRICE_DROP_PCT,
            new_listing_enabled: true,
            sold_alert_enabled: true,
            email: None,
        }
    }
}

/// Raw adapter output. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub vin: Option<String>,
    pub title: String,
    pub price_cents: i64,
    pub url: String,
    pub source_site: SiteKey,
    #[serde(default)]
    pub location: String,
    pub mileage: Option<i64>,
    #[serde(default)]
    pub status: RecordStatus,
    pub sale_price: Option<i64>,
    pub image_url: Option<String>,
}

impl ScrapedRecord {
    pub fn new(source_site: SiteKey, url: &str, title: &str, price_cents: i64) -> Self {
        Self {
            vin: None,
            title: title.to_string(),
            price_cents,
            url: url.to_string(),
            source_site,
            location: String::new(),
            mileage: None,
            status: RecordStatus::Active,
            sale_price: None,
            image_url: None,
        }
    }

    /// The VIN when it looks like a real one; adapters occasionally hand back junk.
    pub fn real_vin(&self) -> Option<&str> {
        self.vin.as_deref().filter(|v| vin::is_real_vin(v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDropAlert {
    pub listing_title: String,
    pub old_price: i64,
    pub new_price: i64,
    pub drop_pct: f64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewListingAlert {
    pub title: String,
    pub price: i64,
    pub source_site: SiteKey,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoldAlert {
    pub title: String,
    pub sale_price: i64,
    pub source_site: SiteKey,
    pub url: String,
}

/// Alerts accumulated by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAlerts {
    pub price_drops: Vec<PriceDropAlert>,
    pub new_listings: Vec<NewListingAlert>,
    pub sold: Vec<SoldAlert>,
}

impl RunAlerts {
    pub fn total(&self) -> usize {
        self.price_drops.len() + self.new_listings.len() + self.sold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Percentage drop from `old` to `new`, e.g. 2_000_000 -> 1_800_000 is 10.0.
pub fn drop_pct(old: i64, new: i64) -> f64 {
    if old <= 0 {
        return 0.0;
    }
    (old - new) as f64 / old as f64 * 100.0
}
