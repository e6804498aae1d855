use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use carwatch_core::{ScrapedRecord, SearchParams, SiteKey};
use carwatch_storage::{with_retry, HttpFetcher, RetryPolicy};
use chrono::Utc;
use tracing::info;

use crate::cards::{parse_cards, CardProfile, SearchStyle};
use crate::{AdapterError, SourceAdapter};

static PROFILES: [CardProfile; 7] = [
    CardProfile {
        site: SiteKey::Bat,
        origin: "https://bringatrailer.com",
        search: SearchStyle::Query {
            path: "/search/",
            param: "s",
            extra: &[],
        },
        card_selectors: &[".listing-card", ".search-result-item", "[class*=\"listing\"]"],
        link_selector: "a[href*=\"/listing/\"], h3 a, .listing-title a",
        price_selector: "[class*=\"price\"], [class*=\"bid\"]",
        location_selector: "[class*=\"location\"]",
        mileage_selector: None,
        auction: true,
    },
    CardProfile {
        site: SiteKey::CarsAndBids,
        origin: "https://carsandbids.com",
        search: SearchStyle::Query {
            path: "/search",
            param: "q",
            extra: &[],
        },
        card_selectors: &[".auction-card", "[class*=\"auction-item\"]", ".search-result"],
        link_selector: "a[href*=\"/auctions/\"], h3 a, .auction-title a",
        price_selector: "[class*=\"bid\"], [class*=\"price\"]",
        location_selector: "[class*=\"location\"]",
        mileage_selector: None,
        auction: true,
    },
    CardProfile {
        site: SiteKey::Autotrader,
        origin: "https://www.autotrader.com",
        search: SearchStyle::MakeModelPath {
            prefix: "/cars-for-sale/all-cars",
        },
        card_selectors: &[
            "[data-cmp=\"inventoryListing\"]",
            ".inventory-listing",
            "[data-cmp=\"itemCard\"]",
        ],
        link_selector: "a[href*=\"/cars-for-sale/vehicledetails\"]",
        price_selector: "[data-cmp=\"firstPrice\"], [class*=\"price\"]",
        location_selector: "[class*=\"dealer\"], [class*=\"location\"]",
        mileage_selector: Some("[class*=\"mileage\"], .listing-mileage"),
        auction: false,
    },
    CardProfile {
        site: SiteKey::Hemmings,
        origin: "https://www.hemmings.com",
        search: SearchStyle::Query {
            path: "/classifieds/cars/for-sale",
            param: "q",
            extra: &[],
        },
        card_selectors: &["[class*=\"listing-card\"]", ".listing", "article"],
        link_selector: "a[href*=\"/classifieds/cars/\"], a[href*=\"/auction/\"], a[href*=\"/listing/\"]",
        price_selector: "[class*=\"price\"]",
        location_selector: "[class*=\"location\"]",
        mileage_selector: Some("[class*=\"mileage\"]"),
        auction: false,
    },
    CardProfile {
        site: SiteKey::Pcarmarket,
        origin: "https://www.pcarmarket.com",
        search: SearchStyle::Query {
            path: "/search/",
            param: "q",
            extra: &[],
        },
        card_selectors: &[
            ".auction-card",
            ".auction-item",
            ".listing-card",
            ".vehicle-card",
            "article",
        ],
        link_selector: "a[href*=\"/auction/\"], a[href*=\"/listing/\"]",
        price_selector: "[class*=\"bid\"], [class*=\"price\"]",
        location_selector: "[class*=\"location\"]",
        mileage_selector: None,
        auction: true,
    },
    CardProfile {
        site: SiteKey::Hagerty,
        origin: "https://www.hagerty.com",
        search: SearchStyle::Query {
            path: "/marketplace/search",
            param: "q",
            extra: &[("type", "auctions"), ("forSale", "true")],
        },
        card_selectors: &["[class*=\"listing-card\"]", "[class*=\"auction-card\"]", "article"],
        link_selector: "a[href*=\"/marketplace/\"]",
        price_selector: "[class*=\"bid\"], [class*=\"price\"]",
        location_selector: "[class*=\"location\"]",
        mileage_selector: None,
        auction: true,
    },
    CardProfile {
        site: SiteKey::Autohunter,
        origin: "https://www.autohunter.com",
        search: SearchStyle::Query {
            path: "/search",
            param: "q",
            extra: &[],
        },
        card_selectors: &[".auction-card", "[class*=\"auction\"]", "article"],
        link_selector: "a[href*=\"/auction/\"], a[href*=\"/lot/\"]",
        price_selector: "[class*=\"bid\"], [class*=\"price\"]",
        location_selector: "[class*=\"location\"]",
        mileage_selector: Some("[class*=\"mileage\"]"),
        auction: true,
    },
];

/// Search results page layout for a scheduled marketplace.
pub fn profile_for(site: SiteKey) -> Option<&'static CardProfile> {
    PROFILES.iter().find(|p| p.site == site)
}

/// Fetches one marketplace's search page and reads its result cards.
#[derive(Debug, Clone)]
pub struct MarketplaceAdapter {
    profile: &'static CardProfile,
    http: Arc<HttpFetcher>,
    retry: RetryPolicy,
}

impl MarketplaceAdapter {
    pub fn new(site: SiteKey, http: Arc<HttpFetcher>, retry: RetryPolicy) -> Option<Self> {
        Some(Self {
            profile: profile_for(site)?,
            http,
            retry,
        })
    }
}

#[async_trait]
impl SourceAdapter for MarketplaceAdapter {
    fn site(&self) -> SiteKey {
        self.profile.site
    }

    async fn scrape(&self, params: &SearchParams) -> Result<Vec<ScrapedRecord>, AdapterError> {
        let site = self.profile.site;
        let url = self.profile.search_url(params)?;
        let started = Instant::now();
        let html = with_retry(&self.retry, site.as_str(), || {
            self.http.fetch_text(site, url.as_str())
        })
        .await?;
        let records = parse_cards(self.profile, &html, params, Utc::now().date_naive())?;
        info!(
            %site,
            url = %url,
            found = records.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "scraped search page"
        );
        Ok(records)
    }
}
