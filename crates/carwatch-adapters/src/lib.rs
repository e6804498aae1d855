//! Marketplace adapters behind one scrape capability, plus the AI-assisted fallback searcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use carwatch_core::{ScrapedRecord, SearchParams, SiteKey};
use carwatch_storage::{FetchError, HttpFetcher, RetryPolicy};
use thiserror::Error;

mod auction;
mod cards;
mod fallback;
mod fixture;
mod sites;

pub use auction::{auction_result, sale_price_cents, sold_recently, AuctionResult};
pub use cards::{parse_cards, parse_mileage, parse_price_cents, CardProfile, SearchStyle};
pub use fallback::{
    parse_fallback_reply, FallbackError, FallbackSearcher, GeminiFallback, FALLBACK_INTERVAL,
    GEMINI_MODEL,
};
pub use fixture::FixtureAdapter;
pub use sites::{profile_for, MarketplaceAdapter};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http error: {0}")]
    Http(#[source] FetchError),
    #[error("blocked by {url} (status {status})")]
    Blocked { status: u16, url: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Blocked { status, url } => AdapterError::Blocked { status, url },
            other => AdapterError::Http(other),
        }
    }
}

/// One marketplace. Returns every in-range record it could read, or fails as a whole.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn site(&self) -> SiteKey;

    async fn scrape(&self, params: &SearchParams) -> Result<Vec<ScrapedRecord>, AdapterError>;
}

/// Closed set of adapters keyed by site.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<SiteKey, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live HTML adapters for every scheduled marketplace sharing one fetcher.
    pub fn live(http: Arc<HttpFetcher>, retry: RetryPolicy) -> Self {
        let mut registry = Self::new();
        for site in SiteKey::SCHEDULED {
            if let Some(adapter) = MarketplaceAdapter::new(site, http.clone(), retry) {
                registry = registry.with(adapter);
            }
        }
        registry
    }

    pub fn with(mut self, adapter: impl SourceAdapter + 'static) -> Self {
        self.adapters.insert(adapter.site(), Arc::new(adapter));
        self
    }

    pub fn get(&self, site: SiteKey) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&site).cloned()
    }

    /// Adapters for `sites` in the order given, skipping sites without one.
    pub fn for_sites(&self, sites: &[SiteKey]) -> Vec<(SiteKey, Arc<dyn SourceAdapter>)> {
        sites
            .iter()
            .filter_map(|site| self.get(*site).map(|a| (*site, a)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_fetches_keep_their_own_variant() {
        let err: AdapterError = FetchError::Blocked {
            status: 403,
            url: "https://bringatrailer.com/search/".into(),
        }
        .into();
        assert!(matches!(err, AdapterError::Blocked { status: 403, .. }));

        let err: AdapterError = FetchError::HttpStatus {
            status: 500,
            url: "https://carsandbids.com/search".into(),
        }
        .into();
        assert!(matches!(err, AdapterError::Http(_)));
    }

    #[test]
    fn registry_follows_requested_order_and_skips_missing() {
        let registry = AdapterRegistry::new()
            .with(FixtureAdapter::records(SiteKey::Hagerty, Vec::new()))
            .with(FixtureAdapter::records(SiteKey::Bat, Vec::new()));

        let sites = registry
            .for_sites(&[SiteKey::Bat, SiteKey::CarsAndBids, SiteKey::Hagerty])
            .into_iter()
            .map(|(site, _)| site)
            .collect::<Vec<_>>();
        assert_eq!(sites, vec![SiteKey::Bat, SiteKey::Hagerty]);
    }

    #[test]
    fn live_registry_covers_every_scheduled_site() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let registry = AdapterRegistry::live(http, RetryPolicy::default());
        assert_eq!(registry.len(), SiteKey::SCHEDULED.len());
        assert!(registry.get(SiteKey::Autotempest).is_none());
    }
}
