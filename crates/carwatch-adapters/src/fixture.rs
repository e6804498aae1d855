use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use carwatch_core::{ScrapedRecord, SearchParams, SiteKey};
use chrono::Utc;

use crate::cards::parse_cards;
use crate::sites::profile_for;
use crate::{AdapterError, SourceAdapter};

#[derive(Debug, Clone)]
enum Canned {
    Records(Vec<ScrapedRecord>),
    Html(String),
    Fail(String),
}

/// Replays canned output instead of touching the network.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    site: SiteKey,
    canned: Canned,
    calls: Arc<AtomicUsize>,
}

impl FixtureAdapter {
    fn with(site: SiteKey, canned: Canned) -> Self {
        Self {
            site,
            canned,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn records(site: SiteKey, records: Vec<ScrapedRecord>) -> Self {
        Self::with(site, Canned::Records(records))
    }

    /// A saved search results page, parsed with the site's live selectors.
    pub fn html(site: SiteKey, html: impl Into<String>) -> Self {
        Self::with(site, Canned::Html(html.into()))
    }

    pub fn failing(site: SiteKey, message: impl Into<String>) -> Self {
        Self::with(site, Canned::Fail(message.into()))
    }

    /// JSON array of records, as written by `serde_json`.
    pub fn from_json_file(site: SiteKey, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<ScrapedRecord> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::records(site, records))
    }

    /// Shared call counter, readable after the adapter has been moved into a registry.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn site(&self) -> SiteKey {
        self.site
    }

    async fn scrape(&self, params: &SearchParams) -> Result<Vec<ScrapedRecord>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.canned {
            Canned::Records(records) => Ok(records.clone()),
            Canned::Html(html) => {
                let profile = profile_for(self.site).ok_or_else(|| {
                    AdapterError::Message(format!("no page layout for {}", self.site))
                })?;
                parse_cards(profile, html, params, Utc::now().date_naive())
            }
            Canned::Fail(message) => Err(AdapterError::Message(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SearchParams {
        SearchParams {
            make: "Toyota".into(),
            model: "Supra".into(),
            trim: None,
            year_min: 1993,
            year_max: 1998,
        }
    }

    #[tokio::test]
    async fn replays_records_and_counts_calls() {
        let record = ScrapedRecord::new(
            SiteKey::Hemmings,
            "https://www.hemmings.com/classifieds/cars/for-sale/toyota/supra/1",
            "1994 Toyota Supra Turbo",
            6_500_000,
        );
        let adapter = FixtureAdapter::records(SiteKey::Hemmings, vec![record.clone()]);
        let calls = adapter.call_counter();

        assert_eq!(adapter.scrape(&params()).await.unwrap(), vec![record]);
        assert_eq!(adapter.scrape(&params()).await.unwrap().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_fixture_reports_message() {
        let adapter = FixtureAdapter::failing(SiteKey::Pcarmarket, "captcha wall");
        let err = adapter.scrape(&params()).await.unwrap_err();
        assert_eq!(err.to_string(), "captcha wall");
    }

    #[tokio::test]
    async fn html_fixture_uses_site_selectors() {
        let adapter = FixtureAdapter::html(
            SiteKey::Autohunter,
            r#"<div class="auction-card">
                 <a href="/auction/1995-toyota-supra">1995 Toyota Supra</a>
                 <span class="current-bid">$58,000</span>
                 <span class="odometer-mileage">31,000 miles</span>
               </div>"#,
        );
        let records = adapter.scrape(&params()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, "https://www.autohunter.com/auction/1995-toyota-supra");
        assert_eq!(records[0].price_cents, 5_800_000);
        assert_eq!(records[0].mileage, Some(31_000));
    }

    #[test]
    fn loads_records_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bat.json");
        let record = ScrapedRecord::new(
            SiteKey::Bat,
            "https://bringatrailer.com/listing/1997-toyota-supra/",
            "1997 Toyota Supra",
            9_000_000,
        );
        fs::write(&path, serde_json::to_string(&vec![record.clone()]).unwrap()).unwrap();

        let adapter = FixtureAdapter::from_json_file(SiteKey::Bat, &path).unwrap();
        assert!(matches!(&adapter.canned, Canned::Records(r) if r == &vec![record]));
    }
}
