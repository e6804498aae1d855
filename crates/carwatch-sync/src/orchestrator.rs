use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use carwatch_adapters::{AdapterError, AdapterRegistry, FallbackSearcher};
use carwatch_core::{
    LogStatus, RunAlerts, SavedSearch, ScrapeLogEntry, ScrapeProgress, ScrapeStatus, ScrapedRecord,
    SiteKey,
};
use carwatch_storage::CatalogStore;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::detect::detect_delisted;
use crate::notify::{Notifier, NotifyReport};
use crate::reconcile::reconcile;

/// Result of one adapter invocation.
pub type StepOutcome = Result<Vec<ScrapedRecord>, AdapterError>;

/// What one adapter (or fallback) step contributed to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteReport {
    pub site: SiteKey,
    pub fallback: bool,
    pub status: LogStatus,
    pub listings_found: usize,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl SiteReport {
    /// Fold one step result into its report row and the records it yielded.
    fn fold<E: Display>(
        site: SiteKey,
        fallback: bool,
        outcome: Result<Vec<ScrapedRecord>, E>,
        started: Instant,
    ) -> (Self, Vec<ScrapedRecord>) {
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        match outcome {
            Ok(records) => (
                Self {
                    site,
                    fallback,
                    status: LogStatus::Success,
                    listings_found: records.len(),
                    error: None,
                    duration_ms,
                },
                records,
            ),
            Err(err) => (
                Self {
                    site,
                    fallback,
                    status: LogStatus::Error,
                    listings_found: 0,
                    error: Some(err.to_string()),
                    duration_ms,
                },
                Vec::new(),
            ),
        }
    }

    fn log_entry(&self, search_id: Uuid) -> ScrapeLogEntry {
        ScrapeLogEntry {
            id: Uuid::new_v4(),
            search_id,
            source_site: self.site,
            fallback: self.fallback,
            status: self.status,
            listings_found: i32::try_from(self.listings_found).unwrap_or(i32::MAX),
            error_message: self.error.clone(),
            duration_ms: self.duration_ms,
            created_at: Utc::now(),
        }
    }
}

/// Everything one search run did, returned to the caller and logged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScrapeRunReport {
    pub search_id: Uuid,
    pub sites: Vec<SiteReport>,
    pub records_collected: usize,
    pub created: usize,
    pub updated: usize,
    pub discarded: usize,
    /// Records skipped because a store call failed.
    pub skipped: usize,
    pub delisted: u64,
    pub alerts: RunAlerts,
    pub notifications: NotifyReport,
}

impl ScrapeRunReport {
    pub fn failed_sites(&self) -> usize {
        self.sites
            .iter()
            .filter(|s| s.status == LogStatus::Error)
            .count()
    }
}

/// Drives one saved search end to end.
#[derive(Clone)]
pub struct ScrapeOrchestrator {
    store: Arc<dyn CatalogStore>,
    adapters: AdapterRegistry,
    fallback: Option<Arc<dyn FallbackSearcher>>,
    notifier: Notifier,
    low_yield_threshold: usize,
}

impl ScrapeOrchestrator {
    pub fn new(store: Arc<dyn CatalogStore>, adapters: AdapterRegistry, notifier: Notifier) -> Self {
        Self {
            store,
            adapters,
            fallback: None,
            notifier,
            low_yield_threshold: 5,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackSearcher>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_low_yield_threshold(mut self, threshold: usize) -> Self {
        self.low_yield_threshold = threshold;
        self
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    /// Run every enabled adapter in declared order, then reconcile, delist and notify.
    /// Nothing in here is fatal to the run.
    pub async fn run_search_scrape(&self, search: &SavedSearch) -> ScrapeRunReport {
        let span = info_span!("search_run", search_id = %search.id, label = %search.label());
        self.run_inner(search).instrument(span).await
    }

    async fn run_inner(&self, search: &SavedSearch) -> ScrapeRunReport {
        let started = Instant::now();
        let params = search.params();
        let adapters = self.adapters.for_sites(&search.scheduled_sites());
        let total_steps = i32::try_from(adapters.len()).unwrap_or(i32::MAX);
        let mut report = ScrapeRunReport {
            search_id: search.id,
            ..ScrapeRunReport::default()
        };
        info!(sites = adapters.len(), "scrape run started");

        self.set_progress(search.id, ScrapeStatus::Running, 0, total_steps, None)
            .await;

        let mut records = Vec::new();
        for (step, (site, adapter)) in adapters.iter().enumerate() {
            let step = i32::try_from(step).unwrap_or(i32::MAX);
            self.set_progress(search.id, ScrapeStatus::Running, step, total_steps, Some(*site))
                .await;

            let step_started = Instant::now();
            let outcome: StepOutcome = adapter.scrape(&params).await;
            let (site_report, found) = SiteReport::fold(*site, false, outcome, step_started);
            match &site_report.error {
                Some(error) => warn!(%site, error = %error, "adapter failed, continuing"),
                None => info!(%site, found = found.len(), "adapter finished"),
            }
            self.log_step(search.id, &site_report).await;
            report.sites.push(site_report);
            records.extend(found);
        }

        if records.len() < self.low_yield_threshold {
            if let Some(fallback) = &self.fallback {
                let found = self
                    .run_fallback(search, fallback.as_ref(), &mut report, &records)
                    .await;
                records.extend(found);
            }
        }
        report.records_collected = records.len();

        let outcome = reconcile(self.store.as_ref(), search, &records).await;
        report.created = outcome.created;
        report.updated = outcome.updated;
        report.discarded = outcome.discarded;
        report.skipped = outcome.failed;

        report.delisted = match detect_delisted(self.store.as_ref(), search.id, &outcome.found_urls).await {
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "delisting pass failed");
                0
            }
        };

        report.notifications = self.notifier.send_notifications(search, &outcome.alerts).await;
        report.alerts = outcome.alerts;

        self.set_progress(search.id, ScrapeStatus::Complete, total_steps, total_steps, None)
            .await;

        info!(
            records = report.records_collected,
            created = report.created,
            updated = report.updated,
            delisted = report.delisted,
            failed_sites = report.failed_sites(),
            alerts = report.alerts.total(),
            emails = report.notifications.sent,
            duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            "scrape run finished"
        );
        report
    }

    /// Ask the fallback searcher about sites whose adapter came back empty.
    /// Records whose URL is already collected are dropped.
    async fn run_fallback(
        &self,
        search: &SavedSearch,
        fallback: &dyn FallbackSearcher,
        report: &mut ScrapeRunReport,
        collected: &[ScrapedRecord],
    ) -> Vec<ScrapedRecord> {
        let empty_sites = report
            .sites
            .iter()
            .filter(|s| !s.fallback && s.listings_found == 0)
            .map(|s| s.site)
            .collect::<Vec<_>>();
        if empty_sites.is_empty() {
            return Vec::new();
        }
        info!(
            collected = collected.len(),
            threshold = self.low_yield_threshold,
            sites = empty_sites.len(),
            "low yield, trying fallback search"
        );

        let params = search.params();
        let mut seen = collected
            .iter()
            .map(|r| r.url.clone())
            .collect::<HashSet<_>>();
        let mut merged = Vec::new();
        for site in empty_sites {
            let started = Instant::now();
            let outcome = fallback.search_site(&params, site).await;
            let (mut site_report, found) = SiteReport::fold(site, true, outcome, started);
            let fresh = found
                .into_iter()
                .filter(|r| seen.insert(r.url.clone()))
                .collect::<Vec<_>>();
            site_report.listings_found = fresh.len();
            if let Some(error) = &site_report.error {
                warn!(%site, error = %error, "fallback search failed");
            }
            self.log_step(search.id, &site_report).await;
            report.sites.push(site_report);
            merged.extend(fresh);
        }
        merged
    }

    async fn log_step(&self, search_id: Uuid, site_report: &SiteReport) {
        if let Err(err) = self
            .store
            .append_scrape_log(&site_report.log_entry(search_id))
            .await
        {
            warn!(site = %site_report.site, error = %err, "writing scrape log failed");
        }
    }

    async fn set_progress(
        &self,
        search_id: Uuid,
        status: ScrapeStatus,
        step: i32,
        total_steps: i32,
        current_site: Option<SiteKey>,
    ) {
        let progress = ScrapeProgress {
            status,
            step,
            total_steps,
            current_site,
        };
        if let Err(err) = self.store.update_progress(search_id, progress).await {
            warn!(error = %err, "updating scrape progress failed");
        }
    }
}
