use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use carwatch_storage::StoreError;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{SCRAPE_CRON, SCRAPE_TIMEZONE};
use crate::orchestrator::{ScrapeOrchestrator, ScrapeRunReport};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("search {0} not found")]
    NotFound(Uuid),
    #[error("search {0} is already running")]
    AlreadyRunning(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Bounded pool of search runs. Every entry point funnels through here.
#[derive(Clone)]
pub struct SearchPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    orchestrator: ScrapeOrchestrator,
    permits: Semaphore,
    in_flight: Mutex<HashSet<Uuid>>,
}

/// Removes the search from the in-flight set when the run ends, however it ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.id);
    }
}

impl SearchPool {
    pub fn new(orchestrator: ScrapeOrchestrator, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                orchestrator,
                permits: Semaphore::new(concurrency.max(1)),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn claim(&self, id: Uuid) -> Option<InFlight<'_>> {
        let mut set = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        set.insert(id).then(|| InFlight {
            set: &self.inner.in_flight,
            id,
        })
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }

    /// Run one search once a pool slot is free. A search already queued or
    /// running in this process is refused.
    pub async fn run_search(&self, search_id: Uuid) -> Result<ScrapeRunReport, PoolError> {
        let Some(_claim) = self.claim(search_id) else {
            return Err(PoolError::AlreadyRunning(search_id));
        };
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .expect("semaphore not closed");
        let search = self
            .inner
            .orchestrator
            .store()
            .search(search_id)
            .await?
            .ok_or(PoolError::NotFound(search_id))?;
        Ok(self.inner.orchestrator.run_search_scrape(&search).await)
    }

    /// Run every active search through the pool and wait for all of them.
    pub async fn run_all(&self) -> Result<Vec<ScrapeRunReport>, PoolError> {
        let started = Instant::now();
        let searches = self.inner.orchestrator.store().active_searches().await?;
        info!(searches = searches.len(), "running all active searches");

        let mut tasks = JoinSet::new();
        for search in searches {
            let pool = self.clone();
            tasks.spawn(async move { pool.run_search(search.id).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(PoolError::AlreadyRunning(id))) => {
                    warn!(search_id = %id, "search already running, skipped");
                }
                Ok(Err(err)) => error!(error = %err, "search run failed"),
                Err(err) => error!(error = %err, "search task panicked"),
            }
        }
        info!(
            completed = reports.len(),
            duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
            "all searches finished"
        );
        Ok(reports)
    }

    /// Queue one search and return immediately.
    pub fn enqueue(&self, search_id: Uuid) {
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.run_search(search_id).await {
                Ok(_) => {}
                Err(PoolError::AlreadyRunning(id)) => {
                    warn!(search_id = %id, "duplicate trigger dropped, search already running");
                }
                Err(err) => error!(%search_id, error = %err, "triggered search failed"),
            }
        });
    }

    /// Queue every active search and return immediately.
    pub fn enqueue_all(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            if let Err(err) = pool.run_all().await {
                error!(error = %err, "run of all searches failed");
            }
        });
    }
}

/// Daily job at the fixed hour and timezone. The caller starts it.
pub async fn build_scheduler(pool: SearchPool) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async_tz(SCRAPE_CRON, SCRAPE_TIMEZONE, move |_uuid, _lock| {
        let pool = pool.clone();
        Box::pin(async move {
            info!(event = "job_started", job_name = "daily_scrape", "scheduled scrape starting");
            match pool.run_all().await {
                Ok(reports) => info!(
                    event = "job_finished",
                    job_name = "daily_scrape",
                    searches = reports.len(),
                    "scheduled scrape finished"
                ),
                Err(err) => error!(event = "job_failed", job_name = "daily_scrape", error = %err, "scheduled scrape failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {SCRAPE_CRON}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
