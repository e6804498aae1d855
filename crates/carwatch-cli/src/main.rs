use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use carwatch_adapters::{AdapterRegistry, FixtureAdapter, GeminiFallback};
use carwatch_core::SiteKey;
use carwatch_storage::{HttpClientConfig, HttpFetcher, PgStore, RetryPolicy};
use carwatch_sync::{
    build_scheduler, LogMailer, Mailer, Notifier, ResendMailer, ScrapeOrchestrator,
    ScrapeRunReport, SearchPool, WorkerConfig,
};
use carwatch_web::AppState;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "carwatch")]
#[command(about = "Car listing scrape and reconciliation worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scheduler plus trigger server (default).
    Serve,
    /// Run one search in the foreground.
    Run {
        #[arg(long)]
        search: Uuid,
        /// Directory of `<site>.json` record files replayed instead of live scraping.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Run every active search in the foreground.
    RunAll,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Run { search, fixtures } => {
            let store = connect(&config).await?;
            let adapters = match fixtures {
                Some(dir) => fixture_registry(&dir)?,
                None => live_registry(&config)?,
            };
            let pool = build_pool(&config, store, adapters)?;
            let report = pool
                .run_search(search)
                .await
                .with_context(|| format!("running search {search}"))?;
            print_summary(&report);
        }
        Commands::RunAll => {
            let store = connect(&config).await?;
            let pool = build_pool(&config, store, live_registry(&config)?)?;
            let reports = pool.run_all().await.context("running active searches")?;
            for report in &reports {
                print_summary(report);
            }
        }
        Commands::Migrate => {
            connect(&config).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn connect(config: &WorkerConfig) -> Result<Arc<PgStore>> {
    let max_connections = u32::try_from(config.concurrency * 2 + 2).unwrap_or(10);
    let store = PgStore::connect(&config.database_url, max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("applying migrations")?;
    Ok(Arc::new(store))
}

fn http_fetcher(config: &WorkerConfig) -> Result<Arc<HttpFetcher>> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: config.user_agent.clone(),
        ..Default::default()
    })?;
    Ok(Arc::new(fetcher))
}

fn live_registry(config: &WorkerConfig) -> Result<AdapterRegistry> {
    Ok(AdapterRegistry::live(http_fetcher(config)?, RetryPolicy::default()))
}

fn fixture_registry(dir: &Path) -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    for site in SiteKey::SCHEDULED {
        let path = dir.join(format!("{}.json", site.as_str()));
        if path.exists() {
            registry = registry.with(FixtureAdapter::from_json_file(site, &path)?);
        }
    }
    anyhow::ensure!(!registry.is_empty(), "no <site>.json fixtures in {}", dir.display());
    Ok(registry)
}

fn build_pool(config: &WorkerConfig, store: Arc<PgStore>, adapters: AdapterRegistry) -> Result<SearchPool> {
    let mailer: Arc<dyn Mailer> = match &config.resend_api_key {
        Some(key) => Arc::new(ResendMailer::new(
            key.clone(),
            config.from_address.clone(),
            config.http_timeout(),
        )?),
        None => {
            info!("RESEND_API_KEY not set, alert emails will only be logged");
            Arc::new(LogMailer)
        }
    };
    let notifier = Notifier::new(store.clone(), store.clone(), mailer);
    let mut orchestrator = ScrapeOrchestrator::new(store, adapters, notifier)
        .with_low_yield_threshold(config.low_yield_threshold);
    if let Some(key) = &config.gemini_api_key {
        orchestrator = orchestrator.with_fallback(Arc::new(GeminiFallback::new(http_fetcher(config)?, key.clone())));
    }
    Ok(SearchPool::new(orchestrator, config.concurrency))
}

async fn serve(config: WorkerConfig) -> Result<()> {
    let store = connect(&config).await?;
    let pool = build_pool(&config, store, live_registry(&config)?)?;

    let mut sched = build_scheduler(pool.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(concurrency = config.concurrency, "scheduler started");

    if config.run_on_start {
        info!("RUN_ON_START set, running all active searches now");
        pool.enqueue_all();
    }
    if config.worker_token.is_none() {
        info!("WORKER_TOKEN not set, trigger routes are unauthenticated");
    }

    carwatch_web::serve(AppState::new(pool, config.worker_token.clone()), config.port).await?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

fn print_summary(report: &ScrapeRunReport) {
    println!(
        "search {}: sites={} failed_sites={} records={} created={} updated={} delisted={} alerts={} emails={}",
        report.search_id,
        report.sites.len(),
        report.failed_sites(),
        report.records_collected,
        report.created,
        report.updated,
        report.delisted,
        report.alerts.total(),
        report.notifications.sent,
    );
}
