//! Reconciliation engine for carwatch: turns raw scrape output into catalog
//! state, alerts and emails, and schedules the runs that produce it.

mod config;
mod detect;
mod identity;
mod notify;
mod orchestrator;
mod pool;
mod prices;
mod reconcile;

pub use config::{WorkerConfig, DEFAULT_FROM_ADDRESS, SCRAPE_CRON, SCRAPE_TIMEZONE};
pub use detect::{detect_cross_listings, detect_delisted};
pub use identity::{resolve_vehicle, upgrade_vin};
pub use notify::{
    email_subject, filter_alerts, format_usd, render_alert_email, LogMailer, Mailer, Notifier,
    NotifyError, NotifyReport, ResendMailer, RESEND_ENDPOINT,
};
pub use orchestrator::{ScrapeOrchestrator, ScrapeRunReport, SiteReport, StepOutcome};
pub use pool::{build_scheduler, PoolError, SearchPool};
pub use prices::record_price;
pub use reconcile::{reconcile, ReconcileOutcome};
