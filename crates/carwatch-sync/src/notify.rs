use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use askama::Template;
use async_trait::async_trait;
use carwatch_core::{NotificationSetting, RunAlerts, SavedSearch};
use carwatch_storage::{AccountDirectory, CatalogStore};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("rendering alert email: {0}")]
    Render(#[from] askama::Error),
    #[error("mail request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("mail provider rejected message with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound email sink.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifyError>;
}

/// Sends through the Resend REST API.
#[derive(Debug, Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building mail client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": to,
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Logs instead of sending. Used when no mail provider key is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), NotifyError> {
        info!(to, subject, bytes = html.len(), "mail sink disabled, alert email not sent");
        Ok(())
    }
}

/// Whole US dollars with thousands separators, e.g. 123_456_789 cents is "$1,234,568".
pub fn format_usd(cents: i64) -> String {
    let dollars = (cents.unsigned_abs() + 50) / 100;
    let digits = dollars.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if cents < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

struct ListingLine {
    title: String,
    url: String,
    price: String,
    site: String,
}

struct DropLine {
    title: String,
    url: String,
    old_price: String,
    new_price: String,
    drop_pct: String,
}

#[derive(Template)]
#[template(path = "alert_email.html")]
struct AlertEmail {
    label: String,
    new_listings: Vec<ListingLine>,
    price_drops: Vec<DropLine>,
    sold: Vec<ListingLine>,
}

pub fn email_subject(label: &str, alerts: &RunAlerts) -> String {
    format!("Car Tracker: {label} - {} updates", alerts.total())
}

pub fn render_alert_email(label: &str, alerts: &RunAlerts) -> Result<String, NotifyError> {
    let email = AlertEmail {
        label: label.to_string(),
        new_listings: alerts
            .new_listings
            .iter()
            .map(|a| ListingLine {
                title: a.title.clone(),
                url: a.url.clone(),
                price: format_usd(a.price),
                site: a.source_site.to_string(),
            })
            .collect(),
        price_drops: alerts
            .price_drops
            .iter()
            .map(|a| DropLine {
                title: a.listing_title.clone(),
                url: a.url.clone(),
                old_price: format_usd(a.old_price),
                new_price: format_usd(a.new_price),
                drop_pct: format!("{:.1}", a.drop_pct),
            })
            .collect(),
        sold: alerts
            .sold
            .iter()
            .map(|a| ListingLine {
                title: a.title.clone(),
                url: a.url.clone(),
                price: format_usd(a.sale_price),
                site: a.source_site.to_string(),
            })
            .collect(),
    };
    Ok(email.render()?)
}

/// The subset of a run's alerts one setting subscribes to.
pub fn filter_alerts(setting: &NotificationSetting, alerts: &RunAlerts) -> RunAlerts {
    RunAlerts {
        price_drops: if setting.price_drop_enabled {
            alerts
                .price_drops
                .iter()
                .filter(|a| a.drop_pct >= setting.price_drop_pct)
                .cloned()
                .collect()
        } else {
            Vec::new()
        },
        new_listings: if setting.new_listing_enabled {
            alerts.new_listings.clone()
        } else {
            Vec::new()
        },
        sold: if setting.sold_alert_enabled {
            alerts.sold.clone()
        } else {
            Vec::new()
        },
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyReport {
    pub sent: usize,
    /// Settings with nothing to send or no destination address.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn CatalogStore>,
    accounts: Arc<dyn AccountDirectory>,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        accounts: Arc<dyn AccountDirectory>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            store,
            accounts,
            mailer,
        }
    }

    /// One email per subscribed setting per run. Failures are logged and counted.
    pub async fn send_notifications(&self, search: &SavedSearch, alerts: &RunAlerts) -> NotifyReport {
        let mut report = NotifyReport::default();
        let settings = match self.store.notification_settings(search.id).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(search_id = %search.id, error = %err, "loading notification settings failed");
                report.failed += 1;
                return report;
            }
        };

        let label = search.label();
        for setting in &settings {
            let selected = filter_alerts(setting, alerts);
            if selected.is_empty() {
                report.skipped += 1;
                continue;
            }
            let Some(to) = self.destination(setting).await else {
                debug!(setting_id = %setting.id, "no destination address, skipping");
                report.skipped += 1;
                continue;
            };

            let subject = email_subject(&label, &selected);
            let sent = match render_alert_email(&label, &selected) {
                Ok(html) => self.mailer.send(&to, &subject, &html).await,
                Err(err) => Err(err),
            };
            match sent {
                Ok(()) => {
                    info!(search_id = %search.id, to = %to, updates = selected.total(), "alert email sent");
                    report.sent += 1;
                }
                Err(err) => {
                    warn!(search_id = %search.id, to = %to, error = %err, "alert email failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn destination(&self, setting: &NotificationSetting) -> Option<String> {
        if let Some(email) = setting.email.as_deref().filter(|e| !e.trim().is_empty()) {
            return Some(email.to_string());
        }
        match self.accounts.registered_email(setting.user_id).await {
            Ok(email) => email.filter(|e| !e.trim().is_empty()),
            Err(err) => {
                warn!(user_id = %setting.user_id, error = %err, "account lookup failed");
                None
            }
        }
    }
}
