use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use carwatch_core::SiteKey;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

const BROWSER_USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Fixed user agent. When unset each request picks a browser-like one.
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_site_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_site_concurrency: 1,
        }
    }
}

/// Spaces out calls to a quota-limited provider.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// One request every `interval`, no burst.
    pub fn per_interval(interval: Duration) -> Self {
        Self::new(1, interval)
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = u32::try_from(elapsed.as_millis() / self.refill_every.as_millis())
                    .unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                if state.tokens == 0 {
                    state.last_refill = Instant::now();
                }
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("blocked by {url} (status {status})")]
    Blocked { status: u16, url: String },
}

/// Shared HTTP client for site adapters: one request at a time per site,
/// bounded overall, browser-like headers.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: Option<String>,
    global_limit: Arc<Semaphore>,
    per_site_limit: usize,
    per_site: Mutex<HashMap<SiteKey, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            user_agent: config.user_agent,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_site_limit: config.per_site_concurrency.max(1),
            per_site: Mutex::new(HashMap::new()),
        })
    }

    async fn per_site_semaphore(&self, site: SiteKey) -> Arc<Semaphore> {
        let mut map = self.per_site.lock().await;
        map.entry(site)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_site_limit)))
            .clone()
    }

    fn user_agent(&self) -> &str {
        match &self.user_agent {
            Some(ua) => ua,
            None => BROWSER_USER_AGENTS[fastrand::usize(..BROWSER_USER_AGENTS.len())],
        }
    }

    /// Single attempt. Callers wrap this in [`crate::with_retry`].
    pub async fn fetch_text(&self, site: SiteKey, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", %site, url);
        async {
            let _global = self
                .global_limit
                .acquire()
                .await
                .expect("semaphore not closed");
            let per_site = self.per_site_semaphore(site).await;
            let _site = per_site.acquire().await.expect("semaphore not closed");

            let resp = self
                .client
                .get(url)
                .header(reqwest::header::USER_AGENT, self.user_agent())
                .header(
                    reqwest::header::ACCEPT,
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.5")
                .send()
                .await?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if status.is_success() {
                let body = resp.text().await?;
                debug!(bytes = body.len(), "fetched page");
                return Ok(body);
            }
            if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(FetchError::Blocked {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            })
        }
        .instrument(span)
        .await
    }

    /// POST a JSON body and decode a JSON reply, for provider APIs.
    pub async fn post_json<B, R>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &B,
    ) -> Result<R, FetchError>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let mut req = self.client.post(url).json(body);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.json::<R>().await?)
    }
}
