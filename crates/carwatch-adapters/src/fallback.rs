use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use carwatch_core::{RecordStatus, ScrapedRecord, SearchParams, SiteKey};
use carwatch_storage::{FetchError, HttpFetcher, TokenBucket};
use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const GEMINI_MODEL: &str = "gemini-2.0-flash";
const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Spacing between provider calls, keeping under 15 requests per minute.
pub const FALLBACK_INTERVAL: Duration = Duration::from_millis(4500);

static JSON_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"));

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("fallback request failed: {0}")]
    Request(#[from] FetchError),
    #[error("fallback reply carried no text")]
    EmptyReply,
}

/// Searches a marketplace indirectly when its adapter came back empty.
#[async_trait]
pub trait FallbackSearcher: Send + Sync {
    async fn search_site(
        &self,
        params: &SearchParams,
        site: SiteKey,
    ) -> Result<Vec<ScrapedRecord>, FallbackError>;
}

/// Gemini with Google Search grounding.
#[derive(Debug)]
pub struct GeminiFallback {
    http: Arc<HttpFetcher>,
    api_key: String,
    model: String,
    bucket: TokenBucket,
}

impl GeminiFallback {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: GEMINI_MODEL.to_string(),
            bucket: TokenBucket::per_interval(FALLBACK_INTERVAL),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

fn prompt(params: &SearchParams, domain: &str) -> String {
    let trim = params
        .trim
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(|t| format!(" {t}"))
        .unwrap_or_default();
    [
        format!(
            "Find {} to {} {} {}{} car listings currently for sale on {}.",
            params.year_min, params.year_max, params.make, params.model, trim, domain
        ),
        String::new(),
        "For each listing you find, provide a JSON array of objects with these fields:".into(),
        "- title: the listing title".into(),
        "- price: number in USD (no $ sign, no commas, just the number)".into(),
        format!("- url: the full URL to the individual listing page on {domain}"),
        "- status: \"active\" or \"sold\"".into(),
        "- imageUrl: the main image URL if visible, otherwise null".into(),
        "- location: city/state if visible, otherwise empty string".into(),
        String::new(),
        "Return ONLY a valid JSON array. If no listings are found, return [].".into(),
        "Do not include markdown formatting or code fences, just raw JSON.".into(),
    ]
    .join("\n")
}

#[async_trait]
impl FallbackSearcher for GeminiFallback {
    async fn search_site(
        &self,
        params: &SearchParams,
        site: SiteKey,
    ) -> Result<Vec<ScrapedRecord>, FallbackError> {
        self.bucket.take().await;

        let url = format!("{GEMINI_ENDPOINT}/{}:generateContent", self.model);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt(params, site.domain()) }] }],
            "tools": [{ "google_search": {} }],
        });
        let reply: GenerateContentResponse = self
            .http
            .post_json(&url, &[("x-goog-api-key", self.api_key.as_str())], &body)
            .await?;

        let text = reply
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(FallbackError::EmptyReply);
        }

        let records = parse_fallback_reply(&text, site, params);
        info!(%site, found = records.len(), "fallback search finished");
        Ok(records)
    }
}

/// Read the JSON array out of a model reply, keeping only priced listings on `site`'s domain.
pub fn parse_fallback_reply(text: &str, site: SiteKey, params: &SearchParams) -> Vec<ScrapedRecord> {
    let Some(found) = JSON_ARRAY.find(text) else {
        debug!(%site, "no JSON array in fallback reply");
        return Vec::new();
    };
    let items: Vec<JsonValue> = match serde_json::from_str(found.as_str()) {
        Ok(items) => items,
        Err(err) => {
            debug!(%site, error = %err, "fallback reply was not a JSON array");
            return Vec::new();
        }
    };

    let domain = site.domain();
    items
        .iter()
        .filter_map(|item| {
            let url = item.get("url")?.as_str()?;
            if !url.contains(domain) || Url::parse(url).is_err() {
                return None;
            }
            let dollars = match item.get("price")? {
                JsonValue::Number(n) => n.as_f64()?,
                JsonValue::String(s) => s.replace([',', '$'], "").trim().parse::<f64>().ok()?,
                _ => return None,
            };
            if dollars.is_nan() || dollars <= 0.0 {
                return None;
            }
            let title = item
                .get("title")
                .and_then(JsonValue::as_str)
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} {}", params.make, params.model));

            let mut record = ScrapedRecord::new(site, url, &title, (dollars * 100.0).round() as i64);
            record.location = item
                .get("location")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            if item.get("status").and_then(JsonValue::as_str) == Some("sold") {
                record.status = RecordStatus::Sold;
            }
            record.image_url = item
                .get("imageUrl")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            Some(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SearchParams {
        SearchParams {
            make: "Honda".into(),
            model: "NSX".into(),
            trim: None,
            year_min: 1991,
            year_max: 2005,
        }
    }

    #[test]
    fn keeps_only_priced_listings_on_the_site_domain() {
        let reply = r#"Here you go:
```json
[
  {"title": "1991 Acura NSX", "price": 82000, "url": "https://carsandbids.com/auctions/abc/1991-acura-nsx", "status": "active", "location": "Denver, CO", "imageUrl": null},
  {"title": "2002 Acura NSX-T", "price": "$125,500", "url": "https://carsandbids.com/auctions/def", "status": "sold"},
  {"title": "wrong site", "price": 90000, "url": "https://bringatrailer.com/listing/nsx"},
  {"title": "no price", "price": 0, "url": "https://carsandbids.com/auctions/zero"},
  {"price": 70000, "url": "https://carsandbids.com/auctions/untitled"}
]
```"#;
        let records = parse_fallback_reply(reply, SiteKey::CarsAndBids, &params());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].price_cents, 8_200_000);
        assert_eq!(records[0].location, "Denver, CO");
        assert_eq!(records[0].source_site, SiteKey::CarsAndBids);
        assert_eq!(records[1].price_cents, 12_550_000);
        assert_eq!(records[1].status, RecordStatus::Sold);
        assert_eq!(records[1].sale_price, None);
        assert_eq!(records[2].title, "Honda NSX");
    }

    #[test]
    fn unparseable_replies_yield_nothing() {
        assert!(parse_fallback_reply("no listings found", SiteKey::Bat, &params()).is_empty());
        assert!(parse_fallback_reply("[not json]", SiteKey::Bat, &params()).is_empty());
    }

    #[test]
    fn prompt_names_the_domain_and_years() {
        let text = prompt(&params(), "hagerty.com");
        assert!(text.starts_with("Find 1991 to 2005 Honda NSX car listings currently for sale on hagerty.com."));
        assert!(text.contains("Return ONLY a valid JSON array."));
    }
}
