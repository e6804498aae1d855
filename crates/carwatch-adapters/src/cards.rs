use std::collections::HashSet;
use std::sync::LazyLock;

use carwatch_core::vin::{find_vin, parse_year};
use carwatch_core::{RecordStatus, ScrapedRecord, SearchParams, SiteKey};
use chrono::NaiveDate;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::auction::{auction_result, sale_price_cents, sold_recently, AuctionResult};
use crate::AdapterError;

static LOOSE_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$?\s*(\d[\d,]*)").expect("valid regex"));
static DOLLAR_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*(\d[\d,]*)").expect("valid regex"));
static K_MILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)k[-\s]mile").expect("valid regex"));
static MILES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d[\d,]*)(?:-mile|\s*mi(?:les)?\b)").expect("valid regex")
});

/// How a marketplace builds its search URL.
#[derive(Debug, Clone, Copy)]
pub enum SearchStyle {
    /// Free-text query in `param`, plus fixed extra pairs.
    Query {
        path: &'static str,
        param: &'static str,
        extra: &'static [(&'static str, &'static str)],
    },
    /// `{prefix}/{make}/{model}` slugs with year bounds in the query string.
    MakeModelPath { prefix: &'static str },
}

/// Selectors and URL layout for one marketplace's search results page.
#[derive(Debug, Clone, Copy)]
pub struct CardProfile {
    pub site: SiteKey,
    pub origin: &'static str,
    pub search: SearchStyle,
    /// Tried in order; the first that matches anything wins.
    pub card_selectors: &'static [&'static str],
    pub link_selector: &'static str,
    pub price_selector: &'static str,
    pub location_selector: &'static str,
    pub mileage_selector: Option<&'static str>,
    /// Auction cards carry sold/no-sale outcomes; classifieds are always active.
    pub auction: bool,
}

impl CardProfile {
    pub fn search_url(&self, params: &SearchParams) -> Result<Url, AdapterError> {
        let base = match self.search {
            SearchStyle::Query { path, .. } => format!("{}{}", self.origin, path),
            SearchStyle::MakeModelPath { prefix } => format!(
                "{}{}/{}/{}",
                self.origin,
                prefix,
                slug(&params.make),
                slug(&params.model)
            ),
        };
        let mut url =
            Url::parse(&base).map_err(|e| AdapterError::Parse(format!("search url {base}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            match self.search {
                SearchStyle::Query { param, extra, .. } => {
                    pairs.append_pair(param, &params.query());
                    for (key, value) in extra {
                        pairs.append_pair(key, value);
                    }
                }
                SearchStyle::MakeModelPath { .. } => {
                    pairs
                        .append_pair("startYear", &params.year_min.to_string())
                        .append_pair("endYear", &params.year_max.to_string())
                        .append_pair("sortBy", "relevance")
                        .append_pair("numRecords", "25");
                }
            }
        }
        Ok(url)
    }

    fn absolutize(&self, href: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            href.to_string()
        } else if let Some(rest) = href.strip_prefix("//") {
            format!("https://{rest}")
        } else if href.starts_with('/') {
            format!("{}{}", self.origin, href)
        } else {
            format!("{}/{}", self.origin, href)
        }
    }
}

fn slug(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Parse(format!("selector `{raw}`: {e}")))
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Price in cents from a price/bid label: `$12,345` or `Bid: 12,345`.
pub fn parse_price_cents(text: &str) -> Option<i64> {
    let caps = LOOSE_PRICE.captures(text)?;
    let dollars = caps[1].replace(',', "").parse::<i64>().ok()?;
    dollars.checked_mul(100)
}

fn dollar_amount_cents(text: &str) -> Option<i64> {
    let caps = DOLLAR_PRICE.captures(text)?;
    let dollars = caps[1].replace(',', "").parse::<i64>().ok()?;
    dollars.checked_mul(100)
}

/// Odometer reading from text like `23k-Mile`, `41,200 miles` or `8,100 mi`.
pub fn parse_mileage(text: &str) -> Option<i64> {
    if let Some(caps) = K_MILES.captures(text) {
        let thousands = caps[1].replace(',', "").parse::<f64>().ok()?;
        return Some((thousands * 1000.0).round() as i64);
    }
    let caps = MILES.captures(text)?;
    caps[1].replace(',', "").parse::<i64>().ok()
}

struct CardSelectors {
    link: Selector,
    price: Selector,
    location: Selector,
    mileage: Option<Selector>,
    image: Selector,
}

/// Extract records from a search results page. Cards outside the search's
/// year range, no-sale auctions and stale sales are dropped.
pub fn parse_cards(
    profile: &CardProfile,
    html: &str,
    params: &SearchParams,
    today: NaiveDate,
) -> Result<Vec<ScrapedRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let selectors = CardSelectors {
        link: selector(profile.link_selector)?,
        price: selector(profile.price_selector)?,
        location: selector(profile.location_selector)?,
        mileage: profile.mileage_selector.map(selector).transpose()?,
        image: selector("img")?,
    };

    let mut cards = Vec::new();
    for raw in profile.card_selectors {
        let sel = selector(raw)?;
        cards = document.select(&sel).collect::<Vec<_>>();
        if !cards.is_empty() {
            break;
        }
    }

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for card in &cards {
        let Some(record) = parse_card(profile, *card, &selectors, params, today) else {
            continue;
        };
        if seen.insert(record.url.clone()) {
            records.push(record);
        }
    }
    debug!(site = %profile.site, cards = cards.len(), records = records.len(), "parsed result cards");
    Ok(records)
}

fn parse_card(
    profile: &CardProfile,
    card: ElementRef<'_>,
    selectors: &CardSelectors,
    params: &SearchParams,
    today: NaiveDate,
) -> Option<ScrapedRecord> {
    let link = card.select(&selectors.link).next()?;
    let title = text_or_none(text_of(link))?;
    let href = link.value().attr("href").and_then(|h| text_or_none(h.to_string()))?;

    if let Some(year) = parse_year(&title) {
        if !params.year_in_range(year) {
            return None;
        }
    }

    let text = text_of(card);
    let price_text = card
        .select(&selectors.price)
        .map(text_of)
        .collect::<Vec<_>>()
        .join(" ");
    let mut price_cents = parse_price_cents(&price_text)
        .or_else(|| dollar_amount_cents(&text))
        .unwrap_or(0);

    let (status, sale_price) = if profile.auction {
        match auction_result(&text) {
            AuctionResult::NoSale => return None,
            AuctionResult::Sold => {
                if !sold_recently(&text, today) {
                    return None;
                }
                let sale = sale_price_cents(&text).unwrap_or(price_cents);
                if price_cents == 0 {
                    price_cents = sale;
                }
                (RecordStatus::Sold, Some(sale))
            }
            AuctionResult::Active => (RecordStatus::Active, None),
        }
    } else {
        (RecordStatus::Active, None)
    };

    let location = card
        .select(&selectors.location)
        .next()
        .and_then(|el| text_or_none(text_of(el)))
        .unwrap_or_default();
    let mileage = selectors
        .mileage
        .as_ref()
        .and_then(|sel| card.select(sel).next())
        .and_then(|el| parse_mileage(&text_of(el)))
        .or_else(|| parse_mileage(&title));
    let image_url = card.select(&selectors.image).next().and_then(|img| {
        img.value()
            .attr("src")
            .or_else(|| img.value().attr("data-src"))
            .and_then(|src| text_or_none(src.to_string()))
            .map(|src| profile.absolutize(&src))
    });

    Some(ScrapedRecord {
        vin: find_vin(&text),
        title,
        price_cents,
        url: profile.absolutize(&href),
        source_site: profile.site,
        location,
        mileage,
        status,
        sale_price,
        image_url,
    })
}
