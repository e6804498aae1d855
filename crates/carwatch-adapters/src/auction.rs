use std::sync::LazyLock;

use chrono::{Datelike, Duration, Months, NaiveDate};
use regex::Regex;

static SOLD_FOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sold\s+(?:for|after)\s+(?:usd\s+)?\$").expect("valid regex"));
static SOLD_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sold\s+(?:for|after)\s+(?:usd\s+)?\$\s*([\d,]+)").expect("valid regex")
});
static BID_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bid\s+to\s+(?:usd\s+)?\$").expect("valid regex"));
static MONTH_DAY_YEAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+(\d{1,2}),?\s+(\d{4})")
        .expect("valid regex")
});
static NUMERIC_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("valid regex"));
static RELATIVE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s+(day|week|month|year)s?\s+ago").expect("valid regex")
});

/// How an auction card reads once it has closed, or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionResult {
    Active,
    Sold,
    /// Reserve not met or an ambiguous close. Such cards are dropped.
    NoSale,
}

pub fn auction_result(text: &str) -> AuctionResult {
    let lower = text.to_lowercase();
    if lower.contains("no sale") || lower.contains("reserve not met") {
        return AuctionResult::NoSale;
    }
    if SOLD_FOR.is_match(&lower) {
        return AuctionResult::Sold;
    }
    if BID_TO.is_match(&lower) || lower.contains("final bid") || lower.contains("auction ended") {
        return AuctionResult::NoSale;
    }
    AuctionResult::Active
}

/// Cents from "Sold for $X" / "Sold after $X".
pub fn sale_price_cents(text: &str) -> Option<i64> {
    let lower = text.to_lowercase();
    let caps = SOLD_AMOUNT.captures(&lower)?;
    let dollars = caps[1].replace(',', "").parse::<i64>().ok()?;
    dollars.checked_mul(100)
}

/// Whether a sold card is from the last three months. Cards without a
/// readable date count as recent.
pub fn sold_recently(text: &str, today: NaiveDate) -> bool {
    let cutoff = today.checked_sub_months(Months::new(3)).unwrap_or(NaiveDate::MIN);
    match sold_date(text, today) {
        Some(date) => date >= cutoff,
        None => true,
    }
}

fn sold_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Some(caps) = MONTH_DAY_YEAR.captures(text) {
        let month = month_number(&caps[1])?;
        let day = caps[2].parse().ok()?;
        let year = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    if let Some(caps) = NUMERIC_DATE.captures(text) {
        let month = caps[1].parse().ok()?;
        let day = caps[2].parse().ok()?;
        let year = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    let caps = RELATIVE_DATE.captures(text)?;
    let n: u32 = caps[1].parse().ok()?;
    match caps[2].to_ascii_lowercase().as_str() {
        "day" => today.checked_sub_signed(Duration::days(i64::from(n))),
        "week" => today.checked_sub_signed(Duration::weeks(i64::from(n))),
        "month" => today.checked_sub_months(Months::new(n)),
        "year" => today.with_year(today.year() - i32::try_from(n).ok()?),
        _ => None,
    }
}

fn month_number(abbrev: &str) -> Option<u32> {
    let idx = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ]
    .iter()
    .position(|m| abbrev.eq_ignore_ascii_case(m))?;
    u32::try_from(idx + 1).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auction_cards() {
        assert_eq!(auction_result("Bid: $41,000 · 2 days left"), AuctionResult::Active);
        assert_eq!(auction_result("Sold for $52,500 on 3/2/2026"), AuctionResult::Sold);
        assert_eq!(auction_result("Sold After $38,000"), AuctionResult::Sold);
        assert_eq!(auction_result("Bid to $30,000"), AuctionResult::NoSale);
        assert_eq!(auction_result("Reserve Not Met"), AuctionResult::NoSale);
        assert_eq!(auction_result("No Sale. Sold for $1 earlier"), AuctionResult::NoSale);
        assert_eq!(auction_result("Auction ended"), AuctionResult::NoSale);
    }

    #[test]
    fn extracts_sale_price_in_cents() {
        assert_eq!(sale_price_cents("Sold for USD $52,500"), Some(5_250_000));
        assert_eq!(sale_price_cents("Current bid $10,000"), None);
        assert_eq!(sale_price_cents("Sold for $99,999,999,999,999,999"), None);
    }

    #[test]
    fn old_sales_are_not_recent() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert!(sold_recently("Sold for $20,000 on Sep 30, 2026", today));
        assert!(!sold_recently("Sold for $20,000 on January 5, 2026", today));
        assert!(!sold_recently("Sold for $20,000 on 2/14/2025", today));
        assert!(sold_recently("Sold for $20,000 3 weeks ago", today));
        assert!(!sold_recently("Sold for $20,000 1 year ago", today));
        assert!(sold_recently("Sold for $20,000", today));
    }
}
