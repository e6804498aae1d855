//! VIN recognition, placeholder identities and title year parsing.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

/// Prefix of synthetic identities. `-` never appears in a real VIN.
pub const PLACEHOLDER_PREFIX: &str = "UNKNOWN-";

static VIN_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-HJ-NPR-Z0-9]{17}$").expect("valid VIN regex"));
static VIN_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-HJ-NPR-Z0-9]{17}\b").expect("valid VIN regex"));
static YEAR_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid year regex"));

pub fn is_real_vin(candidate: &str) -> bool {
    VIN_EXACT.is_match(candidate)
}

pub fn is_placeholder(vin: &str) -> bool {
    !is_real_vin(vin)
}

/// A fresh synthetic identity for a vehicle scraped without a VIN.
pub fn placeholder_vin() -> String {
    format!("{PLACEHOLDER_PREFIX}{}", Uuid::new_v4().simple())
}

/// First VIN-shaped token in free text.
pub fn find_vin(text: &str) -> Option<String> {
    VIN_IN_TEXT.find(text).map(|m| m.as_str().to_string())
}

/// Model year from a listing title such as `1995 Porsche 911 Carrera`.
pub fn parse_year(title: &str) -> Option<i32> {
    YEAR_IN_TEXT
        .find(title)
        .and_then(|m| m.as_str().parse().ok())
}
