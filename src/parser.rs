//! Pure text parsers for values scraped off the site.
//!
//! None of these touch the browser, so they are tested directly.

use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;

const LISTING_DATE_FORMAT: &str = "%Y年%m月%d日";
const DIGITAL_DATE_FORMAT: &str = "%Y/%m/%d";

fn price_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}(?:,\d{3})+|\d+)").expect("valid price regex"))
}

fn product_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/(?:dp|gp/product)/([^/?#]+)").expect("valid product id regex")
    })
}

fn count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}(?:,\d{3})+|\d+)").expect("valid count regex"))
}

/// First run of digits (with optional thousands separators) as an integer.
/// `"￥1,500"` and `"1,500円"` both give 1500.
pub fn parse_price(text: &str) -> Option<i64> {
    price_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// Product identifier embedded in a product URL.
pub fn product_id_from_url(url: &str) -> Option<String> {
    product_id_re()
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Order-count widget text such as `"64件"` or `"1,024 orders"`.
pub fn parse_order_count(text: &str) -> Option<u32> {
    count_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// Listing and standard-order date, e.g. `2025年01月15日`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), LISTING_DATE_FORMAT).ok()
}

/// Digital-order date, e.g. `2025/01/15`.
pub fn parse_date_digital(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DIGITAL_DATE_FORMAT).ok()
}
