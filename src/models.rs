//! Core data models used throughout orderhist.
//!
//! These types represent the purchase records, crawl progress flags, and
//! failure ledger rows that flow between the crawler and the store.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Label used on the remote site (and in storage) for the archive bucket.
pub const ARCHIVE_LABEL: &str = "archive";

/// Top-level partition of purchase history: a calendar year or the
/// site's archive of hidden orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TimeFilter {
    Year(i32),
    Archive,
}

impl TimeFilter {
    /// Storage key (`"2024"` or `"archive"`).
    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TimeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeFilter::Year(y) => write!(f, "{}", y),
            TimeFilter::Archive => f.write_str(ARCHIVE_LABEL),
        }
    }
}

impl FromStr for TimeFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == ARCHIVE_LABEL {
            return Ok(TimeFilter::Archive);
        }
        s.parse::<i32>()
            .map(TimeFilter::Year)
            .map_err(|_| anyhow!("invalid time filter: '{}'", s))
    }
}

impl From<TimeFilter> for String {
    fn from(value: TimeFilter) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for TimeFilter {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// What sort of purchase a line item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ItemKind {
    #[default]
    Normal,
    GiftCard,
    Digital,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Normal => "Normal",
            ItemKind::GiftCard => "GiftCard",
            ItemKind::Digital => "Digital",
        }
    }
}

impl FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" | "" => Ok(ItemKind::Normal),
            "GiftCard" | "Gift card" => Ok(ItemKind::GiftCard),
            "Digital" => Ok(ItemKind::Digital),
            other => bail!("unknown item kind: '{}'", other),
        }
    }
}

/// One purchased line. An order yields one or more of these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    pub order_no: String,
    /// Product identifier; digital and legacy orders may lack one.
    pub product_id: Option<String>,
    pub date: NaiveDate,
    pub name: String,
    pub url: Option<String>,
    pub quantity: u32,
    /// Integer minor-currency units.
    pub price: i64,
    /// Breadcrumb path, outermost first. Possibly empty.
    pub category: Vec<String>,
    pub seller: String,
    pub condition: String,
    pub kind: ItemKind,
    /// Bucket the order was discovered in (absent for items recovered
    /// outside a listing walk).
    pub time_filter: Option<TimeFilter>,
    pub page: Option<u32>,
}

impl Item {
    /// Second half of the natural identity `(order_no, item_key)`.
    pub fn item_key(&self) -> String {
        match &self.product_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("name:{}", self.name),
        }
    }
}

/// An order discovered on a listing page, queued for detail extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub date: NaiveDate,
    pub order_no: String,
    pub url: String,
    pub time_filter: Option<TimeFilter>,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearStatus {
    pub time_filter: TimeFilter,
    pub order_count: u32,
    pub checked: bool,
}

/// Failure taxonomy recorded in the error ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Timeout,
    ParseError,
    FetchError,
    NoDetailLink,
    NoUrl,
    PriceError,
    NoOrderNo,
    OrderCountFallback,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "timeout",
            ErrorType::ParseError => "parse_error",
            ErrorType::FetchError => "fetch_error",
            ErrorType::NoDetailLink => "no_detail_link",
            ErrorType::NoUrl => "no_url",
            ErrorType::PriceError => "price_error",
            ErrorType::NoOrderNo => "no_order_no",
            ErrorType::OrderCountFallback => "order_count_fallback",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "timeout" => ErrorType::Timeout,
            "parse_error" => ErrorType::ParseError,
            "fetch_error" => ErrorType::FetchError,
            "no_detail_link" => ErrorType::NoDetailLink,
            "no_url" => ErrorType::NoUrl,
            "price_error" => ErrorType::PriceError,
            "no_order_no" => ErrorType::NoOrderNo,
            "order_count_fallback" => ErrorType::OrderCountFallback,
            other => bail!("unknown error type: '{}'", other),
        })
    }
}

/// Stage of the crawl a failure belongs to. Drives how the retry pass
/// repairs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorContext {
    Order,
    Year,
    Category,
    Thumbnail,
    Other(String),
}

impl ErrorContext {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorContext::Order => "order",
            ErrorContext::Year => "year",
            ErrorContext::Category => "category",
            ErrorContext::Thumbnail => "thumbnail",
            ErrorContext::Other(label) => label,
        }
    }

    pub fn parse(label: &str) -> Self {
        match label {
            "order" => ErrorContext::Order,
            "year" => ErrorContext::Year,
            "category" => ErrorContext::Category,
            "thumbnail" => ErrorContext::Thumbnail,
            other => ErrorContext::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the error ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLog {
    pub id: i64,
    pub url: String,
    pub error_type: ErrorType,
    pub context: ErrorContext,
    pub message: Option<String>,
    pub retry_count: u32,
    pub resolved: bool,
    pub order_no: Option<String>,
    pub item_name: Option<String>,
    pub order_year: Option<TimeFilter>,
    pub order_page: Option<u32>,
    pub order_index: Option<u32>,
    pub created_at: Option<NaiveDateTime>,
}

/// A failure about to be recorded. `(url, context)` is its natural key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewError {
    pub url: String,
    pub error_type: ErrorType,
    pub context: ErrorContext,
    pub message: Option<String>,
    pub order_no: Option<String>,
    pub item_name: Option<String>,
    pub order_year: Option<TimeFilter>,
    pub order_page: Option<u32>,
    pub order_index: Option<u32>,
}

impl NewError {
    pub fn new(url: impl Into<String>, error_type: ErrorType, context: ErrorContext) -> Self {
        Self {
            url: url.into(),
            error_type,
            context,
            message: None,
            order_no: None,
            item_name: None,
            order_year: None,
            order_page: None,
            order_index: None,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn order_no(mut self, order_no: impl Into<String>) -> Self {
        self.order_no = Some(order_no.into());
        self
    }

    pub fn item_name(mut self, name: impl Into<String>) -> Self {
        self.item_name = Some(name.into());
        self
    }

    /// Listing coordinates of the failure, for later re-location.
    pub fn located(mut self, bucket: Option<TimeFilter>, page: Option<u32>) -> Self {
        self.order_year = bucket;
        self.order_page = page;
        self
    }

    pub fn order_index(mut self, index: u32) -> Self {
        self.order_index = Some(index);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_filter_round_trips_through_key() {
        assert_eq!("2024".parse::<TimeFilter>().unwrap(), TimeFilter::Year(2024));
        assert_eq!("archive".parse::<TimeFilter>().unwrap(), TimeFilter::Archive);
        assert_eq!(TimeFilter::Year(2019).as_key(), "2019");
        assert!("nope".parse::<TimeFilter>().is_err());
    }

    #[test]
    fn item_key_falls_back_to_name() {
        let mut item = Item {
            order_no: "250-1".into(),
            product_id: None,
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            name: "Ebook".into(),
            url: None,
            quantity: 1,
            price: 500,
            category: vec![],
            seller: String::new(),
            condition: String::new(),
            kind: ItemKind::Digital,
            time_filter: None,
            page: None,
        };
        assert_eq!(item.item_key(), "name:Ebook");
        item.product_id = Some("B00X".into());
        assert_eq!(item.item_key(), "B00X");
    }

    #[test]
    fn legacy_gift_card_label_parses() {
        assert_eq!("Gift card".parse::<ItemKind>().unwrap(), ItemKind::GiftCard);
        assert_eq!("".parse::<ItemKind>().unwrap(), ItemKind::Normal);
    }

    #[test]
    fn error_type_labels() {
        for t in [
            ErrorType::Timeout,
            ErrorType::ParseError,
            ErrorType::FetchError,
            ErrorType::NoDetailLink,
            ErrorType::NoUrl,
            ErrorType::PriceError,
            ErrorType::NoOrderNo,
            ErrorType::OrderCountFallback,
        ] {
            assert_eq!(t.as_str().parse::<ErrorType>().unwrap(), t);
        }
    }
}
