//! The browser collaborator seam.
//!
//! The crawl core never touches markup. Everything site-specific (URL
//! shapes, login walls, DOM scraping, secondary-tab fetches) sits behind
//! [`Browser`]. The bundled implementation is
//! [`FixtureBrowser`](crate::fixture::FixtureBrowser), which replays a
//! recorded site snapshot.
//!
//! # Contract
//!
//! - Calls are made strictly one at a time; implementations may keep
//!   "current page" state between [`visit`](Browser::visit) and the
//!   scraping methods.
//! - [`enumerate_order_summaries`](Browser::enumerate_order_summaries)
//!   returns cards in the site's native order. The early-exit heuristic
//!   is only enabled when [`lists_most_recent_first`](Browser::lists_most_recent_first)
//!   guarantees that order is newest first.
//! - [`fetch_category`](Browser::fetch_category) and
//!   [`save_thumbnail`](Browser::save_thumbnail) work in a secondary tab
//!   and must leave the primary page as they found it, on success and on
//!   error alike.

use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::CrawlResult;
use crate::models::{Order, TimeFilter};

/// Cards found on one history listing page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderListing {
    pub cards: Vec<OrderCard>,
    /// The site's generic "a problem occurred" alert is showing.
    pub problem_alert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderCard {
    Active(OrderSummary),
    Cancelled { order_no: Option<String> },
    /// The card could not be read at all.
    Malformed { reason: String },
}

/// The listing-level view of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSummary {
    pub order_no: Option<String>,
    /// Raw date text as shown on the card.
    pub date_text: String,
    /// Explicit link to the order's detail page, when the card has one.
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderClass {
    Standard,
    Digital,
}

/// Everything scraped off an order's detail page.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDetail {
    pub class: OrderClass,
    pub order_no: String,
    pub date_text: String,
    pub items: Vec<RawItem>,
}

/// One item block of an order detail page, before normalization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawItem {
    pub name: String,
    pub url: Option<String>,
    pub quantity: u32,
    pub price_text: String,
    pub seller: String,
    pub condition: String,
    pub gift_card: bool,
    pub thumbnail_url: Option<String>,
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// History listing URL for one page of a bucket (pages start at 1).
    fn history_url(&self, bucket: TimeFilter, page: u32) -> String;

    /// Deterministic detail URL for an order number.
    fn order_url(&self, order_no: &str) -> String;

    /// Whether listing pages are guaranteed to show orders newest first.
    fn lists_most_recent_first(&self) -> bool {
        false
    }

    /// Navigate the primary tab and wait for the page to load.
    async fn visit(&self, url: &str) -> CrawlResult<()>;

    /// Get past any login wall or image challenge on the current page.
    ///
    /// Fails with `LoginExhausted` / `CaptchaExhausted` once the configured
    /// budgets run out.
    async fn ensure_authenticated(&self) -> CrawlResult<()>;

    async fn current_url(&self) -> CrawlResult<String>;

    /// Buckets offered by the site, in its own order.
    async fn enumerate_year_buckets(&self) -> CrawlResult<Vec<TimeFilter>>;

    /// Text of the order-count widget on the current page, if present.
    async fn order_count_text(&self) -> CrawlResult<Option<String>>;

    /// Order cards on the current listing page.
    async fn enumerate_order_summaries(&self) -> CrawlResult<OrderListing>;

    /// Scrape the current page as the detail page of `order`.
    async fn extract_order_detail(&self, order: &Order) -> CrawlResult<OrderDetail>;

    /// Breadcrumb of a product page, outermost first (secondary tab).
    async fn fetch_category(&self, url: &str) -> CrawlResult<Vec<String>>;

    /// Download a thumbnail image to `dest` (secondary tab).
    async fn save_thumbnail(&self, url: &str, dest: &Path) -> CrawlResult<()>;

    /// Dump of the current page state for post-mortem debugging.
    async fn capture_diagnostic_snapshot(&self) -> CrawlResult<String>;
}

/// Visit `url` and clear any authentication wall it lands on.
pub async fn navigate(browser: &dyn Browser, url: &str) -> CrawlResult<()> {
    browser.visit(url).await?;
    browser.ensure_authenticated().await
}

/// Parsed order date of a summary card, if its text is readable.
pub fn summary_date(summary: &OrderSummary) -> Option<NaiveDate> {
    crate::parser::parse_date(&summary.date_text)
}
