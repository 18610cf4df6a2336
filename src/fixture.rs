//! Replay browser backed by a JSON site snapshot.
//!
//! Used by `orderhist crawl` when `[browser] fixture` is configured and by
//! the scenario tests. The snapshot describes the buckets the site
//! offers, every listing page and order, and a handful of failure knobs:
//!
//! ```json
//! {
//!   "years": ["2024", "2023"],
//!   "buckets": {
//!     "2024": {
//!       "count_widget": 2,
//!       "pages": [
//!         { "alert_visits": 1, "cards": [
//!           { "status": "active", "order_no": "503-1", "date": "2024年3月1日" },
//!           { "status": "cancelled", "order_no": "503-2" }
//!         ] }
//!       ]
//!     }
//!   },
//!   "orders": {
//!     "503-1": { "date": "2024年3月1日", "fail_times": 1, "items": [
//!       { "name": "Book", "url": "https://shop.example/dp/B001", "price": "￥1,500" }
//!     ] }
//!   },
//!   "categories": { "https://shop.example/dp/B001": { "path": ["Books"] } }
//! }
//! ```
//!
//! `fail_times` / `alert_visits` counters make the first N attempts fail
//! and later ones succeed, so retry paths can be exercised end to end.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::browser::{Browser, OrderCard, OrderClass, OrderDetail, OrderListing, OrderSummary, RawItem};
use crate::config::CrawlConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::models::{Order, TimeFilter};

const DEFAULT_BASE_URL: &str = "https://shop.example";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteSnapshot {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub most_recent_first: bool,
    pub years: Vec<TimeFilter>,
    #[serde(default)]
    pub buckets: BTreeMap<TimeFilter, BucketSnapshot>,
    #[serde(default)]
    pub orders: HashMap<String, OrderSnapshot>,
    #[serde(default)]
    pub categories: HashMap<String, CategorySnapshot>,
    /// Thumbnail URL to number of failing downloads. Unlisted URLs succeed.
    #[serde(default)]
    pub thumbnail_failures: HashMap<String, u32>,
    #[serde(default)]
    pub login_required: bool,
    #[serde(default)]
    pub login_failures: u32,
    #[serde(default)]
    pub captcha_failures: u32,
    /// Every visit after this many fails with a lost session.
    #[serde(default)]
    pub session_lost_after_visits: Option<u32>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketSnapshot {
    /// Total shown on out-of-range listing pages.
    #[serde(default)]
    pub count_widget: Option<u32>,
    /// Total shown as "N orders" text on page 1.
    #[serde(default)]
    pub count_text: Option<u32>,
    #[serde(default)]
    pub pages: Vec<PageSnapshot>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageSnapshot {
    /// The first N visits of this page show the problem alert.
    #[serde(default)]
    pub alert_visits: u32,
    #[serde(default)]
    pub cards: Vec<CardSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CardSnapshot {
    Active {
        #[serde(default)]
        order_no: Option<String>,
        date: String,
        #[serde(default)]
        detail_url: Option<String>,
    },
    Cancelled {
        #[serde(default)]
        order_no: Option<String>,
    },
    Malformed {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderSnapshot {
    #[serde(default)]
    pub digital: bool,
    pub date: String,
    #[serde(default)]
    pub fail_times: u32,
    #[serde(default)]
    pub items: Vec<ItemSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemSnapshot {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    pub price: String,
    #[serde(default)]
    pub seller: String,
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub gift_card: bool,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategorySnapshot {
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub fail_times: u32,
}

#[derive(Debug, Default)]
struct ReplayState {
    current: Option<String>,
    visited: Vec<String>,
    visit_counts: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
    authenticated: bool,
    login_failures_left: u32,
    captcha_failures_left: u32,
}

pub struct FixtureBrowser {
    site: SiteSnapshot,
    retry_login: u32,
    retry_captcha: u32,
    state: Mutex<ReplayState>,
}

impl FixtureBrowser {
    pub fn new(site: SiteSnapshot, crawl: &CrawlConfig) -> Self {
        let state = ReplayState {
            login_failures_left: site.login_failures,
            captcha_failures_left: site.captcha_failures,
            ..Default::default()
        };
        Self {
            site,
            retry_login: crawl.retry_login,
            retry_captcha: crawl.retry_captcha,
            state: Mutex::new(state),
        }
    }

    pub fn from_json(json: &str, crawl: &CrawlConfig) -> Result<Self> {
        let site: SiteSnapshot = serde_json::from_str(json).context("Invalid site snapshot")?;
        Ok(Self::new(site, crawl))
    }

    pub fn load(path: &Path, crawl: &CrawlConfig) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read site snapshot: {}", path.display()))?;
        Self::from_json(&json, crawl)
    }

    /// Every URL visited in the primary tab, in order.
    pub fn visited(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.visited.clone())
            .unwrap_or_default()
    }

    pub fn visit_count(&self, url: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.visit_counts.get(url).copied())
            .unwrap_or(0)
    }

    fn state(&self) -> CrawlResult<MutexGuard<'_, ReplayState>> {
        self.state
            .lock()
            .map_err(|_| CrawlError::Driver("replay state poisoned".to_string()))
    }

    /// Count an attempt against `key`; true while it should still fail.
    fn attempt_fails(&self, key: &str, fail_times: u32) -> CrawlResult<bool> {
        let mut state = self.state()?;
        let n = state.attempts.entry(key.to_string()).or_insert(0);
        *n += 1;
        Ok(*n <= fail_times)
    }

    fn parse_history_url(&self, url: &str) -> Option<(TimeFilter, u32)> {
        let query = url.strip_prefix(&format!("{}/history?", self.site.base_url))?;
        let mut bucket = None;
        let mut page = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("filter", v)) => bucket = v.parse().ok(),
                Some(("page", v)) => page = v.parse().ok(),
                _ => {}
            }
        }
        Some((bucket?, page?))
    }

    fn current_history_page(&self) -> CrawlResult<(String, TimeFilter, u32)> {
        let url = self
            .state()?
            .current
            .clone()
            .ok_or_else(|| CrawlError::Driver("no page loaded".to_string()))?;
        let (bucket, page) = self
            .parse_history_url(&url)
            .ok_or_else(|| CrawlError::Parse(format!("not a history page: {}", url)))?;
        Ok((url, bucket, page))
    }
}

#[async_trait]
impl Browser for FixtureBrowser {
    fn name(&self) -> &str {
        "fixture"
    }

    fn history_url(&self, bucket: TimeFilter, page: u32) -> String {
        format!("{}/history?filter={}&page={}", self.site.base_url, bucket, page)
    }

    fn order_url(&self, order_no: &str) -> String {
        format!("{}/order-details?orderID={}", self.site.base_url, order_no)
    }

    fn lists_most_recent_first(&self) -> bool {
        self.site.most_recent_first
    }

    async fn visit(&self, url: &str) -> CrawlResult<()> {
        let mut state = self.state()?;
        if let Some(limit) = self.site.session_lost_after_visits {
            if state.visited.len() as u32 >= limit {
                return Err(CrawlError::SessionLost);
            }
        }
        debug!(url, "visit");
        state.current = Some(url.to_string());
        state.visited.push(url.to_string());
        *state.visit_counts.entry(url.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn ensure_authenticated(&self) -> CrawlResult<()> {
        let mut state = self.state()?;
        if state.authenticated || !self.site.login_required {
            state.authenticated = true;
            return Ok(());
        }
        for _ in 0..self.retry_login {
            if state.login_failures_left > 0 {
                state.login_failures_left -= 1;
                continue;
            }
            let mut solved = false;
            for _ in 0..self.retry_captcha {
                if state.captcha_failures_left > 0 {
                    state.captcha_failures_left -= 1;
                    continue;
                }
                solved = true;
                break;
            }
            if !solved {
                return Err(CrawlError::CaptchaExhausted(self.retry_captcha));
            }
            state.authenticated = true;
            return Ok(());
        }
        Err(CrawlError::LoginExhausted(self.retry_login))
    }

    async fn current_url(&self) -> CrawlResult<String> {
        Ok(self.state()?.current.clone().unwrap_or_default())
    }

    async fn enumerate_year_buckets(&self) -> CrawlResult<Vec<TimeFilter>> {
        Ok(self.site.years.clone())
    }

    async fn order_count_text(&self) -> CrawlResult<Option<String>> {
        let (_, bucket, page) = self.current_history_page()?;
        let Some(snapshot) = self.site.buckets.get(&bucket) else {
            return Ok(None);
        };
        if page as usize > snapshot.pages.len() {
            return Ok(snapshot.count_widget.map(|n| format!("{}件", n)));
        }
        if page == 1 {
            return Ok(snapshot.count_text.map(|n| format!("{}件の注文", n)));
        }
        Ok(None)
    }

    async fn enumerate_order_summaries(&self) -> CrawlResult<OrderListing> {
        let (url, bucket, page) = self.current_history_page()?;
        let Some(snapshot) = self
            .site
            .buckets
            .get(&bucket)
            .and_then(|b| b.pages.get(page.saturating_sub(1) as usize))
        else {
            return Ok(OrderListing::default());
        };

        let visits = self.state()?.visit_counts.get(&url).copied().unwrap_or(0);
        let cards = snapshot
            .cards
            .iter()
            .map(|card| match card {
                CardSnapshot::Active {
                    order_no,
                    date,
                    detail_url,
                } => OrderCard::Active(OrderSummary {
                    order_no: order_no.clone(),
                    date_text: date.clone(),
                    detail_url: detail_url.clone(),
                }),
                CardSnapshot::Cancelled { order_no } => OrderCard::Cancelled {
                    order_no: order_no.clone(),
                },
                CardSnapshot::Malformed { reason } => OrderCard::Malformed {
                    reason: reason.clone(),
                },
            })
            .collect();

        Ok(OrderListing {
            cards,
            problem_alert: visits <= snapshot.alert_visits,
        })
    }

    async fn extract_order_detail(&self, order: &Order) -> CrawlResult<OrderDetail> {
        let snapshot = self
            .site
            .orders
            .get(&order.order_no)
            .ok_or_else(|| CrawlError::Parse(format!("order detail {}", order.order_no)))?;
        if self.attempt_fails(&format!("order:{}", order.order_no), snapshot.fail_times)? {
            return Err(CrawlError::Fetch(order.url.clone()));
        }

        let items = snapshot
            .items
            .iter()
            .map(|item| RawItem {
                name: item.name.clone(),
                url: item.url.clone(),
                quantity: item.quantity,
                price_text: item.price.clone(),
                seller: item.seller.clone(),
                condition: item.condition.clone(),
                gift_card: item.gift_card,
                thumbnail_url: item.thumbnail.clone(),
            })
            .collect();

        Ok(OrderDetail {
            class: if snapshot.digital {
                OrderClass::Digital
            } else {
                OrderClass::Standard
            },
            order_no: order.order_no.clone(),
            date_text: snapshot.date.clone(),
            items,
        })
    }

    async fn fetch_category(&self, url: &str) -> CrawlResult<Vec<String>> {
        let Some(snapshot) = self.site.categories.get(url) else {
            return Ok(Vec::new());
        };
        if self.attempt_fails(&format!("category:{}", url), snapshot.fail_times)? {
            return Err(CrawlError::Fetch(url.to_string()));
        }
        Ok(snapshot.path.clone())
    }

    async fn save_thumbnail(&self, url: &str, dest: &Path) -> CrawlResult<()> {
        let fail_times = self.site.thumbnail_failures.get(url).copied().unwrap_or(0);
        if self.attempt_fails(&format!("thumbnail:{}", url), fail_times)? {
            return Err(CrawlError::Fetch(url.to_string()));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CrawlError::Fetch(format!("{}: {}", url, e)))?;
        }
        std::fs::write(dest, url.as_bytes())
            .map_err(|e| CrawlError::Fetch(format!("{}: {}", url, e)))
    }

    async fn capture_diagnostic_snapshot(&self) -> CrawlResult<String> {
        let current = self.state()?.current.clone().unwrap_or_default();
        Ok(format!(
            "<!-- replayed page: {} -->\n<html><body data-url=\"{}\"></body></html>\n",
            current, current
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser(json: &str) -> FixtureBrowser {
        FixtureBrowser::from_json(json, &CrawlConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn alert_clears_after_configured_visits() {
        let b = browser(
            r#"{"years":["2024"],"buckets":{"2024":{"pages":[
                {"alert_visits":1,"cards":[{"status":"cancelled"}]}]}}}"#,
        );
        let url = b.history_url(TimeFilter::Year(2024), 1);
        b.visit(&url).await.unwrap();
        assert!(b.enumerate_order_summaries().await.unwrap().problem_alert);
        b.visit(&url).await.unwrap();
        assert!(!b.enumerate_order_summaries().await.unwrap().problem_alert);
        assert_eq!(b.visit_count(&url), 2);
    }

    #[tokio::test]
    async fn login_budget_exhaustion_is_reported() {
        let b = browser(r#"{"years":[],"login_required":true,"login_failures":5}"#);
        b.visit("https://shop.example/").await.unwrap();
        let err = b.ensure_authenticated().await.unwrap_err();
        assert!(matches!(err, CrawlError::LoginExhausted(2)));
    }

    #[tokio::test]
    async fn captcha_within_budget_succeeds() {
        let b = browser(r#"{"years":[],"login_required":true,"login_failures":1,"captcha_failures":1}"#);
        b.ensure_authenticated().await.unwrap();
    }

    #[tokio::test]
    async fn count_widget_only_on_out_of_range_page() {
        let b = browser(
            r#"{"years":["2023"],"buckets":{"2023":{"count_widget":3,"pages":[{"cards":[]}]}}}"#,
        );
        b.visit(&b.history_url(TimeFilter::Year(2023), 10000)).await.unwrap();
        assert_eq!(b.order_count_text().await.unwrap().as_deref(), Some("3件"));
        b.visit(&b.history_url(TimeFilter::Year(2023), 1)).await.unwrap();
        assert_eq!(b.order_count_text().await.unwrap(), None);
    }

    #[tokio::test]
    async fn session_loss_after_visit_limit() {
        let b = browser(r#"{"years":[],"session_lost_after_visits":1}"#);
        b.visit("https://shop.example/a").await.unwrap();
        assert!(matches!(
            b.visit("https://shop.example/b").await,
            Err(CrawlError::SessionLost)
        ));
    }
}
