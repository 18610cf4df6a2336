//! Crawl orchestrator.
//!
//! [`Crawler`] owns everything a crawl needs (configuration, the record
//! store, progress counters, the shutdown flag and a lazily started
//! browser) and drives the top-level sequence:
//!
//! ```text
//! enumerate buckets ─▶ refresh order counts ─▶ for each bucket:
//!                                                 walk pages (planner)
//!                                                   └─ extract orders
//!                                                 persist after every page
//! ```
//!
//! The page walk lives in [`crate::planner`], order extraction in
//! [`crate::extract`] and the error-ledger repair pass in [`crate::retry`];
//! each adds an `impl Crawler` block.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Local};
use tracing::{info, warn};

use crate::browser::{navigate, Browser};
use crate::config::Config;
use crate::error::{CrawlError, CrawlResult};
use crate::models::{ErrorContext, ErrorType, NewError, TimeFilter};
use crate::parser;
use crate::planner::PAGE_SIZE;
use crate::progress::{Progress, ALL_ORDERS_LABEL};
use crate::shutdown::Shutdown;
use crate::store::Store;

/// Listing page far past the end of any bucket. The site only shows the
/// order-count widget on pages it has no orders for.
const OUT_OF_RANGE_PAGE: u32 = 10_000;

/// Starts a browser session on first use.
pub type BrowserLauncher = Box<dyn Fn() -> Result<Arc<dyn Browser>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Restrict the crawl to one bucket.
    pub target: Option<TimeFilter>,
    /// First page to walk in the target bucket.
    pub start_page: u32,
    /// Treat every cached order, page and year as unseen.
    pub ignore_cache: bool,
    /// Stop after one order of one page of one bucket.
    pub debug: bool,
    pub current_year: i32,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            target: None,
            start_page: 1,
            ignore_cache: false,
            debug: false,
            current_year: Local::now().year(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStatus {
    Completed,
    /// A shutdown was requested; progress so far is persisted.
    Interrupted,
}

pub struct Crawler {
    pub(crate) config: Config,
    pub(crate) store: Store,
    pub(crate) progress: Progress,
    pub(crate) shutdown: Shutdown,
    pub(crate) options: CrawlOptions,
    launcher: Option<BrowserLauncher>,
    browser: Option<Arc<dyn Browser>>,
}

impl Crawler {
    pub fn new(config: Config, store: Store, progress: Progress, shutdown: Shutdown) -> Self {
        Self {
            config,
            store,
            progress,
            shutdown,
            options: CrawlOptions::default(),
            launcher: None,
            browser: None,
        }
    }

    pub fn with_options(mut self, options: CrawlOptions) -> Self {
        self.options = options;
        self
    }

    /// Use an already running browser session.
    pub fn with_browser(mut self, browser: Arc<dyn Browser>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Start a browser only when a command actually needs one.
    pub fn with_launcher(mut self, launcher: BrowserLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub(crate) fn ensure_browser(&mut self) -> Result<()> {
        if self.browser.is_none() {
            let launcher = self
                .launcher
                .as_ref()
                .ok_or_else(|| CrawlError::Driver("no browser configured".to_string()))?;
            let browser = launcher()?;
            info!(browser = browser.name(), "browser session started");
            self.browser = Some(browser);
        }
        Ok(())
    }

    pub(crate) fn browser(&self) -> CrawlResult<&dyn Browser> {
        self.browser
            .as_deref()
            .ok_or_else(|| CrawlError::Driver("no browser session".to_string()))
    }

    pub(crate) fn current_bucket(&self) -> TimeFilter {
        TimeFilter::Year(self.options.current_year)
    }

    pub(crate) fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Politeness pause between network actions.
    pub(crate) async fn pause(&self, millis: u64) {
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    /// Collect purchase history. Returns `Interrupted` (not an error) when
    /// a shutdown was requested mid-crawl.
    pub async fn crawl(&mut self) -> Result<CrawlStatus> {
        self.ensure_browser()?;
        self.progress.set_status("collecting order history", false);

        match self.crawl_all_buckets().await {
            Ok(status) => {
                match status {
                    CrawlStatus::Completed => {
                        self.progress.set_status("order history collected", false)
                    }
                    CrawlStatus::Interrupted => {
                        self.progress.set_status("order history collection interrupted", false)
                    }
                }
                Ok(status)
            }
            Err(err) => {
                if !self.is_shutdown_requested() {
                    self.dump_diagnostics().await;
                }
                self.progress.set_status(err.to_string(), true);
                Err(err.into())
            }
        }
    }

    async fn crawl_all_buckets(&self) -> CrawlResult<CrawlStatus> {
        let current = self.current_bucket();
        let last_modified_year = self.store.get_last_modified().await?.year();

        let buckets = match self.load_year_buckets(current).await {
            Ok(buckets) => {
                self.store.set_year_list(&buckets).await?;
                buckets
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                let cached = self.store.get_year_list().await?;
                if cached.is_empty() {
                    return Err(e);
                }
                warn!(error = %e, "could not read year buckets, using the cached list");
                cached
            }
        };
        info!(count = buckets.len(), "year buckets found");

        for bucket in &buckets {
            if self.is_live(*bucket, last_modified_year) {
                self.store.clear_page_status(*bucket).await?;
            }
        }

        self.refresh_order_counts(&buckets, last_modified_year).await?;
        if self.is_shutdown_requested() {
            return Ok(CrawlStatus::Interrupted);
        }

        let total = match self.options.target {
            Some(target) if buckets.contains(&target) => {
                self.store.get_year_order_count(target).await? as u64
            }
            Some(target) => {
                warn!(bucket = %target, "requested bucket does not exist in the order history");
                return Ok(CrawlStatus::Completed);
            }
            None => self.store.get_total_order_count().await?.max(0) as u64,
        };
        self.progress.create(ALL_ORDERS_LABEL, total);

        for (index, bucket) in buckets.iter().copied().enumerate() {
            if self.is_shutdown_requested() {
                return Ok(CrawlStatus::Interrupted);
            }
            if let Some(target) = self.options.target {
                if bucket != target {
                    continue;
                }
            }

            let needs_walk = self.is_live(bucket, last_modified_year)
                || self.options.ignore_cache
                || !self.store.is_year_checked(bucket).await?;

            if needs_walk {
                let start_page = if self.options.target == Some(bucket) {
                    self.options.start_page.max(1)
                } else {
                    1
                };
                info!(bucket = %bucket, position = index + 1, of = buckets.len(), "walking bucket");
                match self.crawl_bucket(bucket, start_page).await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(bucket = %bucket, error = %e, "bucket walk failed");
                        self.record_bucket_failure(bucket, &e).await?;
                    }
                }
                if self.is_shutdown_requested() {
                    return Ok(CrawlStatus::Interrupted);
                }
                if self.options.debug {
                    break;
                }
            } else {
                info!(bucket = %bucket, position = index + 1, of = buckets.len(), "bucket already checked");
                let count = self.store.get_year_order_count(bucket).await?;
                self.progress.advance(ALL_ORDERS_LABEL, count as u64);
            }
        }

        Ok(CrawlStatus::Completed)
    }

    /// Buckets that can still receive orders, plus anything explicitly asked for.
    fn is_live(&self, bucket: TimeFilter, last_modified_year: i32) -> bool {
        match bucket {
            TimeFilter::Archive => true,
            TimeFilter::Year(year) => {
                year == self.options.current_year
                    || year == last_modified_year
                    || self.options.target == Some(bucket)
            }
        }
    }

    async fn refresh_order_counts(
        &self,
        buckets: &[TimeFilter],
        last_modified_year: i32,
    ) -> CrawlResult<()> {
        let label = "order counts";
        self.progress.create(label, buckets.len() as u64);

        let mut total: u64 = 0;
        for bucket in buckets.iter().copied() {
            if self.is_shutdown_requested() {
                break;
            }
            let cached = self.store.get_year_status(bucket).await?;
            let stale = match bucket {
                TimeFilter::Archive => true,
                TimeFilter::Year(year) => year >= last_modified_year,
            };

            let count = match cached {
                Some(status) if !stale && !self.options.ignore_cache => {
                    info!(bucket = %bucket, count = status.order_count, "order count (cached)");
                    status.order_count
                }
                cached => match self.determine_order_count(bucket).await {
                    Ok(fresh) => self.record_order_count(bucket, fresh).await?,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(bucket = %bucket, error = %e, "failed to count orders");
                        self.record_bucket_failure(bucket, &e).await?;
                        cached.map(|s| s.order_count).unwrap_or(0)
                    }
                },
            };
            total += count as u64;
            self.progress.advance(label, 1);
        }
        self.progress.remove(label);
        info!(total, "known orders");
        self.store.touch_last_modified().await?;
        Ok(())
    }

    async fn load_year_buckets(&self, current: TimeFilter) -> CrawlResult<Vec<TimeFilter>> {
        let browser = self.browser()?;
        navigate(browser, &browser.history_url(current, 1)).await?;
        browser.enumerate_year_buckets().await
    }

    /// Persist a freshly read order count. A lower reading than the cached
    /// one is ignored. Returns the count kept.
    pub(crate) async fn record_order_count(&self, bucket: TimeFilter, fresh: u32) -> CrawlResult<u32> {
        let count = self.store.raise_year_order_count(bucket, fresh).await?;
        if count > fresh {
            warn!(bucket = %bucket, fresh, kept = count, "order count went down, keeping the larger value");
        } else {
            info!(bucket = %bucket, count, "order count");
        }
        Ok(count)
    }

    /// Ledger row for a bucket that could not be counted or walked. The
    /// retry pass re-walks the whole bucket.
    pub(crate) async fn record_bucket_failure(&self, bucket: TimeFilter, error: &CrawlError) -> CrawlResult<()> {
        let url = self.browser()?.history_url(bucket, 1);
        self.store
            .record_or_update_error(
                &NewError::new(&url, error.error_type(), ErrorContext::Year)
                    .message(error.to_string())
                    .located(Some(bucket), None),
            )
            .await?;
        Ok(())
    }

    /// Expected number of orders in `bucket`.
    ///
    /// Reads the count widget on an out-of-range page, then the count text
    /// on page 1, and as a last resort counts cards page by page. The last
    /// case is recorded as `order_count_fallback` so the bucket can be
    /// re-walked later.
    pub(crate) async fn determine_order_count(&self, bucket: TimeFilter) -> CrawlResult<u32> {
        let browser = self.browser()?;
        self.progress
            .set_status(format!("counting orders in {}", bucket), false);

        navigate(browser, &browser.history_url(bucket, OUT_OF_RANGE_PAGE)).await?;
        if let Some(count) = browser
            .order_count_text()
            .await?
            .as_deref()
            .and_then(parser::parse_order_count)
        {
            return Ok(count);
        }

        self.pause(self.config.crawl.page_delay_ms).await;

        let first_page = browser.history_url(bucket, 1);
        navigate(browser, &first_page).await?;
        if let Some(count) = browser
            .order_count_text()
            .await?
            .as_deref()
            .and_then(parser::parse_order_count)
        {
            return Ok(count);
        }

        let listing = browser.enumerate_order_summaries().await?;
        if listing.cards.is_empty() {
            warn!(bucket = %bucket, "could not determine order count");
            return Ok(0);
        }

        let mut count = listing.cards.len() as u32;
        if count == PAGE_SIZE {
            let mut page = 2;
            loop {
                if self.is_shutdown_requested() {
                    break;
                }
                navigate(browser, &browser.history_url(bucket, page)).await?;
                let on_page = browser.enumerate_order_summaries().await?.cards.len() as u32;
                count += on_page;
                if on_page < PAGE_SIZE {
                    break;
                }
                page += 1;
            }
        }

        warn!(bucket = %bucket, count, "order count widget missing, counted order cards instead");
        self.store
            .record_or_update_error(
                &NewError::new(&first_page, ErrorType::OrderCountFallback, ErrorContext::Year)
                    .message(format!("order count widget missing; counted {} cards", count))
                    .located(Some(bucket), None),
            )
            .await?;
        Ok(count)
    }

    /// Best-effort page dump into the debug directory. Never fails.
    pub(crate) async fn dump_diagnostics(&self) {
        let Some(browser) = self.browser.as_deref() else {
            return;
        };
        let snapshot = match browser.capture_diagnostic_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to capture diagnostic snapshot");
                return;
            }
        };
        let url = browser.current_url().await.unwrap_or_default();
        let dir = &self.config.data.debug_dir;
        let path = dir.join(format!("{}.html", uuid::Uuid::new_v4()));
        let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, snapshot));
        match written {
            Ok(()) => warn!(path = %path.display(), %url, "diagnostic snapshot written"),
            Err(e) => warn!(error = %e, "failed to write diagnostic snapshot"),
        }
    }
}
