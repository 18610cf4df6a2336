//! Pagination planner: walks one bucket's listing pages.
//!
//! Page state machine for a single page:
//!
//! ```text
//! checked? ──yes──▶ skip_page (advance progress, no visit)
//!    │no
//!    ▼
//! visit ─▶ load failed (non-fatal) ─▶ record it, skipped
//!    │
//!    ├──▶ no cards but orders expected ─▶ record parse_error, skipped
//!    │
//!    ├──▶ problem alert ─▶ retry same page (bounded) ─▶ exhausted: skipped
//!    ▼
//! per card: cancelled / missing number / unreadable / queue order
//!    ▼
//! per order: cached? hit++ (early exit at threshold) : extract, hits = 0
//! ```
//!
//! A page is marked checked only when it produced no skip. A bucket is
//! marked checked only when no page in the pass was skipped.

use tracing::{debug, info, warn};

use crate::browser::{navigate, summary_date, OrderCard, OrderListing};
use crate::crawler::Crawler;
use crate::error::CrawlResult;
use crate::models::{ErrorContext, ErrorType, NewError, Order, TimeFilter};
use crate::progress::bucket_label;

/// Orders per listing page (a site constant).
pub const PAGE_SIZE: u32 = 10;

/// Consecutive already-collected orders after which a live bucket's walk
/// stops early.
pub const CONSECUTIVE_CACHE_HITS_THRESHOLD: u32 = 5;

pub fn total_pages(order_count: u32) -> u32 {
    order_count.div_ceil(PAGE_SIZE)
}

/// Result of walking one listing page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    pub is_skipped: bool,
    pub is_last: bool,
    /// Cards found on the page. Non-zero means the page itself loaded.
    pub order_card_count: u32,
    pub consecutive_cache_hits: u32,
}

/// Result of walking a whole bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketOutcome {
    pub is_skipped: bool,
    pub marked_checked: bool,
}

impl Crawler {
    /// Walk `bucket` from `start_page` until its last page, persisting
    /// after every page.
    pub async fn crawl_bucket(&self, bucket: TimeFilter, start_page: u32) -> CrawlResult<BucketOutcome> {
        let browser = self.browser()?;
        let order_count = self.store.get_year_order_count(bucket).await?;
        self.progress.create(&bucket_label(bucket), order_count as u64);

        let was_checked =
            !self.options.ignore_cache && self.store.is_year_checked(bucket).await?;
        let can_early_exit = self.can_early_exit(bucket, was_checked).await?;
        // A debug walk never sets the flag again, so it leaves it alone.
        if was_checked && !self.options.debug {
            self.store.set_year_status(bucket, None, Some(false)).await?;
        }
        debug!(bucket = %bucket, was_checked, can_early_exit, "bucket walk starting");

        let mut page = start_page.max(1);
        let mut is_skipped = false;
        let mut hits = 0;
        loop {
            let is_last = if self.options.ignore_cache
                || !self.store.is_page_checked(bucket, page).await?
            {
                let outcome = self.fetch_page(bucket, page, can_early_exit, hits).await?;
                if !outcome.is_skipped {
                    self.store.set_page_checked(bucket, page, true).await?;
                    self.store
                        .mark_errors_resolved_by_url(&browser.history_url(bucket, page), &ErrorContext::Order)
                        .await?;
                }
                is_skipped |= outcome.is_skipped;
                hits = outcome.consecutive_cache_hits;
                self.pause(self.config.crawl.page_delay_ms).await;
                outcome.is_last
            } else {
                hits = 0;
                self.skip_page(bucket, page).await?
            };

            self.store.touch_last_modified().await?;

            if self.is_shutdown_requested() || is_last || self.options.debug {
                break;
            }
            page += 1;
        }

        let marked_checked = !is_skipped
            && !self.is_shutdown_requested()
            && !self.options.debug
            && self.mark_checked_if_complete(bucket).await?;

        Ok(BucketOutcome {
            is_skipped,
            marked_checked,
        })
    }

    /// Set the bucket's checked flag when every page is checked and the
    /// ledger holds nothing unresolved for it.
    pub(crate) async fn mark_checked_if_complete(&self, bucket: TimeFilter) -> CrawlResult<bool> {
        let order_count = self.store.get_year_order_count(bucket).await?;
        let all_pages = self
            .store
            .all_pages_checked(bucket, total_pages(order_count))
            .await?;
        let unresolved = self.store.get_unresolved_error_count_by_year(bucket).await?;
        if !all_pages || unresolved > 0 {
            debug!(bucket = %bucket, all_pages, unresolved, "bucket not complete");
            return Ok(false);
        }
        self.store.set_year_status(bucket, None, Some(true)).await?;
        info!(bucket = %bucket, "bucket fully collected");
        Ok(true)
    }

    /// Early exit needs a bucket that is the current year, was fully
    /// collected before, already has items and has nothing outstanding,
    /// and a site that lists orders newest first.
    async fn can_early_exit(&self, bucket: TimeFilter, was_checked: bool) -> CrawlResult<bool> {
        if bucket != self.current_bucket() || !was_checked {
            return Ok(false);
        }
        if !self.browser()?.lists_most_recent_first() {
            return Ok(false);
        }
        Ok(self.store.get_item_count_by_filter(bucket).await? > 0
            && self.store.get_unresolved_error_count_by_year(bucket).await? == 0)
    }

    /// Account for an already checked page without visiting it. Returns
    /// whether this was the last page.
    ///
    /// The "last" test is an approximation: a final page that is exactly
    /// full is not recognised, so the walk goes on to an empty page.
    pub async fn skip_page(&self, bucket: TimeFilter, page: u32) -> CrawlResult<bool> {
        let order_count = self.store.get_year_order_count(bucket).await? as u64;
        let seen = self.progress.count(&bucket_label(bucket));
        let increment = order_count.saturating_sub(seen).min(PAGE_SIZE as u64);
        info!(bucket = %bucket, page, "page already checked, skipping");
        self.progress.advance_orders(bucket, increment);
        Ok(increment != PAGE_SIZE as u64)
    }

    /// Visit one listing page and collect every new order on it.
    pub async fn fetch_page(
        &self,
        bucket: TimeFilter,
        page: u32,
        can_early_exit: bool,
        consecutive_cache_hits: u32,
    ) -> CrawlResult<PageOutcome> {
        let browser = self.browser()?;
        let order_count = self.store.get_year_order_count(bucket).await?;
        let total = total_pages(order_count);
        let url = browser.history_url(bucket, page);
        self.progress
            .set_status(format!("reading {} page {}/{}", bucket, page, total), false);

        let mut retries = 0;
        let listing = loop {
            info!(bucket = %bucket, page, total, "reading listing page");
            let listing = match self.load_listing(&url).await {
                Ok(listing) => listing,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let expected = self.expected_on_page(bucket, order_count);
                    warn!(bucket = %bucket, page, error = %e, "failed to load listing page");
                    self.store
                        .record_or_update_error(
                            &NewError::new(&url, e.error_type(), ErrorContext::Order)
                                .message(e.to_string())
                                .located(Some(bucket), Some(page)),
                        )
                        .await?;
                    self.progress.advance_orders(bucket, expected);
                    return Ok(PageOutcome {
                        is_skipped: true,
                        is_last: page >= total,
                        order_card_count: 0,
                        consecutive_cache_hits: 0,
                    });
                }
            };

            if listing.cards.is_empty() {
                let expected = self.expected_on_page(bucket, order_count);
                if expected > 0 {
                    warn!(bucket = %bucket, page, expected, "no order cards on page");
                    self.store
                        .record_or_update_error(
                            &NewError::new(&url, ErrorType::ParseError, ErrorContext::Order)
                                .message(format!("no order cards found ({} expected)", expected))
                                .located(Some(bucket), Some(page)),
                        )
                        .await?;
                    self.progress.advance_orders(bucket, expected);
                    return Ok(PageOutcome {
                        is_skipped: true,
                        is_last: page >= total,
                        order_card_count: 0,
                        consecutive_cache_hits: 0,
                    });
                }
            }

            if listing.problem_alert {
                if retries < self.config.crawl.retry_fetch {
                    retries += 1;
                    warn!(bucket = %bucket, page, retries, "site reported a problem, reloading page");
                    self.pause(self.config.crawl.retry_delay_ms).await;
                    continue;
                }
                let skipped = listing.cards.len() as u32;
                warn!(bucket = %bucket, page, skipped, "problem persisted, skipping page");
                self.progress.advance_orders(bucket, skipped as u64);
                return Ok(PageOutcome {
                    is_skipped: true,
                    is_last: page >= total,
                    order_card_count: skipped,
                    consecutive_cache_hits: 0,
                });
            }

            break listing;
        };

        let order_card_count = listing.cards.len() as u32;
        let mut is_skipped = false;
        let mut orders = Vec::with_capacity(listing.cards.len());

        for (index, card) in listing.cards.into_iter().enumerate() {
            let failure = match card {
                OrderCard::Cancelled { order_no } => {
                    info!(order_no = order_no.as_deref().unwrap_or("?"), "skipping cancelled order");
                    None
                }
                OrderCard::Malformed { reason } => Some((ErrorType::ParseError, reason)),
                OrderCard::Active(summary) => match (&summary.order_no, summary_date(&summary)) {
                    (None, _) => Some((ErrorType::NoOrderNo, "order number missing".to_string())),
                    (Some(_), None) => Some((
                        ErrorType::ParseError,
                        format!("unreadable order date '{}'", summary.date_text),
                    )),
                    (Some(order_no), Some(date)) => {
                        let detail_url = summary
                            .detail_url
                            .clone()
                            .unwrap_or_else(|| browser.order_url(order_no));
                        orders.push(Order {
                            date,
                            order_no: order_no.clone(),
                            url: detail_url,
                            time_filter: Some(bucket),
                            page: Some(page),
                        });
                        continue;
                    }
                },
            };

            if let Some((error_type, message)) = failure {
                warn!(bucket = %bucket, page, index, %message, "order card unreadable");
                self.store
                    .record_or_update_error(
                        &NewError::new(&url, error_type, ErrorContext::Order)
                            .message(format!("card {}: {}", index + 1, message))
                            .located(Some(bucket), Some(page))
                            .order_index(index as u32),
                    )
                    .await?;
                is_skipped = true;
            }
            self.progress.advance_orders(bucket, 1);
        }

        self.pause(self.config.crawl.order_delay_ms).await;

        let mut hits = consecutive_cache_hits;
        for (position, order) in orders.iter().enumerate() {
            let cached =
                !self.options.ignore_cache && self.store.exists_order(&order.order_no).await?;

            if cached {
                hits += 1;
                info!(order_no = %order.order_no, date = %order.date, "order already collected");
                if can_early_exit && hits >= CONSECUTIVE_CACHE_HITS_THRESHOLD {
                    let remaining = orders.len() - position;
                    info!(bucket = %bucket, hits, "caught up with collected orders, ending bucket walk");
                    self.progress.advance_orders(bucket, remaining as u64);
                    for rest in (page + 1)..=total {
                        self.store.set_page_checked(bucket, rest, true).await?;
                    }
                    return Ok(PageOutcome {
                        is_skipped,
                        is_last: true,
                        order_card_count,
                        consecutive_cache_hits: hits,
                    });
                }
            } else {
                match self.fetch_order(order).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(order_no = %order.order_no, "order yielded no items");
                        self.record_order_failure(order, ErrorType::ParseError, "no items found")
                            .await?;
                        is_skipped = true;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(order_no = %order.order_no, error = %e, "failed to collect order");
                        self.record_order_failure(order, e.error_type(), &e.to_string())
                            .await?;
                        is_skipped = true;
                    }
                }
                hits = 0;
            }

            self.progress.advance_orders(bucket, 1);

            if self.options.debug {
                return Ok(PageOutcome {
                    is_skipped,
                    is_last: true,
                    order_card_count,
                    consecutive_cache_hits: hits,
                });
            }

            if self.is_shutdown_requested() {
                info!("shutdown requested, leaving page early");
                self.store.touch_last_modified().await?;
                return Ok(PageOutcome {
                    is_skipped: true,
                    is_last: true,
                    order_card_count,
                    consecutive_cache_hits: hits,
                });
            }
        }

        Ok(PageOutcome {
            is_skipped,
            is_last: page >= total,
            order_card_count,
            consecutive_cache_hits: hits,
        })
    }

    async fn load_listing(&self, url: &str) -> CrawlResult<OrderListing> {
        let browser = self.browser()?;
        navigate(browser, url).await?;
        browser.enumerate_order_summaries().await
    }

    /// Orders still unaccounted for in `bucket`, capped at one page.
    fn expected_on_page(&self, bucket: TimeFilter, order_count: u32) -> u64 {
        (order_count as u64)
            .saturating_sub(self.progress.count(&bucket_label(bucket)))
            .min(PAGE_SIZE as u64)
    }

    async fn record_order_failure(
        &self,
        order: &Order,
        error_type: ErrorType,
        message: &str,
    ) -> CrawlResult<()> {
        self.store
            .record_or_update_error(
                &NewError::new(&order.url, error_type, ErrorContext::Order)
                    .message(message)
                    .order_no(&order.order_no)
                    .located(order.time_filter, order.page),
            )
            .await?;
        Ok(())
    }
}
