//! Error-ledger repair pass.
//!
//! Re-processes unresolved ledger rows without re-walking pages that
//! already succeeded. Sub-passes run in a fixed order: years (count
//! fallbacks), orders, categories, thumbnails. Each returns a
//! [`PassTally`] of successes and failures.
//!
//! Non-fatal failures leave the row unresolved with its `retry_count`
//! bumped. Fatal failures abort the pass.

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{info, warn};

use crate::browser::{navigate, summary_date, OrderCard};
use crate::crawler::Crawler;
use crate::error::{CrawlError, CrawlResult};
use crate::models::{ErrorContext, ErrorLog, ErrorType, Order, TimeFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassTally {
    pub succeeded: u32,
    pub failed: u32,
}

impl PassTally {
    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub years: PassTally,
    pub orders: PassTally,
    pub categories: PassTally,
    pub thumbnails: PassTally,
}

impl RetrySummary {
    pub fn succeeded(&self) -> u32 {
        self.years.succeeded + self.orders.succeeded + self.categories.succeeded + self.thumbnails.succeeded
    }

    pub fn failed(&self) -> u32 {
        self.years.failed + self.orders.failed + self.categories.failed + self.thumbnails.failed
    }
}

impl Crawler {
    /// Retry every unresolved ledger row.
    pub async fn retry_failed(&mut self) -> Result<RetrySummary> {
        self.ensure_browser()?;
        self.progress.set_status("retrying recorded failures", false);

        match self.run_retry_passes().await {
            Ok(summary) => {
                info!(
                    succeeded = summary.succeeded(),
                    failed = summary.failed(),
                    "retry pass finished"
                );
                for (pass, tally) in [
                    ("years", summary.years),
                    ("orders", summary.orders),
                    ("categories", summary.categories),
                    ("thumbnails", summary.thumbnails),
                ] {
                    info!(pass, succeeded = tally.succeeded, failed = tally.failed, "retry tally");
                }
                if self.is_shutdown_requested() {
                    self.progress.set_status("retry pass interrupted", false);
                } else {
                    self.progress.set_status("retry pass finished", false);
                }
                Ok(summary)
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

    async fn run_retry_passes(&self) -> CrawlResult<RetrySummary> {
        Ok(RetrySummary {
            years: self.retry_failed_years().await?,
            orders: self.retry_failed_orders().await?,
            categories: self.retry_failed_categories().await?,
            thumbnails: self.retry_failed_thumbnails().await?,
        })
    }

    async fn retry_failed_years(&self) -> CrawlResult<PassTally> {
        let failed = self.store.get_failed_years().await?;
        let buckets: BTreeSet<TimeFilter> = failed.iter().filter_map(|e| e.order_year).collect();
        let mut tally = PassTally::default();
        if buckets.is_empty() {
            info!("no years to re-walk");
            return Ok(tally);
        }

        let label = "retry years";
        self.progress.create(label, buckets.len() as u64);
        for bucket in buckets {
            if self.is_shutdown_requested() {
                break;
            }
            info!(bucket = %bucket, "re-walking year");
            let ok = match self.retry_year(bucket).await {
                Ok(()) => true,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "year re-walk failed");
                    false
                }
            };
            for error in failed.iter().filter(|e| e.order_year == Some(bucket)) {
                self.settle(error, ok).await?;
            }
            if ok {
                self.mark_checked_if_complete(bucket).await?;
            }
            tally.record(ok);
            self.progress.advance(label, 1);
            self.pause(self.config.crawl.retry_pass_delay_ms).await;
        }
        self.progress.remove(label);
        Ok(tally)
    }

    /// Forget the bucket's cached state, recount it and walk it again.
    async fn retry_year(&self, bucket: TimeFilter) -> CrawlResult<()> {
        self.store.reset_year_status(bucket).await?;
        let fresh = self.determine_order_count(bucket).await?;
        self.record_order_count(bucket, fresh).await?;
        self.crawl_bucket(bucket, 1).await?;
        Ok(())
    }

    async fn retry_failed_orders(&self) -> CrawlResult<PassTally> {
        let failed = self.store.get_failed_orders().await?;
        let mut tally = PassTally::default();
        if failed.is_empty() {
            info!("no orders to retry");
            return Ok(tally);
        }

        let label = "retry orders";
        self.progress.create(label, failed.len() as u64);
        for error in &failed {
            if self.is_shutdown_requested() {
                break;
            }
            // An earlier row for the same order may already have fixed this one.
            if self.is_resolved(error.id).await? {
                tally.record(true);
                self.progress.advance(label, 1);
                continue;
            }
            self.progress
                .set_status(format!("retrying order {}", display_name(error)), false);
            let ok = self.retry_order_entry(error).await?;
            self.settle(error, ok).await?;
            tally.record(ok);
            self.progress.advance(label, 1);
            self.pause(self.config.crawl.retry_pass_delay_ms).await;
        }
        self.progress.remove(label);
        Ok(tally)
    }

    async fn retry_order_entry(&self, error: &ErrorLog) -> CrawlResult<bool> {
        match self.retry_single_order(error).await {
            Ok(ok) => {
                if !ok {
                    warn!(error_id = error.id, order = %display_name(error), "order still unavailable");
                }
                Ok(ok)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error_id = error.id, order = %display_name(error), error = %e, "order retry failed");
                Ok(false)
            }
        }
    }

    /// Pick a repair strategy for one order-level row.
    ///
    /// * neither order number nor card index: re-walk the whole page;
    /// * past year, or no order number: find the card on its listing page;
    /// * order number known: open the constructed detail URL.
    pub async fn retry_single_order(&self, error: &ErrorLog) -> CrawlResult<bool> {
        let current = self.current_bucket();
        match (error.order_year, error.order_page) {
            (Some(bucket), Some(page)) if error.order_no.is_none() && error.order_index.is_none() => {
                info!(bucket = %bucket, page, "re-walking listing page");
                let outcome = self.fetch_page(bucket, page, false, 0).await?;
                if outcome.order_card_count > 0 && !outcome.is_skipped {
                    self.store.set_page_checked(bucket, page, true).await?;
                }
                Ok(outcome.order_card_count > 0)
            }
            (Some(bucket), Some(page)) if bucket != current || error.order_no.is_none() => {
                info!(bucket = %bucket, page, order = %display_name(error), "locating order on its listing page");
                self.retry_order_from_listing(bucket, page, error).await
            }
            _ => match &error.order_no {
                Some(order_no) => {
                    let browser = self.browser()?;
                    info!(order_no = %order_no, "opening order detail directly");
                    let order = Order {
                        date: chrono::Local::now().date_naive(),
                        order_no: order_no.clone(),
                        url: browser.order_url(order_no),
                        time_filter: error.order_year,
                        page: error.order_page,
                    };
                    self.fetch_order(&order).await
                }
                None => Ok(false),
            },
        }
    }

    async fn retry_order_from_listing(
        &self,
        bucket: TimeFilter,
        page: u32,
        error: &ErrorLog,
    ) -> CrawlResult<bool> {
        let browser = self.browser()?;
        navigate(browser, &browser.history_url(bucket, page)).await?;
        let listing = browser.enumerate_order_summaries().await?;

        let card = match (&error.order_no, error.order_index) {
            (None, Some(index)) => listing.cards.into_iter().nth(index as usize),
            (Some(order_no), _) => listing.cards.into_iter().find(|card| match card {
                OrderCard::Active(summary) => summary.order_no.as_deref() == Some(order_no),
                OrderCard::Cancelled { order_no: no } => no.as_deref() == Some(order_no),
                OrderCard::Malformed { .. } => false,
            }),
            (None, None) => None,
        };

        let summary = match card {
            None => {
                warn!(bucket = %bucket, page, order = %display_name(error), "order not found on listing page");
                return Ok(false);
            }
            Some(OrderCard::Cancelled { .. }) => {
                info!(bucket = %bucket, page, "order was cancelled, nothing to collect");
                return Ok(true);
            }
            Some(OrderCard::Malformed { reason }) => {
                warn!(bucket = %bucket, page, %reason, "order card still unreadable");
                return Ok(false);
            }
            Some(OrderCard::Active(summary)) => summary,
        };

        let Some(order_no) = summary.order_no.clone() else {
            warn!(bucket = %bucket, page, "order number still missing");
            return Ok(false);
        };
        let date = summary_date(&summary)
            .ok_or_else(|| CrawlError::Parse(format!("unreadable order date '{}'", summary.date_text)))?;
        let url = match summary.detail_url.clone() {
            Some(url) => url,
            None => {
                info!(order_no = %order_no, "no detail link, using constructed URL");
                browser.order_url(&order_no)
            }
        };
        let order = Order {
            date,
            order_no,
            url,
            time_filter: Some(bucket),
            page: Some(page),
        };
        self.fetch_order(&order).await
    }

    async fn retry_failed_categories(&self) -> CrawlResult<PassTally> {
        let failed = self.store.get_failed_category_items().await?;
        let mut tally = PassTally::default();
        if failed.is_empty() {
            info!("no categories to retry");
            return Ok(tally);
        }

        let label = "retry categories";
        self.progress.create(label, failed.len() as u64);
        for entry in &failed {
            if self.is_shutdown_requested() {
                break;
            }
            let name = entry.item_name.as_deref().unwrap_or("unknown item");
            self.progress
                .set_status(format!("retrying category of {}", name), false);
            let ok = self.retry_category(&entry.url).await?;
            if ok {
                self.store.mark_error_resolved(entry.error_id).await?;
                info!(error_id = entry.error_id, name, "category recovered");
            } else {
                self.store.increment_retry_count(entry.error_id).await?;
            }
            tally.record(ok);
            self.progress.advance(label, 1);
            self.pause(self.config.crawl.retry_pass_delay_ms).await;
        }
        self.progress.remove(label);
        Ok(tally)
    }

    /// Fetch the breadcrumb again and back-fill every item with this URL.
    /// An empty breadcrumb counts as a failure.
    async fn retry_category(&self, url: &str) -> CrawlResult<bool> {
        match self.fetch_category_with_retry(url).await {
            Ok(path) if !path.is_empty() => {
                let updated = self.store.update_item_category(url, &path).await?;
                info!(url, updated, "category back-filled");
                Ok(true)
            }
            Ok(_) => {
                warn!(url, "category still empty");
                Ok(false)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(url, error = %e, "category retry failed");
                Ok(false)
            }
        }
    }

    async fn retry_failed_thumbnails(&self) -> CrawlResult<PassTally> {
        let failed = self.store.get_failed_thumbnail_items().await?;
        let mut tally = PassTally::default();
        if failed.is_empty() {
            info!("no thumbnails to retry");
            return Ok(tally);
        }

        let label = "retry thumbnails";
        self.progress.create(label, failed.len() as u64);
        for entry in &failed {
            if self.is_shutdown_requested() {
                break;
            }
            let name = entry.item_name.as_deref().unwrap_or("unknown item");
            let ok = match &entry.product_id {
                Some(product_id) => {
                    self.progress
                        .set_status(format!("retrying thumbnail of {}", name), false);
                    self.retry_thumbnail(&entry.url, product_id).await?
                }
                None => {
                    warn!(error_id = entry.error_id, name, "no product id for thumbnail, skipping");
                    false
                }
            };
            if ok {
                self.store.mark_error_resolved(entry.error_id).await?;
                info!(error_id = entry.error_id, name, "thumbnail recovered");
            } else {
                self.store.increment_retry_count(entry.error_id).await?;
            }
            tally.record(ok);
            self.progress.advance(label, 1);
            self.pause(self.config.crawl.retry_pass_delay_ms).await;
        }
        self.progress.remove(label);
        Ok(tally)
    }

    async fn retry_thumbnail(&self, url: &str, product_id: &str) -> CrawlResult<bool> {
        let Some(path) = self.config.thumbnail_path(Some(product_id)) else {
            return Ok(false);
        };
        match self.save_thumbnail_with_retry(url, &path).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(url, error = %e, "thumbnail retry failed");
                Ok(false)
            }
        }
    }

    /// Retry one ledger row. Unknown ids report `false`; rows that are
    /// already resolved report `true` without starting a browser.
    pub async fn retry_error_by_id(&mut self, id: i64) -> Result<bool> {
        let Some(error) = self.store.get_error_by_id(id).await? else {
            warn!(error_id = id, "no such error");
            self.progress.set_status(format!("error {} not found", id), true);
            return Ok(false);
        };
        if error.resolved {
            info!(error_id = id, "error already resolved");
            self.progress
                .set_status(format!("error {} already resolved", id), false);
            return Ok(true);
        }

        self.ensure_browser()?;
        self.progress
            .set_status(format!("retrying {}", display_name(&error)), false);

        match self.retry_entry(&error).await {
            Ok(ok) => {
                self.settle(&error, ok).await?;
                if ok {
                    info!(error_id = id, "retry succeeded");
                    self.progress
                        .set_status(format!("retried {}", display_name(&error)), false);
                } else {
                    warn!(error_id = id, "retry failed");
                    self.progress
                        .set_status(format!("retry of {} failed", display_name(&error)), true);
                }
                Ok(ok)
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

    async fn retry_entry(&self, error: &ErrorLog) -> CrawlResult<bool> {
        match (&error.context, error.error_type, error.order_year) {
            (ErrorContext::Order, _, _) => self.retry_order_entry(error).await,
            (ErrorContext::Category, _, _) => self.retry_category(&error.url).await,
            (ErrorContext::Thumbnail, _, _) => {
                match self.store.get_thumbnail_product_id_by_error_id(error.id).await? {
                    Some(product_id) => self.retry_thumbnail(&error.url, &product_id).await,
                    None => {
                        warn!(error_id = error.id, "no product id for thumbnail");
                        Ok(false)
                    }
                }
            }
            (ErrorContext::Year, _, Some(bucket))
            | (_, ErrorType::OrderCountFallback, Some(bucket)) => match self.retry_year(bucket).await {
                Ok(()) => {
                    self.store.mark_error_resolved(error.id).await?;
                    self.mark_checked_if_complete(bucket).await?;
                    Ok(true)
                }
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "year re-walk failed");
                    Ok(false)
                }
            },
            _ => {
                warn!(error_id = error.id, context = %error.context, "no retry strategy for this error");
                Ok(false)
            }
        }
    }

    /// Resolve a row after a successful retry, or bump its retry count.
    /// Other rows of a re-extracted order are settled by the extraction
    /// itself.
    async fn settle(&self, error: &ErrorLog, ok: bool) -> CrawlResult<()> {
        if ok {
            self.store.mark_error_resolved(error.id).await?;
        } else {
            self.store.increment_retry_count(error.id).await?;
        }
        Ok(())
    }

    async fn is_resolved(&self, id: i64) -> CrawlResult<bool> {
        Ok(self
            .store
            .get_error_by_id(id)
            .await?
            .map(|e| e.resolved)
            .unwrap_or(true))
    }
}

fn display_name(error: &ErrorLog) -> String {
    if let Some(name) = &error.item_name {
        return name.clone();
    }
    if let Some(order_no) = &error.order_no {
        return order_no.clone();
    }
    match (error.order_year, error.order_page) {
        (Some(bucket), Some(page)) => format!("{} page {}", bucket, page),
        _ => format!("error {}", error.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_row() -> ErrorLog {
        ErrorLog {
            id: 7,
            url: "https://shop.example/history?filter=2021&page=2".into(),
            error_type: ErrorType::NoOrderNo,
            context: ErrorContext::Order,
            message: None,
            retry_count: 0,
            resolved: false,
            order_no: None,
            item_name: None,
            order_year: Some(TimeFilter::Year(2021)),
            order_page: Some(2),
            order_index: Some(3),
            created_at: None,
        }
    }

    #[test]
    fn display_name_prefers_item_then_order() {
        let mut row = ledger_row();
        assert_eq!(display_name(&row), "2021 page 2");
        row.order_no = Some("249-1".into());
        assert_eq!(display_name(&row), "249-1");
        row.item_name = Some("Kettle".into());
        assert_eq!(display_name(&row), "Kettle");
        row.order_year = None;
        row.item_name = None;
        row.order_no = None;
        assert_eq!(display_name(&row), "error 7");
    }

    #[test]
    fn summary_totals_every_pass() {
        let summary = RetrySummary {
            years: PassTally { succeeded: 1, failed: 0 },
            orders: PassTally { succeeded: 2, failed: 1 },
            categories: PassTally { succeeded: 0, failed: 2 },
            thumbnails: PassTally { succeeded: 3, failed: 0 },
        };
        assert_eq!(summary.succeeded(), 6);
        assert_eq!(summary.failed(), 3);
    }
}
