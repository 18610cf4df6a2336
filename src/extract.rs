//! Order/item extraction.
//!
//! Turns one order detail page into stored [`Item`]s. The browser does the
//! scraping; this module normalizes what it returns (dates, prices,
//! product identifiers, kinds), runs the secondary-tab sub-fetches for
//! category breadcrumbs and thumbnails, and upserts the results.
//!
//! Sub-fetch failures are recorded under their own ledger context, keyed
//! by the fetched URL and the item name, and never fail the order.

use std::future::Future;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::browser::{navigate, OrderClass, OrderDetail, RawItem};
use crate::crawler::Crawler;
use crate::error::CrawlResult;
use crate::models::{ErrorContext, ErrorType, Item, ItemKind, NewError, Order};
use crate::parser;

impl Crawler {
    /// Visit the order's detail page and collect it. Returns whether at
    /// least one item was stored.
    pub async fn fetch_order(&self, order: &Order) -> CrawlResult<bool> {
        let browser = self.browser()?;
        navigate(browser, &order.url).await?;
        self.extract_order(order).await
    }

    /// Collect the order on the current page.
    pub async fn extract_order(&self, order: &Order) -> CrawlResult<bool> {
        let browser = self.browser()?;
        info!(order_no = %order.order_no, date = %order.date, "reading order");

        let detail = browser.extract_order_detail(order).await?;
        if detail.items.is_empty() {
            return Ok(false);
        }

        // Readable again: anything recorded against this order so far is settled.
        self.store
            .mark_errors_resolved_by_order_no(&detail.order_no)
            .await?;

        let date = order_date(&detail).unwrap_or(order.date);
        let mut stored = 0;
        for raw in &detail.items {
            if self.is_shutdown_requested() {
                break;
            }
            let item = self.build_item(order, &detail, date, raw).await?;
            self.store.upsert_item(&item).await?;
            info!(order_no = %item.order_no, name = %item.name, price = item.price, "item stored");
            stored += 1;
        }
        Ok(stored > 0)
    }

    async fn build_item(
        &self,
        order: &Order,
        detail: &OrderDetail,
        date: NaiveDate,
        raw: &RawItem,
    ) -> CrawlResult<Item> {
        let url = raw.url.clone().filter(|u| !u.is_empty());
        let product_id = url.as_deref().and_then(parser::product_id_from_url);

        let price = match parser::parse_price(&raw.price_text) {
            Some(price) => price,
            None => {
                warn!(order_no = %detail.order_no, name = %raw.name, text = %raw.price_text, "unreadable price");
                self.store
                    .record_or_update_error(
                        &NewError::new(&order.url, ErrorType::PriceError, ErrorContext::Order)
                            .message(format!("unreadable price '{}'", raw.price_text))
                            .order_no(&detail.order_no)
                            .item_name(&raw.name)
                            .located(order.time_filter, order.page),
                    )
                    .await?;
                0
            }
        };

        let category = match &url {
            Some(url) => self.collect_category(url, &raw.name).await?,
            None => Vec::new(),
        };

        if let (Some(thumb_url), Some(id)) = (&raw.thumbnail_url, &product_id) {
            self.collect_thumbnail(thumb_url, id, &raw.name).await?;
        }

        let kind = match detail.class {
            OrderClass::Digital => ItemKind::Digital,
            OrderClass::Standard if raw.gift_card => ItemKind::GiftCard,
            OrderClass::Standard => ItemKind::Normal,
        };

        Ok(Item {
            order_no: detail.order_no.clone(),
            product_id,
            date,
            name: raw.name.clone(),
            url,
            quantity: raw.quantity.max(1),
            price,
            category,
            seller: raw.seller.clone(),
            condition: raw.condition.clone(),
            kind,
            time_filter: order.time_filter,
            page: order.page,
        })
    }

    /// Breadcrumb for `url`, or empty after recording a category failure.
    async fn collect_category(&self, url: &str, name: &str) -> CrawlResult<Vec<String>> {
        match self.fetch_category_with_retry(url).await {
            Ok(path) => Ok(path),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(url, error = %e, "category unavailable");
                self.store
                    .record_or_update_error(
                        &NewError::new(url, e.error_type(), ErrorContext::Category)
                            .message(e.to_string())
                            .item_name(name),
                    )
                    .await?;
                Ok(Vec::new())
            }
        }
    }

    /// Cache the thumbnail for `product_id` unless it is already on disk.
    async fn collect_thumbnail(
        &self,
        thumb_url: &str,
        product_id: &str,
        name: &str,
    ) -> CrawlResult<()> {
        let Some(path) = self.config.thumbnail_path(Some(product_id)) else {
            return Ok(());
        };
        if path.exists() {
            return Ok(());
        }
        match self.save_thumbnail_with_retry(thumb_url, &path).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(url = thumb_url, error = %e, "thumbnail unavailable");
                self.store
                    .record_or_update_error(
                        &NewError::new(thumb_url, e.error_type(), ErrorContext::Thumbnail)
                            .message(e.to_string())
                            .item_name(name),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    pub(crate) async fn fetch_category_with_retry(&self, url: &str) -> CrawlResult<Vec<String>> {
        let browser = self.browser()?;
        self.with_budget(self.config.crawl.retry_category, move || {
            browser.fetch_category(url)
        })
        .await
    }

    pub(crate) async fn save_thumbnail_with_retry(
        &self,
        url: &str,
        dest: &std::path::Path,
    ) -> CrawlResult<()> {
        let browser = self.browser()?;
        self.with_budget(self.config.crawl.retry_thumbnail, move || {
            browser.save_thumbnail(url, dest)
        })
        .await
    }

    /// Run `op` up to `budget` times (at least once), pausing between
    /// attempts. Fatal errors are returned immediately.
    async fn with_budget<T, F, Fut>(&self, budget: u32, mut op: F) -> CrawlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CrawlResult<T>>,
    {
        let attempts = budget.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() || attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(attempt, error = %e, "sub-fetch failed, retrying");
                    attempt += 1;
                    self.pause(self.config.crawl.retry_delay_ms).await;
                }
            }
        }
    }
}

fn order_date(detail: &OrderDetail) -> Option<NaiveDate> {
    match detail.class {
        OrderClass::Digital => parser::parse_date_digital(&detail.date_text),
        OrderClass::Standard => parser::parse_date(&detail.date_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(class: OrderClass, date_text: &str) -> OrderDetail {
        OrderDetail {
            class,
            order_no: "D01-1".into(),
            date_text: date_text.into(),
            items: vec![],
        }
    }

    #[test]
    fn date_format_follows_order_class() {
        assert_eq!(
            order_date(&detail(OrderClass::Digital, "2024/02/29")),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(
            order_date(&detail(OrderClass::Standard, "2024年2月29日")),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(order_date(&detail(OrderClass::Digital, "2024年2月29日")), None);
    }
}
