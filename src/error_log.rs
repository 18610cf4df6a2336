//! Error ledger: failures keyed by `(url, context)`.
//!
//! A repeat of the same natural key bumps `retry_count` on the existing
//! unresolved row instead of appending. Rows are resolved one at a time,
//! by URL, or by order number once that order is processed cleanly.

use anyhow::Result;
use chrono::{Duration, Local, NaiveDateTime};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::models::{ErrorContext, ErrorLog, ErrorType, NewError, TimeFilter};
use crate::store::{Store, DATETIME_FORMAT};

/// An unresolved category failure joined back to the item it belongs to.
#[derive(Debug, Clone)]
pub struct FailedCategory {
    pub error_id: i64,
    pub url: String,
    pub item_name: Option<String>,
}

/// An unresolved thumbnail failure with the product it should be cached
/// under, when one can be found.
#[derive(Debug, Clone)]
pub struct FailedThumbnail {
    pub error_id: i64,
    pub url: String,
    pub item_name: Option<String>,
    pub product_id: Option<String>,
}

impl Store {
    /// Append a new ledger row unconditionally. Returns its id.
    pub async fn record_error(&self, error: &NewError) -> Result<i64> {
        let now = Local::now().naive_local().format(DATETIME_FORMAT).to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO error_log (url, error_type, error_message, context, order_no, item_name,
                                   order_year, order_page, order_index, retry_count, resolved,
                                   created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?)
            "#,
        )
        .bind(&error.url)
        .bind(error.error_type.as_str())
        .bind(&error.message)
        .bind(error.context.as_str())
        .bind(&error.order_no)
        .bind(&error.item_name)
        .bind(error.order_year.map(|t| t.as_key()))
        .bind(error.order_page.map(|p| p as i64))
        .bind(error.order_index.map(|i| i as i64))
        .bind(now)
        .execute(self.pool())
        .await?;
        let id = result.last_insert_rowid();
        debug!(error_id = id, url = %error.url, context = %error.context, kind = %error.error_type, "error recorded");
        Ok(id)
    }

    pub async fn get_unresolved_error_by_url(
        &self,
        url: &str,
        context: &ErrorContext,
    ) -> Result<Option<ErrorLog>> {
        let row = sqlx::query(
            "SELECT * FROM error_log WHERE url = ? AND context = ? AND resolved = 0 \
             ORDER BY id LIMIT 1",
        )
        .bind(url)
        .bind(context.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(error_from_row).transpose()
    }

    /// Record a failure, deduplicating on `(url, context)` among unresolved
    /// rows. A repeat increments `retry_count` and keeps the original row.
    pub async fn record_or_update_error(&self, error: &NewError) -> Result<i64> {
        if let Some(existing) = self
            .get_unresolved_error_by_url(&error.url, &error.context)
            .await?
        {
            self.increment_retry_count(existing.id).await?;
            return Ok(existing.id);
        }
        self.record_error(error).await
    }

    pub async fn increment_retry_count(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE error_log SET retry_count = retry_count + 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_error_by_id(&self, id: i64) -> Result<Option<ErrorLog>> {
        let row = sqlx::query("SELECT * FROM error_log WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(error_from_row).transpose()
    }

    /// Unresolved rows, oldest first, optionally restricted to one context.
    pub async fn get_unresolved_errors(
        &self,
        context: Option<&ErrorContext>,
    ) -> Result<Vec<ErrorLog>> {
        let rows = match context {
            Some(ctx) => {
                sqlx::query("SELECT * FROM error_log WHERE resolved = 0 AND context = ? ORDER BY id")
                    .bind(ctx.as_str())
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM error_log WHERE resolved = 0 ORDER BY id")
                    .fetch_all(self.pool())
                    .await?
            }
        };
        rows.iter().map(error_from_row).collect()
    }

    /// Unresolved order-level failures, excluding year count fallbacks
    /// (those are repaired by re-walking the whole year).
    pub async fn get_failed_orders(&self) -> Result<Vec<ErrorLog>> {
        let rows = sqlx::query(
            "SELECT * FROM error_log WHERE resolved = 0 AND context = ? AND error_type != ? \
             ORDER BY id",
        )
        .bind(ErrorContext::Order.as_str())
        .bind(ErrorType::OrderCountFallback.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(error_from_row).collect()
    }

    /// Unresolved year-level rows (count fallbacks and buckets that could
    /// not be counted or walked); each names a year to re-walk.
    pub async fn get_failed_years(&self) -> Result<Vec<ErrorLog>> {
        let rows = sqlx::query(
            "SELECT * FROM error_log WHERE resolved = 0 AND (error_type = ? OR context = ?) \
             ORDER BY id",
        )
        .bind(ErrorType::OrderCountFallback.as_str())
        .bind(ErrorContext::Year.as_str())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(error_from_row).collect()
    }

    pub async fn get_failed_category_items(&self) -> Result<Vec<FailedCategory>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.url, COALESCE(e.item_name, MIN(i.name)) AS item_name
            FROM error_log e
            LEFT JOIN items i ON i.url = e.url
            WHERE e.resolved = 0 AND e.context = ?
            GROUP BY e.id
            ORDER BY e.id
            "#,
        )
        .bind(ErrorContext::Category.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| FailedCategory {
                error_id: r.get("id"),
                url: r.get("url"),
                item_name: r.get("item_name"),
            })
            .collect())
    }

    pub async fn get_failed_thumbnail_items(&self) -> Result<Vec<FailedThumbnail>> {
        let rows = sqlx::query(
            r#"
            SELECT e.id, e.url, e.item_name, MIN(i.product_id) AS product_id
            FROM error_log e
            LEFT JOIN items i ON i.name = e.item_name
            WHERE e.resolved = 0 AND e.context = ?
            GROUP BY e.id
            ORDER BY e.id
            "#,
        )
        .bind(ErrorContext::Thumbnail.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|r| FailedThumbnail {
                error_id: r.get("id"),
                url: r.get("url"),
                item_name: r.get("item_name"),
                product_id: r.get("product_id"),
            })
            .collect())
    }

    /// Product identifier of the item a thumbnail error refers to.
    pub async fn get_thumbnail_product_id_by_error_id(&self, id: i64) -> Result<Option<String>> {
        let product_id: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT i.product_id FROM error_log e
            JOIN items i ON i.name = e.item_name
            WHERE e.id = ? AND i.product_id IS NOT NULL
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(product_id.flatten())
    }

    /// Newest first, unresolved and resolved alike.
    pub async fn get_all_errors(&self, limit: Option<i64>) -> Result<Vec<ErrorLog>> {
        let rows = sqlx::query("SELECT * FROM error_log ORDER BY id DESC LIMIT ?")
            .bind(limit.unwrap_or(-1))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(error_from_row).collect()
    }

    pub async fn mark_error_resolved(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE error_log SET resolved = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn mark_errors_resolved_by_url(&self, url: &str, context: &ErrorContext) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE error_log SET resolved = 1 WHERE url = ? AND context = ? AND resolved = 0",
        )
        .bind(url)
        .bind(context.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_errors_resolved_by_order_no(&self, order_no: &str) -> Result<u64> {
        let result =
            sqlx::query("UPDATE error_log SET resolved = 1 WHERE order_no = ? AND resolved = 0")
                .bind(order_no)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected())
    }

    /// Delete resolved rows older than `days`. Unresolved rows are kept
    /// regardless of age.
    pub async fn clear_old_errors(&self, days: u32) -> Result<u64> {
        let cutoff: NaiveDateTime = Local::now().naive_local() - Duration::days(days as i64);
        let result = sqlx::query("DELETE FROM error_log WHERE resolved = 1 AND created_at < ?")
            .bind(cutoff.format(DATETIME_FORMAT).to_string())
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Row count, optionally filtered by resolution state.
    pub async fn get_error_count(&self, resolved: Option<bool>) -> Result<i64> {
        let count: i64 = match resolved {
            Some(flag) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM error_log WHERE resolved = ?")
                    .bind(flag)
                    .fetch_one(self.pool())
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM error_log")
                    .fetch_one(self.pool())
                    .await?
            }
        };
        Ok(count)
    }

    pub async fn get_unresolved_error_count_by_year(&self, bucket: TimeFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM error_log WHERE resolved = 0 AND order_year = ?",
        )
        .bind(bucket.as_key())
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }
}

fn error_from_row(row: &SqliteRow) -> Result<ErrorLog> {
    let error_type: String = row.get("error_type");
    let context: String = row.get("context");
    let order_year: Option<String> = row.get("order_year");
    let order_page: Option<i64> = row.get("order_page");
    let order_index: Option<i64> = row.get("order_index");
    let retry_count: i64 = row.get("retry_count");
    let created_at: Option<String> = row.get("created_at");

    Ok(ErrorLog {
        id: row.get("id"),
        url: row.get("url"),
        error_type: error_type.parse()?,
        context: ErrorContext::parse(&context),
        message: row.get("error_message"),
        retry_count: retry_count.max(0) as u32,
        resolved: row.get("resolved"),
        order_no: row.get("order_no"),
        item_name: row.get("item_name"),
        order_year: order_year.and_then(|y| y.parse().ok()),
        order_page: order_page.map(|p| p as u32),
        order_index: order_index.map(|i| i as u32),
        created_at: created_at
            .and_then(|s| NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{item, temp_store};

    fn order_error(url: &str, order_no: &str) -> NewError {
        NewError::new(url, ErrorType::FetchError, ErrorContext::Order)
            .order_no(order_no)
            .message("boom")
    }

    #[tokio::test]
    async fn repeat_failure_bumps_retry_count() {
        let (_tmp, store) = temp_store().await;
        let e = order_error("https://shop.example/o/1", "111-1");
        let first = store.record_or_update_error(&e).await.unwrap();
        let second = store.record_or_update_error(&e).await.unwrap();
        assert_eq!(first, second);

        let all = store.get_all_errors(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].retry_count, 1);
    }

    #[tokio::test]
    async fn same_url_different_context_is_a_new_row() {
        let (_tmp, store) = temp_store().await;
        let url = "https://shop.example/dp/B001";
        store
            .record_or_update_error(&NewError::new(url, ErrorType::FetchError, ErrorContext::Category))
            .await
            .unwrap();
        store
            .record_or_update_error(&NewError::new(url, ErrorType::FetchError, ErrorContext::Thumbnail))
            .await
            .unwrap();
        assert_eq!(store.get_error_count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resolved_row_does_not_absorb_new_failure() {
        let (_tmp, store) = temp_store().await;
        let e = order_error("u", "1");
        let id = store.record_or_update_error(&e).await.unwrap();
        store.mark_error_resolved(id).await.unwrap();
        let again = store.record_or_update_error(&e).await.unwrap();
        assert_ne!(id, again);
        assert_eq!(store.get_error_count(Some(false)).await.unwrap(), 1);
        assert_eq!(store.get_error_count(Some(true)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resolve_by_order_no_leaves_other_orders() {
        let (_tmp, store) = temp_store().await;
        store.record_error(&order_error("a", "111-1")).await.unwrap();
        store
            .record_error(
                &NewError::new("b", ErrorType::PriceError, ErrorContext::Category).order_no("111-1"),
            )
            .await
            .unwrap();
        let other = store.record_error(&order_error("c", "222-2")).await.unwrap();

        assert_eq!(store.mark_errors_resolved_by_order_no("111-1").await.unwrap(), 2);
        let unresolved = store.get_unresolved_errors(None).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, other);
    }

    #[tokio::test]
    async fn unresolved_count_by_year() {
        let (_tmp, store) = temp_store().await;
        let e = order_error("a", "1").located(Some(TimeFilter::Year(2023)), Some(2));
        store.record_error(&e).await.unwrap();
        assert_eq!(
            store
                .get_unresolved_error_count_by_year(TimeFilter::Year(2023))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .get_unresolved_error_count_by_year(TimeFilter::Year(2024))
                .await
                .unwrap(),
            0
        );
        let stored = store.get_error_by_id(1).await.unwrap().unwrap();
        assert_eq!(stored.order_page, Some(2));
        assert_eq!(stored.order_year, Some(TimeFilter::Year(2023)));
    }

    #[tokio::test]
    async fn failed_years_and_orders_are_disjoint() {
        let (_tmp, store) = temp_store().await;
        store
            .record_error(
                &NewError::new("hist", ErrorType::OrderCountFallback, ErrorContext::Year)
                    .located(Some(TimeFilter::Year(2020)), None),
            )
            .await
            .unwrap();
        store
            .record_error(
                &NewError::new("hist2", ErrorType::Timeout, ErrorContext::Year)
                    .located(Some(TimeFilter::Year(2021)), None),
            )
            .await
            .unwrap();
        store.record_error(&order_error("o", "1")).await.unwrap();

        assert_eq!(store.get_failed_years().await.unwrap().len(), 2);
        let orders = store.get_failed_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].url, "o");
    }

    #[tokio::test]
    async fn thumbnail_failure_joins_product_by_name() {
        let (_tmp, store) = temp_store().await;
        let it = item("1", "B0THUMB", (2024, 1, 1));
        store.upsert_item(&it).await.unwrap();
        let id = store
            .record_error(
                &NewError::new("https://img.example/t.jpg", ErrorType::FetchError, ErrorContext::Thumbnail)
                    .item_name(&it.name),
            )
            .await
            .unwrap();

        let failed = store.get_failed_thumbnail_items().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].product_id.as_deref(), Some("B0THUMB"));
        assert_eq!(
            store.get_thumbnail_product_id_by_error_id(id).await.unwrap(),
            Some("B0THUMB".to_string())
        );
    }

    #[tokio::test]
    async fn clear_old_errors_keeps_recent_and_unresolved() {
        let (_tmp, store) = temp_store().await;
        let id = store.record_error(&order_error("a", "1")).await.unwrap();
        store.mark_error_resolved(id).await.unwrap();
        store.record_error(&order_error("b", "2")).await.unwrap();
        sqlx::query("UPDATE error_log SET created_at = '2000-01-01T00:00:00'")
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(store.clear_old_errors(30).await.unwrap(), 1);
        assert_eq!(store.get_error_count(None).await.unwrap(), 1);
        assert_eq!(store.get_error_count(Some(false)).await.unwrap(), 1);
    }
}
