//! Record store: the single source of truth for "what has been done".
//!
//! Wraps a [`SqlitePool`] and exposes the item, year-status, page-status
//! and metadata operations the crawl relies on. Error-ledger operations
//! live in [`crate::error_log`] as a second `impl Store` block.
//!
//! The store never retries. Any SQLite failure propagates as an
//! `anyhow::Error` to the caller.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{Item, ItemKind, TimeFilter, YearStatus};

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const YEAR_LIST_KEY: &str = "year_list";
const LAST_MODIFIED_KEY: &str = "last_modified";

/// Fallback for a store that has never recorded a modification.
fn default_last_modified() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1994, 7, 5)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database named in `config` and bring
    /// its schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_path(&config.db.path).await
    }

    pub async fn open_path(path: &Path) -> Result<Self> {
        let pool = db::connect_path(path).await?;
        migrate::run_migrations(&pool)
            .await
            .with_context(|| format!("Failed to migrate database: {}", path.display()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Items ──────────────────────────────────────────────────────────

    /// Insert or replace an item by `(order_no, item_key)`. Last write wins.
    pub async fn upsert_item(&self, item: &Item) -> Result<()> {
        let category = serde_json::to_string(&item.category)?;
        sqlx::query(
            r#"
            INSERT INTO items (order_no, item_key, product_id, date, name, url, quantity,
                               price, category, seller, condition, kind, time_filter, page)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(order_no, item_key) DO UPDATE SET
                product_id = excluded.product_id,
                date = excluded.date,
                name = excluded.name,
                url = excluded.url,
                quantity = excluded.quantity,
                price = excluded.price,
                category = excluded.category,
                seller = excluded.seller,
                condition = excluded.condition,
                kind = excluded.kind,
                time_filter = excluded.time_filter,
                page = excluded.page
            "#,
        )
        .bind(&item.order_no)
        .bind(item.item_key())
        .bind(&item.product_id)
        .bind(item.date.format(DATE_FORMAT).to_string())
        .bind(&item.name)
        .bind(&item.url)
        .bind(item.quantity as i64)
        .bind(item.price)
        .bind(category)
        .bind(&item.seller)
        .bind(&item.condition)
        .bind(item.kind.as_str())
        .bind(item.time_filter.map(|t| t.as_key()))
        .bind(item.page.map(|p| p as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn exists_order(&self, order_no: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM items WHERE order_no = ? LIMIT 1")
            .bind(order_no)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Every item, oldest first.
    pub async fn get_item_list(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query(
            "SELECT * FROM items ORDER BY date ASC, order_no ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn get_item_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_item_count_by_filter(&self, bucket: TimeFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE time_filter = ?")
            .bind(bucket.as_key())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Most recent item discovered in `bucket`.
    pub async fn get_last_item_by_filter(&self, bucket: TimeFilter) -> Result<Option<Item>> {
        let row = sqlx::query(
            "SELECT * FROM items WHERE time_filter = ? ORDER BY date DESC, rowid DESC LIMIT 1",
        )
        .bind(bucket.as_key())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Rewrite the breadcrumb of every item pointing at `url`. Returns the
    /// number of rows touched.
    pub async fn update_item_category(&self, url: &str, category: &[String]) -> Result<u64> {
        let result = sqlx::query("UPDATE items SET category = ? WHERE url = ?")
            .bind(serde_json::to_string(category)?)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ── Year status ────────────────────────────────────────────────────

    /// Upsert a bucket's status. `None` leaves that column as it is (or at
    /// its default for a new row).
    pub async fn set_year_status(
        &self,
        bucket: TimeFilter,
        order_count: Option<u32>,
        checked: Option<bool>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO year_status (time_filter, order_count, checked)
            VALUES (?, COALESCE(?, 0), COALESCE(?, 0))
            ON CONFLICT(time_filter) DO UPDATE SET
                order_count = COALESCE(?, year_status.order_count),
                checked = COALESCE(?, year_status.checked)
            "#,
        )
        .bind(bucket.as_key())
        .bind(order_count.map(|c| c as i64))
        .bind(checked)
        .bind(order_count.map(|c| c as i64))
        .bind(checked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a freshly read order count without ever lowering the cached
    /// one. Returns the count kept.
    pub async fn raise_year_order_count(&self, bucket: TimeFilter, fresh: u32) -> Result<u32> {
        sqlx::query(
            r#"
            INSERT INTO year_status (time_filter, order_count, checked)
            VALUES (?, ?, 0)
            ON CONFLICT(time_filter) DO UPDATE SET
                order_count = MAX(year_status.order_count, excluded.order_count)
            "#,
        )
        .bind(bucket.as_key())
        .bind(fresh as i64)
        .execute(&self.pool)
        .await?;
        self.get_year_order_count(bucket).await
    }

    pub async fn get_year_status(&self, bucket: TimeFilter) -> Result<Option<YearStatus>> {
        let row = sqlx::query("SELECT order_count, checked FROM year_status WHERE time_filter = ?")
            .bind(bucket.as_key())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| YearStatus {
            time_filter: bucket,
            order_count: r.get::<i64, _>("order_count").max(0) as u32,
            checked: r.get::<bool, _>("checked"),
        }))
    }

    /// Cached order count; 0 when the bucket was never counted.
    pub async fn get_year_order_count(&self, bucket: TimeFilter) -> Result<u32> {
        Ok(self
            .get_year_status(bucket)
            .await?
            .map(|s| s.order_count)
            .unwrap_or(0))
    }

    pub async fn is_year_checked(&self, bucket: TimeFilter) -> Result<bool> {
        Ok(self
            .get_year_status(bucket)
            .await?
            .map(|s| s.checked)
            .unwrap_or(false))
    }

    /// Forget everything known about a bucket's traversal: the checked
    /// flag and every page flag. The order count is kept.
    pub async fn reset_year_status(&self, bucket: TimeFilter) -> Result<()> {
        self.set_year_status(bucket, None, Some(false)).await?;
        self.clear_page_status(bucket).await
    }

    pub async fn get_total_order_count(&self) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar("SELECT SUM(order_count) FROM year_status")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.unwrap_or(0))
    }

    pub async fn get_year_list(&self) -> Result<Vec<TimeFilter>> {
        match self.get_metadata(YEAR_LIST_KEY).await? {
            Some(json) => serde_json::from_str(&json).context("Corrupt year_list metadata"),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_year_list(&self, buckets: &[TimeFilter]) -> Result<()> {
        self.set_metadata(YEAR_LIST_KEY, &serde_json::to_string(buckets)?)
            .await
    }

    // ── Page status ────────────────────────────────────────────────────

    pub async fn set_page_checked(&self, bucket: TimeFilter, page: u32, checked: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO page_status (time_filter, page, checked) VALUES (?, ?, ?)
            ON CONFLICT(time_filter, page) DO UPDATE SET checked = excluded.checked
            "#,
        )
        .bind(bucket.as_key())
        .bind(page as i64)
        .bind(checked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn is_page_checked(&self, bucket: TimeFilter, page: u32) -> Result<bool> {
        let checked: Option<bool> =
            sqlx::query_scalar("SELECT checked FROM page_status WHERE time_filter = ? AND page = ?")
                .bind(bucket.as_key())
                .bind(page as i64)
                .fetch_optional(&self.pool)
                .await?;
        Ok(checked.unwrap_or(false))
    }

    pub async fn count_checked_pages(&self, bucket: TimeFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM page_status WHERE time_filter = ? AND checked = 1",
        )
        .bind(bucket.as_key())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Whether pages `1..=total` are all checked.
    pub async fn all_pages_checked(&self, bucket: TimeFilter, total: u32) -> Result<bool> {
        let checked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM page_status \
             WHERE time_filter = ? AND checked = 1 AND page BETWEEN 1 AND ?",
        )
        .bind(bucket.as_key())
        .bind(total as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(checked >= total as i64)
    }

    pub async fn clear_page_status(&self, bucket: TimeFilter) -> Result<()> {
        sqlx::query("DELETE FROM page_status WHERE time_filter = ?")
            .bind(bucket.as_key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Metadata ───────────────────────────────────────────────────────

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_last_modified(&self) -> Result<NaiveDateTime> {
        Ok(self
            .get_metadata(LAST_MODIFIED_KEY)
            .await?
            .and_then(|s| NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).ok())
            .unwrap_or_else(default_last_modified))
    }

    pub async fn set_last_modified(&self, when: NaiveDateTime) -> Result<()> {
        self.set_metadata(LAST_MODIFIED_KEY, &when.format(DATETIME_FORMAT).to_string())
            .await
    }

    /// Persist point: stamp `last_modified` with the current local time.
    pub async fn touch_last_modified(&self) -> Result<()> {
        self.set_last_modified(Local::now().naive_local()).await
    }
}

fn item_from_row(row: &SqliteRow) -> Result<Item> {
    let date: String = row.get("date");
    let category: String = row.get("category");
    let kind: String = row.get("kind");
    let time_filter: Option<String> = row.get("time_filter");
    let page: Option<i64> = row.get("page");
    let quantity: i64 = row.get("quantity");

    Ok(Item {
        order_no: row.get("order_no"),
        product_id: row.get("product_id"),
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
            .with_context(|| format!("Invalid stored item date: '{}'", date))?,
        name: row.get("name"),
        url: row.get("url"),
        quantity: quantity.max(0) as u32,
        price: row.get("price"),
        category: serde_json::from_str(&category).unwrap_or_default(),
        seller: row.get("seller"),
        condition: row.get("condition"),
        kind: kind.parse().unwrap_or(ItemKind::Normal),
        time_filter: time_filter.and_then(|t| t.parse().ok()),
        page: page.map(|p| p as u32),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn temp_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_path(&tmp.path().join("test.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    pub(crate) fn item(order_no: &str, product_id: &str, date: (i32, u32, u32)) -> Item {
        Item {
            order_no: order_no.into(),
            product_id: Some(product_id.into()),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            name: format!("Item {}", product_id),
            url: Some(format!("https://shop.example/dp/{}", product_id)),
            quantity: 1,
            price: 1000,
            category: vec!["Books".into()],
            seller: "Shop".into(),
            condition: "New".into(),
            kind: ItemKind::Normal,
            time_filter: Some(TimeFilter::Year(date.0)),
            page: Some(1),
        }
    }

    #[tokio::test]
    async fn order_count_never_goes_down() {
        let (_tmp, store) = temp_store().await;
        let y = TimeFilter::Year(2023);
        assert_eq!(store.raise_year_order_count(y, 15).await.unwrap(), 15);
        store.set_year_status(y, None, Some(true)).await.unwrap();

        assert_eq!(store.raise_year_order_count(y, 12).await.unwrap(), 15);
        assert_eq!(store.get_year_order_count(y).await.unwrap(), 15);
        assert!(store.is_year_checked(y).await.unwrap());

        store.reset_year_status(y).await.unwrap();
        assert_eq!(store.raise_year_order_count(y, 9).await.unwrap(), 15);
        assert_eq!(store.raise_year_order_count(y, 21).await.unwrap(), 21);
        assert!(!store.is_year_checked(y).await.unwrap());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_last_write_wins() {
        let (_tmp, store) = temp_store().await;
        let mut a = item("111-1", "B001", (2024, 3, 1));
        store.upsert_item(&a).await.unwrap();
        a.price = 2500;
        a.name = "Renamed".into();
        store.upsert_item(&a).await.unwrap();

        let items = store.get_item_list().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].price, 2500);
        assert_eq!(items[0].name, "Renamed");
    }

    #[tokio::test]
    async fn items_without_product_id_dedup_by_name() {
        let (_tmp, store) = temp_store().await;
        let mut a = item("D01-1", "x", (2023, 1, 1));
        a.product_id = None;
        store.upsert_item(&a).await.unwrap();
        store.upsert_item(&a).await.unwrap();
        assert_eq!(store.get_item_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn item_list_is_sorted_by_date() {
        let (_tmp, store) = temp_store().await;
        store.upsert_item(&item("3", "C", (2024, 5, 1))).await.unwrap();
        store.upsert_item(&item("1", "A", (2021, 1, 9))).await.unwrap();
        store.upsert_item(&item("2", "B", (2022, 12, 31))).await.unwrap();

        let dates: Vec<String> = store
            .get_item_list()
            .await
            .unwrap()
            .iter()
            .map(|i| i.date.to_string())
            .collect();
        assert_eq!(dates, vec!["2021-01-09", "2022-12-31", "2024-05-01"]);
    }

    #[tokio::test]
    async fn exists_order_and_last_item() {
        let (_tmp, store) = temp_store().await;
        assert!(!store.exists_order("111-1").await.unwrap());
        store.upsert_item(&item("111-1", "A", (2024, 1, 1))).await.unwrap();
        store.upsert_item(&item("111-2", "B", (2024, 6, 1))).await.unwrap();
        assert!(store.exists_order("111-1").await.unwrap());

        let last = store
            .get_last_item_by_filter(TimeFilter::Year(2024))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.order_no, "111-2");
        assert!(store
            .get_last_item_by_filter(TimeFilter::Archive)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn status_readers_default_when_absent() {
        let (_tmp, store) = temp_store().await;
        let bucket = TimeFilter::Year(2020);
        assert_eq!(store.get_year_order_count(bucket).await.unwrap(), 0);
        assert!(!store.is_year_checked(bucket).await.unwrap());
        assert!(!store.is_page_checked(bucket, 1).await.unwrap());
        assert_eq!(store.get_total_order_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_year_status_updates_keep_other_column() {
        let (_tmp, store) = temp_store().await;
        let bucket = TimeFilter::Year(2022);
        store.set_year_status(bucket, Some(15), None).await.unwrap();
        store.set_year_status(bucket, None, Some(true)).await.unwrap();
        assert_eq!(store.get_year_order_count(bucket).await.unwrap(), 15);
        assert!(store.is_year_checked(bucket).await.unwrap());

        store.set_year_status(TimeFilter::Archive, Some(4), None).await.unwrap();
        assert_eq!(store.get_total_order_count().await.unwrap(), 19);
    }

    #[tokio::test]
    async fn reset_year_clears_pages_and_flag() {
        let (_tmp, store) = temp_store().await;
        let bucket = TimeFilter::Year(2021);
        store.set_year_status(bucket, Some(20), Some(true)).await.unwrap();
        store.set_page_checked(bucket, 1, true).await.unwrap();
        store.set_page_checked(bucket, 2, true).await.unwrap();

        store.reset_year_status(bucket).await.unwrap();
        assert!(!store.is_year_checked(bucket).await.unwrap());
        assert!(!store.is_page_checked(bucket, 2).await.unwrap());
        assert_eq!(store.get_year_order_count(bucket).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let (_tmp, store) = temp_store().await;
        assert_eq!(
            store.get_last_modified().await.unwrap(),
            default_last_modified()
        );
        let list = vec![TimeFilter::Year(2024), TimeFilter::Year(2023), TimeFilter::Archive];
        store.set_year_list(&list).await.unwrap();
        assert_eq!(store.get_year_list().await.unwrap(), list);

        let when = NaiveDate::from_ymd_opt(2024, 2, 3)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap();
        store.set_last_modified(when).await.unwrap();
        assert_eq!(store.get_last_modified().await.unwrap(), when);
    }

    #[tokio::test]
    async fn category_backfill_by_url() {
        let (_tmp, store) = temp_store().await;
        let a = item("1", "A", (2024, 1, 1));
        store.upsert_item(&a).await.unwrap();
        let touched = store
            .update_item_category(a.url.as_deref().unwrap(), &["Home".into(), "Kitchen".into()])
            .await
            .unwrap();
        assert_eq!(touched, 1);
        let items = store.get_item_list().await.unwrap();
        assert_eq!(items[0].category, vec!["Home", "Kitchen"]);
    }
}
