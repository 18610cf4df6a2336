//! Collection statistics and health overview.
//!
//! Summarizes what has been collected so far: item and order counts,
//! per-bucket crawl state, and the error ledger. Used by `orderhist stats`
//! to show how far a crawl got and what still needs a retry.

use anyhow::Result;
use chrono::NaiveDate;

use crate::config::Config;
use crate::models::TimeFilter;
use crate::planner::total_pages;
use crate::store::{Store, DATETIME_FORMAT};

/// Per-bucket crawl state.
struct BucketStats {
    bucket: TimeFilter,
    order_count: u32,
    checked: bool,
    pages_checked: i64,
    pages_total: u32,
    items: i64,
    unresolved: i64,
    last_order: Option<NaiveDate>,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = Store::open(config).await?;

    let item_count = store.get_item_count().await?;
    let order_count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT order_no) FROM items")
        .fetch_one(store.pool())
        .await?;
    let expected_orders = store.get_total_order_count().await?;
    let last_modified = store.get_last_modified().await?;
    let unresolved = store.get_error_count(Some(false)).await?;
    let resolved = store.get_error_count(Some(true)).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let mut buckets = Vec::new();
    for bucket in store.get_year_list().await? {
        let status = store.get_year_status(bucket).await?;
        let order_count = status.as_ref().map(|s| s.order_count).unwrap_or(0);
        buckets.push(BucketStats {
            bucket,
            order_count,
            checked: status.map(|s| s.checked).unwrap_or(false),
            pages_checked: store.count_checked_pages(bucket).await?,
            pages_total: total_pages(order_count),
            items: store.get_item_count_by_filter(bucket).await?,
            unresolved: store.get_unresolved_error_count_by_year(bucket).await?,
            last_order: store.get_last_item_by_filter(bucket).await?.map(|i| i.date),
        });
    }

    println!("orderhist: Collection Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Updated:     {}", last_modified.format(DATETIME_FORMAT));
    println!();
    println!("  Items:       {}", item_count);
    println!(
        "  Orders:      {} / {} ({}%)",
        order_count,
        expected_orders,
        if expected_orders > 0 {
            (order_count * 100) / expected_orders
        } else {
            0
        }
    );
    println!("  Errors:      {} unresolved, {} resolved", unresolved, resolved);

    if !buckets.is_empty() {
        println!();
        println!("  By year:");
        println!(
            "  {:<10} {:>7} {:>7} {:>9} {:>8}   {:<8} {}",
            "YEAR", "ORDERS", "ITEMS", "PAGES", "ERRORS", "STATUS", "LATEST"
        );
        println!("  {}", "-".repeat(72));

        for b in &buckets {
            println!(
                "  {:<10} {:>7} {:>7} {:>9} {:>8}   {:<8} {}",
                b.bucket.to_string(),
                b.order_count,
                b.items,
                format!("{}/{}", b.pages_checked, b.pages_total),
                b.unresolved,
                if b.checked { "checked" } else { "pending" },
                b.last_order
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
    }

    println!();

    store.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
