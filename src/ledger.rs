//! Error-ledger commands: `orderhist errors` and `orderhist prune-errors`.

use anyhow::Result;

use crate::config::Config;
use crate::models::ErrorLog;
use crate::store::{Store, DATETIME_FORMAT};

/// Print ledger rows to stdout, newest first. Without `all`, only
/// unresolved rows are listed.
pub async fn run_errors(config: &Config, all: bool, limit: Option<i64>) -> Result<()> {
    let store = Store::open(config).await?;
    let rows = if all {
        store.get_all_errors(limit).await?
    } else {
        let mut rows = store.get_unresolved_errors(None).await?;
        rows.reverse();
        if let Some(limit) = limit {
            rows.truncate(limit.max(0) as usize);
        }
        rows
    };
    store.close().await;

    if rows.is_empty() {
        println!("No errors recorded.");
        return Ok(());
    }

    println!(
        "{:>5}  {:<10} {:<21} {:>6} {:<9} {:<14} {}",
        "ID", "CONTEXT", "TYPE", "TRIES", "STATE", "WHERE", "DETAIL"
    );
    for row in &rows {
        println!("{}", format_row(row));
    }
    println!();
    println!("{} error(s)", rows.len());
    Ok(())
}

/// Delete resolved rows older than `days`.
pub async fn run_prune_errors(config: &Config, days: u32) -> Result<()> {
    let store = Store::open(config).await?;
    let removed = store.clear_old_errors(days).await?;
    store.close().await;
    println!("Removed {} resolved error(s) older than {} days.", removed, days);
    Ok(())
}

fn format_row(row: &ErrorLog) -> String {
    let location = match (row.order_year, row.order_page) {
        (Some(bucket), Some(page)) => format!("{} p{}", bucket, page),
        (Some(bucket), None) => bucket.to_string(),
        _ => "-".to_string(),
    };
    let detail = row
        .item_name
        .as_deref()
        .or(row.order_no.as_deref())
        .unwrap_or(&row.url);
    let mut line = format!(
        "{:>5}  {:<10} {:<21} {:>6} {:<9} {:<14} {}",
        row.id,
        row.context.as_str(),
        row.error_type.as_str(),
        row.retry_count,
        if row.resolved { "resolved" } else { "open" },
        location,
        detail
    );
    if let Some(message) = &row.message {
        line.push_str(&format!(" ({})", message));
    }
    if let Some(created) = row.created_at {
        line.push_str(&format!(" @ {}", created.format(DATETIME_FORMAT)));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorContext, ErrorType, TimeFilter};

    #[test]
    fn row_shows_location_and_best_detail() {
        let row = ErrorLog {
            id: 12,
            url: "https://shop.example/dp/B01".into(),
            error_type: ErrorType::FetchError,
            context: ErrorContext::Category,
            message: Some("timed out".into()),
            retry_count: 2,
            resolved: false,
            order_no: Some("250-9".into()),
            item_name: Some("Desk lamp".into()),
            order_year: Some(TimeFilter::Year(2022)),
            order_page: Some(4),
            order_index: None,
            created_at: None,
        };
        let line = format_row(&row);
        assert!(line.contains("category"));
        assert!(line.contains("fetch_error"));
        assert!(line.contains("2022 p4"));
        assert!(line.contains("Desk lamp (timed out)"));
        assert!(line.contains("open"));
    }
}
