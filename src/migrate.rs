use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the database file (if needed) and bring the schema up to date.
pub async fn run_init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Purchased line items. `item_key` is the product identifier, or a
    // name-derived key when the order carries none, so that the natural
    // identity stays NOT NULL and the upsert conflict target always fires.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            order_no TEXT NOT NULL,
            item_key TEXT NOT NULL,
            product_id TEXT,
            date TEXT NOT NULL,
            name TEXT NOT NULL,
            url TEXT,
            quantity INTEGER NOT NULL DEFAULT 1,
            price INTEGER NOT NULL DEFAULT 0,
            category TEXT NOT NULL DEFAULT '[]',
            seller TEXT NOT NULL DEFAULT '',
            condition TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL DEFAULT 'Normal',
            time_filter TEXT,
            page INTEGER,
            UNIQUE(order_no, item_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS year_status (
            time_filter TEXT PRIMARY KEY,
            order_count INTEGER NOT NULL DEFAULT 0,
            checked INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page_status (
            time_filter TEXT NOT NULL,
            page INTEGER NOT NULL,
            checked INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (time_filter, page)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS error_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            error_type TEXT NOT NULL,
            error_message TEXT,
            context TEXT NOT NULL,
            order_no TEXT,
            item_name TEXT,
            order_year TEXT,
            order_page INTEGER,
            order_index INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            resolved INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_order_no ON items(order_no)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_time_filter ON items(time_filter, date)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_date ON items(date)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_error_log_key ON error_log(url, context, resolved)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_error_log_order_no ON error_log(order_no)")
        .execute(pool)
        .await?;

    Ok(())
}
