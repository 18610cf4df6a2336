//! Export collected items as JSON for the spreadsheet renderer.
//!
//! Produces the date-sorted item list, each row carrying its resolved
//! thumbnail path (or `null` when no cached image exists).

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::models::Item;
use crate::store::Store;

#[derive(Serialize)]
struct ExportData {
    item_count: usize,
    items: Vec<ExportItem>,
}

#[derive(Serialize)]
struct ExportItem {
    #[serde(flatten)]
    item: Item,
    thumbnail: Option<PathBuf>,
}

/// Export all items as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>) -> Result<()> {
    let store = Store::open(config).await?;
    let items = store.get_item_list().await?;
    store.close().await;

    let data = build_export(config, items);
    let json = serde_json::to_string_pretty(&data)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write export: {}", path.display()))?;
            eprintln!("Exported {} items to {}", data.item_count, path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    Ok(())
}

fn build_export(config: &Config, items: Vec<Item>) -> ExportData {
    let items: Vec<ExportItem> = items
        .into_iter()
        .map(|item| {
            let thumbnail = config
                .thumbnail_path(item.product_id.as_deref())
                .filter(|p| p.exists());
            ExportItem { item, thumbnail }
        })
        .collect();
    ExportData {
        item_count: items.len(),
        items,
    }
}
