//! # orderhist CLI
//!
//! The `orderhist` binary collects purchase history into SQLite and
//! reports on it.
//!
//! ## Usage
//!
//! ```bash
//! orderhist --config ./config/orderhist.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `orderhist init` | Create the SQLite database and run schema migrations |
//! | `orderhist crawl` | Collect order history (resumable) |
//! | `orderhist retry` | Retry unresolved failures from the error ledger |
//! | `orderhist errors` | List error-ledger rows |
//! | `orderhist stats` | Summarize collected items and crawl state |
//! | `orderhist export` | Write the item list as JSON |
//! | `orderhist prune-errors` | Delete old resolved errors |
//!
//! ## Examples
//!
//! ```bash
//! # Collect only 2023, starting from page 3
//! orderhist crawl --year 2023 --start-page 3
//!
//! # Re-walk everything, ignoring what was already checked
//! orderhist crawl --force
//!
//! # Retry a single ledger entry
//! orderhist retry --id 42
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use orderhist::browser::Browser;
use orderhist::config::{self, Config};
use orderhist::crawler::{BrowserLauncher, CrawlOptions, CrawlStatus, Crawler};
use orderhist::fixture::FixtureBrowser;
use orderhist::models::TimeFilter;
use orderhist::progress::{Progress, ProgressMode};
use orderhist::shutdown::Shutdown;
use orderhist::store::Store;
use orderhist::{export, ledger, logging, migrate, stats};

/// orderhist: a resumable, local-first collector for e-commerce
/// purchase history.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/orderhist.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "orderhist",
    about = "orderhist: a resumable, local-first collector for e-commerce purchase history",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/orderhist.toml")]
    config: PathBuf,

    /// Progress output: `off`, `human` or `json` (stderr). Defaults to
    /// `human` on a terminal and `off` otherwise.
    #[arg(long, global = true, value_parser = parse_progress_mode)]
    progress: Option<ProgressMode>,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Running
    /// it again is safe.
    Init,

    /// Collect purchase history.
    ///
    /// Walks every year bucket that is not yet checked, plus the buckets
    /// that can still receive orders. Progress is persisted after every
    /// page, so an interrupted crawl resumes where it stopped.
    Crawl {
        /// Only this bucket: a year such as `2023`, or `archive`.
        #[arg(long)]
        year: Option<TimeFilter>,

        /// First page to walk in the `--year` bucket.
        #[arg(long, default_value_t = 1)]
        start_page: u32,

        /// Ignore cached page, year and order state.
        #[arg(long)]
        force: bool,

        /// Stop after one order of one page of one bucket.
        #[arg(long)]
        debug: bool,
    },

    /// Retry unresolved failures recorded in the error ledger.
    Retry {
        /// Retry only the ledger row with this id.
        #[arg(long)]
        id: Option<i64>,
    },

    /// List error-ledger rows, newest first.
    Errors {
        /// Include resolved rows.
        #[arg(long)]
        all: bool,

        /// Maximum number of rows to list.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Summarize collected items and per-year crawl state.
    Stats,

    /// Export the item list as JSON for the spreadsheet renderer.
    Export {
        /// Output file. Writes to stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Delete resolved errors older than the given age.
    PruneErrors {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
}

/// Parse the `--progress` flag.
fn parse_progress_mode(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!(
            "invalid progress mode '{}' (expected off, human or json)",
            other
        )),
    }
}

/// Browser factory for the configured driver. The crawler calls it on
/// first use only.
fn browser_launcher(cfg: &Config) -> BrowserLauncher {
    let fixture = cfg.browser.fixture.clone();
    let crawl = cfg.crawl.clone();
    Box::new(move || {
        let path = fixture.as_deref().ok_or_else(|| {
            anyhow::anyhow!("no browser driver configured; set [browser] fixture")
        })?;
        let browser: Arc<dyn Browser> = Arc::new(FixtureBrowser::load(path, &crawl)?);
        Ok(browser)
    })
}

async fn build_crawler(cfg: &Config, mode: ProgressMode, options: CrawlOptions) -> anyhow::Result<Crawler> {
    cfg.prepare_directories()?;
    let store = Store::open(cfg).await?;
    let shutdown = Shutdown::new();
    shutdown.install_ctrl_c_handler();
    Ok(
        Crawler::new(cfg.clone(), store, Progress::new(mode.reporter()), shutdown)
            .with_options(options)
            .with_launcher(browser_launcher(cfg)),
    )
}

fn load(path: &Path) -> anyhow::Result<Config> {
    config::load_config(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = load(&cli.config)?;
    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);

    match cli.command {
        Commands::Init => {
            migrate::run_init(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl {
            year,
            start_page,
            force,
            debug,
        } => {
            let options = CrawlOptions {
                target: year,
                start_page,
                ignore_cache: force,
                debug,
                ..CrawlOptions::default()
            };
            let mut crawler = build_crawler(&cfg, mode, options).await?;
            let status = crawler.crawl().await;
            crawler.store().close().await;
            match status? {
                CrawlStatus::Completed => info!("crawl finished"),
                CrawlStatus::Interrupted => eprintln!("Crawl interrupted; progress saved."),
            }
        }
        Commands::Retry { id } => {
            let mut crawler = build_crawler(&cfg, mode, CrawlOptions::default()).await?;
            match id {
                Some(id) => {
                    let ok = crawler.retry_error_by_id(id).await;
                    crawler.store().close().await;
                    if ok? {
                        println!("Error {} resolved.", id);
                    } else {
                        eprintln!("Error {} was not resolved.", id);
                        std::process::exit(1);
                    }
                }
                None => {
                    let summary = crawler.retry_failed().await;
                    crawler.store().close().await;
                    let summary = summary?;
                    println!(
                        "Retried: {} succeeded, {} failed",
                        summary.succeeded(),
                        summary.failed()
                    );
                    for (pass, tally) in [
                        ("years", summary.years),
                        ("orders", summary.orders),
                        ("categories", summary.categories),
                        ("thumbnails", summary.thumbnails),
                    ] {
                        println!("  {:<11} {} ok, {} failed", pass, tally.succeeded, tally.failed);
                    }
                }
            }
        }
        Commands::Errors { all, limit } => {
            ledger::run_errors(&cfg, all, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, output.as_deref()).await?;
        }
        Commands::PruneErrors { days } => {
            ledger::run_prune_errors(&cfg, days).await?;
        }
    }

    Ok(())
}
