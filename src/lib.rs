//! # orderhist
//!
//! A resumable, local-first collector for e-commerce purchase history.
//!
//! orderhist walks a shop's order history year by year and page by page
//! through a [`browser::Browser`] session, extracts every purchased item,
//! and records both what it collected and what it has already checked in
//! SQLite. An interrupted or failed run resumes where it stopped, and
//! every non-fatal failure lands in an error ledger that a later
//! `orderhist retry` repairs surgically.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │   Browser   │──▶│ Crawler              │──▶│    SQLite     │
//! │ (collab.)   │   │ planner ▸ extract    │   │ items, status │
//! └─────────────┘   │ retry                │   │ error ledger  │
//!                   └──────────┬───────────┘   └──────┬───────┘
//!                              ▼                      ▼
//!                        ┌──────────┐          ┌─────────────┐
//!                        │ Progress │          │ stats/export│
//!                        └──────────┘          └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! orderhist init                  # create database
//! orderhist crawl                 # collect everything not yet checked
//! orderhist crawl --year 2023     # one year only
//! orderhist retry                 # repair recorded failures
//! orderhist export --output items.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`store`] | Record store (items, year/page status, metadata) |
//! | [`error_log`] | Error ledger on top of the store |
//! | [`browser`] | Browser collaborator contract |
//! | [`fixture`] | Replay browser driven by a site snapshot |
//! | [`crawler`] | Crawl orchestrator |
//! | [`planner`] | Per-bucket page walk |
//! | [`extract`] | Order and item extraction |
//! | [`retry`] | Error-ledger repair pass |
//! | [`parser`] | Price, date and product id parsing |
//! | [`progress`] | Progress counters and reporters |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod browser;
pub mod config;
pub mod crawler;
pub mod db;
pub mod error;
pub mod error_log;
pub mod export;
pub mod extract;
pub mod fixture;
pub mod ledger;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod stats;
pub mod store;
