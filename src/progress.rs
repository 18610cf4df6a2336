//! Crawl progress reporting.
//!
//! A [`Progress`] holds named counters (one per bucket, one global) and
//! forwards every change to a [`ProgressReporter`] sink. Output goes to
//! **stderr** so stdout remains parseable for scripts.
//!
//! Counters are a pure side channel. Touching a counter that was never
//! created is a no-op: retry and resume paths update counters without
//! knowing whether the walk that owns them ever started.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Mutex;

use crate::models::TimeFilter;

/// Label of the counter sized by every known order.
pub const ALL_ORDERS_LABEL: &str = "all orders";

/// Label of the per-bucket order counter.
pub fn bucket_label(bucket: TimeFilter) -> String {
    match bucket {
        TimeFilter::Year(y) => format!("orders {}", y),
        TimeFilter::Archive => "orders archive".to_string(),
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Counter `label` now stands at `n` of `total`.
    Counter { label: String, n: u64, total: u64 },
    /// Free-form status line.
    Status { text: String, is_error: bool },
}

/// Sink for progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "orders 2024  12 / 57".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Counter { label, n, total } => {
                format!("{}  {} / {}\n", label, format_number(*n), format_number(*total))
            }
            ProgressEvent::Status { text, is_error } => {
                if *is_error {
                    format!("error: {}\n", text)
                } else {
                    format!("{}\n", text)
                }
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Counter { label, n, total } => serde_json::json!({
                "event": "progress",
                "label": label,
                "n": n,
                "total": total
            }),
            ProgressEvent::Status { text, is_error } => serde_json::json!({
                "event": "status",
                "text": text,
                "error": is_error
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Counter {
    count: u64,
    total: u64,
}

/// Named counters plus the sink they report to.
pub struct Progress {
    counters: Mutex<BTreeMap<String, Counter>>,
    reporter: Box<dyn ProgressReporter>,
}

impl Progress {
    pub fn new(reporter: Box<dyn ProgressReporter>) -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
            reporter,
        }
    }

    pub fn silent() -> Self {
        Self::new(Box::new(NoProgress))
    }

    /// Create (or reset) a counter at zero.
    pub fn create(&self, label: &str, total: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.insert(label.to_string(), Counter { count: 0, total });
        }
        self.emit(label, 0, total);
    }

    pub fn has(&self, label: &str) -> bool {
        self.counters
            .lock()
            .map(|c| c.contains_key(label))
            .unwrap_or(false)
    }

    /// Current count; 0 for a counter that does not exist.
    pub fn count(&self, label: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(label).map(|c| c.count))
            .unwrap_or(0)
    }

    pub fn total(&self, label: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(label).map(|c| c.total))
            .unwrap_or(0)
    }

    /// Advance `label` by `n`. No-op if the counter does not exist.
    pub fn advance(&self, label: &str, n: u64) {
        let snapshot = match self.counters.lock() {
            Ok(mut counters) => counters.get_mut(label).map(|c| {
                c.count += n;
                *c
            }),
            Err(_) => None,
        };
        if let Some(c) = snapshot {
            self.emit(label, c.count, c.total);
        }
    }

    /// Advance the bucket counter and the global counter together.
    pub fn advance_orders(&self, bucket: TimeFilter, n: u64) {
        if n == 0 {
            return;
        }
        self.advance(&bucket_label(bucket), n);
        self.advance(ALL_ORDERS_LABEL, n);
    }

    pub fn remove(&self, label: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(label);
        }
    }

    pub fn set_status(&self, text: impl Into<String>, is_error: bool) {
        self.reporter.report(ProgressEvent::Status {
            text: text.into(),
            is_error,
        });
    }

    fn emit(&self, label: &str, n: u64, total: u64) {
        self.reporter.report(ProgressEvent::Counter {
            label: label.to_string(),
            n,
            total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn missing_counter_is_a_no_op() {
        let progress = Progress::silent();
        progress.advance("nope", 3);
        progress.advance_orders(TimeFilter::Year(2020), 2);
        assert!(!progress.has("nope"));
        assert_eq!(progress.count("nope"), 0);
    }

    #[test]
    fn advance_orders_moves_bucket_and_global() {
        let progress = Progress::silent();
        let bucket = TimeFilter::Year(2024);
        progress.create(ALL_ORDERS_LABEL, 30);
        progress.create(&bucket_label(bucket), 15);
        progress.advance_orders(bucket, 4);
        assert_eq!(progress.count(&bucket_label(bucket)), 4);
        assert_eq!(progress.count(ALL_ORDERS_LABEL), 4);
        assert_eq!(progress.total(ALL_ORDERS_LABEL), 30);
    }
}
