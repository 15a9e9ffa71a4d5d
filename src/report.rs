//! Report rows and where they are written.

use crate::config::Mode;
use crate::counter::IntervalWindow;
use crate::units::Unit;
use log::error;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Column widths of the output table. Every field is right-aligned and
/// followed by [`COLUMN_GAP`], so wide values never run into each other.
pub const ID_WIDTH: usize = 24;
pub const INTERVAL_WIDTH: usize = 14;
pub const AMOUNT_WIDTH: usize = 14;
pub const RATE_WIDTH: usize = 16;
pub const COLUMN_GAP: &str = "  ";

/// Whether a row covers one interval or a whole connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Interval,
    Final,
}

/// One line of the report table.
///
/// # Examples
///
/// ```
/// use simpleperf::report::ReportRow;
/// use simpleperf::units::Unit;
/// use std::time::Duration;
///
/// let row = ReportRow::final_row("127.0.0.1:50000", Duration::from_secs(2), 5_000_000, Unit::Megabytes);
/// assert_eq!(row.rate_mbps, 20.0);
/// assert!(row.format().ends_with("5.00MB        20.00 Mbps"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    /// Endpoint identity (`address:port`)
    pub id: String,
    pub kind: RowKind,
    pub start_secs: f64,
    pub end_secs: f64,
    /// Raw byte count; `unit` only affects display
    pub bytes: u64,
    pub unit: Unit,
    pub rate_mbps: f64,
}

impl ReportRow {
    pub fn new(
        id: impl Into<String>,
        kind: RowKind,
        start: Duration,
        end: Duration,
        bytes: u64,
        unit: Unit,
    ) -> Self {
        let start_secs = start.as_secs_f64();
        let end_secs = end.as_secs_f64();
        Self {
            id: id.into(),
            kind,
            start_secs,
            end_secs,
            bytes,
            unit,
            rate_mbps: rate_mbps(bytes, end_secs - start_secs),
        }
    }

    /// Row for a flushed interval window.
    pub fn interval(id: impl Into<String>, window: IntervalWindow, unit: Unit) -> Self {
        Self::new(id, RowKind::Interval, window.start, window.end, window.bytes, unit)
    }

    /// Row spanning a whole connection, from zero to `elapsed`.
    pub fn final_row(id: impl Into<String>, elapsed: Duration, bytes: u64, unit: Unit) -> Self {
        Self::new(id, RowKind::Final, Duration::ZERO, elapsed, bytes, unit)
    }

    /// Byte count in the configured unit.
    pub fn amount(&self) -> f64 {
        self.unit.scale(self.bytes)
    }

    pub fn format(&self) -> String {
        format!(
            "{:>id$}{gap}{:>iv$}{gap}{:>am$}{gap}{:>rt$}",
            self.id,
            format!("{:.1}-{:.1}", self.start_secs, self.end_secs),
            self.unit.format_amount(self.bytes),
            format!("{:.2} Mbps", self.rate_mbps),
            id = ID_WIDTH,
            iv = INTERVAL_WIDTH,
            am = AMOUNT_WIDTH,
            rt = RATE_WIDTH,
            gap = COLUMN_GAP,
        )
    }
}

/// Megabits per second for `bytes` moved over `elapsed_secs`; zero for an empty window.
pub fn rate_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        bytes as f64 * 8.0 / 1_000_000.0 / elapsed_secs
    } else {
        0.0
    }
}

/// Table header for the given role.
pub fn format_header(mode: Mode) -> String {
    let (amount, rate) = match mode {
        Mode::Server => ("Received", "Rate"),
        Mode::Client => ("Transfer", "Bandwidth"),
    };
    format!(
        "{:>id$}{gap}{:>iv$}{gap}{:>am$}{gap}{:>rt$}",
        "ID",
        "Interval",
        amount,
        rate,
        id = ID_WIDTH,
        iv = INTERVAL_WIDTH,
        am = AMOUNT_WIDTH,
        rt = RATE_WIDTH,
        gap = COLUMN_GAP,
    )
}

/// Jain's fairness index `(Σx)² / (n·Σx²)` over per-stream rates.
///
/// Ranges from `1/n` (one stream got everything) to `1.0` (perfectly fair).
/// Returns `None` for an empty slice or when every rate is zero.
///
/// # Examples
///
/// ```
/// use simpleperf::report::jain_fairness_index;
///
/// assert_eq!(jain_fairness_index(&[10.0, 10.0, 10.0]), Some(1.0));
/// assert_eq!(jain_fairness_index(&[10.0, 0.0]), Some(0.5));
/// assert_eq!(jain_fairness_index(&[]), None);
/// ```
pub fn jain_fairness_index(rates: &[f64]) -> Option<f64> {
    let sum: f64 = rates.iter().sum();
    let sum_sq: f64 = rates.iter().map(|r| r * r).sum();
    if rates.is_empty() || sum_sq == 0.0 {
        return None;
    }
    Some(sum * sum / (rates.len() as f64 * sum_sq))
}

/// Destination for report rows.
///
/// Implemented automatically for any `Fn(&ReportRow)` closure.
///
/// # Examples
///
/// ```
/// use simpleperf::report::{ReportRow, ReportSink};
///
/// let sink = |row: &ReportRow| println!("{} sent {} bytes", row.id, row.bytes);
/// let _boxed: Box<dyn ReportSink> = Box::new(sink);
/// ```
pub trait ReportSink: Send + Sync {
    /// Called once per row.
    fn emit(&self, row: &ReportRow);

    /// Called once, before the first row of a session.
    fn header(&self, _mode: Mode) {}
}

impl<F> ReportSink for F
where
    F: Fn(&ReportRow) + Send + Sync,
{
    fn emit(&self, row: &ReportRow) {
        self(row)
    }
}

/// Prints the table (or JSON lines) to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableSink {
    json: bool,
}

impl TableSink {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl ReportSink for TableSink {
    fn emit(&self, row: &ReportRow) {
        if !self.json {
            println!("{}", row.format());
            return;
        }

        match serde_json::to_string(row) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to encode report row for {}: {}", row.id, e),
        }
    }

    fn header(&self, mode: Mode) {
        if !self.json {
            println!("{}", format_header(mode));
        }
    }
}

/// Collects rows in memory, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<ReportRow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row emitted so far.
    pub fn rows(&self) -> Vec<ReportRow> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, row: &ReportRow) {
        self.rows.lock().push(row.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rate_is_megabits_per_second() {
        // 1,000,000 bytes in 1 s = 8 Mbps
        assert_eq!(rate_mbps(1_000_000, 1.0), 8.0);
        assert_eq!(rate_mbps(5_000, 0.0), 0.0);
    }

    #[test]
    fn test_unit_does_not_change_rate() {
        let mb = ReportRow::final_row("a", Duration::from_secs(1), 3_000, Unit::Megabytes);
        let b = ReportRow::final_row("a", Duration::from_secs(1), 3_000, Unit::Bytes);
        assert_eq!(mb.rate_mbps, b.rate_mbps);
        assert_eq!(mb.bytes, b.bytes);
        assert_eq!(b.amount(), 3000.0);
        assert_eq!(mb.amount(), 0.003);
    }

    #[test]
    fn test_interval_row_uses_window() {
        let window = IntervalWindow {
            start: Duration::from_secs(2),
            end: Duration::from_secs(3),
            bytes: 125_000,
        };
        let row = ReportRow::interval("10.0.0.1:4000", window, Unit::Kilobytes);
        assert_eq!(row.kind, RowKind::Interval);
        assert_eq!(row.start_secs, 2.0);
        assert_eq!(row.end_secs, 3.0);
        assert_eq!(row.rate_mbps, 1.0);
    }

    #[test]
    fn test_row_format() {
        let row = ReportRow::final_row(
            "127.0.0.1:40000",
            Duration::from_millis(1000),
            5000,
            Unit::Bytes,
        );
        let line = row.format();
        assert_eq!(
            line.len(),
            ID_WIDTH + INTERVAL_WIDTH + AMOUNT_WIDTH + RATE_WIDTH + 3 * COLUMN_GAP.len()
        );
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields, vec!["127.0.0.1:40000", "0.0-1.0", "5000.00B", "0.04", "Mbps"]);
    }

    #[test]
    fn test_wide_amount_keeps_columns_apart() {
        // 1.5 GB in one second shown in bytes fills the amount column.
        let row = ReportRow::final_row(
            "127.0.0.1:40000",
            Duration::from_secs(1),
            1_500_000_000,
            Unit::Bytes,
        );
        let fields: Vec<String> = row.format().split_whitespace().map(String::from).collect();
        assert_eq!(
            fields,
            vec!["127.0.0.1:40000", "0.0-1.0", "1500000000.00B", "12000.00", "Mbps"]
        );
    }

    #[test]
    fn test_headers_per_role() {
        let server: Vec<String> = format_header(Mode::Server)
            .split_whitespace()
            .map(String::from)
            .collect();
        assert_eq!(server, vec!["ID", "Interval", "Received", "Rate"]);

        let client = format_header(Mode::Client);
        assert!(client.contains("Transfer"));
        assert!(client.ends_with("Bandwidth"));
        assert_eq!(
            client.len(),
            ID_WIDTH + INTERVAL_WIDTH + AMOUNT_WIDTH + RATE_WIDTH + 3 * COLUMN_GAP.len()
        );
    }

    #[test]
    fn test_row_json() {
        let row = ReportRow::final_row("h:1", Duration::from_secs(1), 1000, Unit::Kilobytes);
        let value: serde_json::Value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["kind"], "final");
        assert_eq!(value["unit"], "KB");
        assert_eq!(value["bytes"], 1000);
    }

    #[test]
    fn test_memory_sink_and_closure_sink() {
        let sink = MemorySink::new();
        let row = ReportRow::final_row("x", Duration::from_secs(1), 1, Unit::Bytes);
        sink.emit(&row);
        sink.emit(&row);
        assert_eq!(sink.len(), 2);

        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let closure = move |_: &ReportRow| *counter.lock() += 1;
        closure.emit(&row);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn test_fairness_known_values() {
        // Two competing flows on a shared bottleneck.
        let jfi = jain_fairness_index(&[26.26, 18.52]).unwrap();
        assert!((jfi - 0.971).abs() < 1e-3);
        assert_eq!(jain_fairness_index(&[0.0, 0.0]), None);
    }

    proptest! {
        #[test]
        fn prop_fairness_bounds(rates in proptest::collection::vec(0.001f64..10_000.0, 1..16)) {
            let jfi = jain_fairness_index(&rates).unwrap();
            let n = rates.len() as f64;
            prop_assert!(jfi <= 1.0 + 1e-9);
            prop_assert!(jfi >= 1.0 / n - 1e-9);
        }
    }
}
