//! Report delivery off the data path.
//!
//! Connection loops hand finished rows to an [`IntervalReporter`]; a single
//! reporter task per session writes them to the configured sink. Formatting
//! and stdout I/O never run inside a transfer loop, and rows from parallel
//! streams are written one at a time.

use crate::config::Mode;
use crate::report::{ReportRow, ReportSink};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message sent to the reporter task
///
/// # Examples
///
/// ```
/// use simpleperf::interval_reporter::ReportMessage;
///
/// let msg = ReportMessage::Complete;
///
/// match msg {
///     ReportMessage::Complete => println!("Session completed"),
///     ReportMessage::Row(_) => println!("Report row"),
/// }
/// ```
#[derive(Debug, Clone)]
pub enum ReportMessage {
    /// An interval or final row
    Row(ReportRow),
    /// Signal session completion
    Complete,
}

/// Handle for sending report rows
///
/// # Examples
///
/// ```
/// use simpleperf::interval_reporter::{IntervalReporter, ReportMessage};
/// use simpleperf::report::ReportRow;
/// use simpleperf::units::Unit;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let (reporter, mut receiver) = IntervalReporter::new();
///
///     let row = ReportRow::final_row("127.0.0.1:5000", Duration::from_secs(1), 1000, Unit::Bytes);
///     reporter.clone().report(row);
///     reporter.complete();
///
///     assert!(matches!(receiver.recv().await, Some(ReportMessage::Row(_))));
///     assert!(matches!(receiver.recv().await, Some(ReportMessage::Complete)));
/// }
/// ```
#[derive(Clone)]
pub struct IntervalReporter {
    sender: mpsc::UnboundedSender<ReportMessage>,
}

impl IntervalReporter {
    /// Creates a new reporter
    ///
    /// Returns a tuple of (reporter, receiver) where the receiver should be
    /// used to spawn the reporting task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Send a report row
    pub fn report(&self, row: ReportRow) {
        let _ = self.sender.send(ReportMessage::Row(row));
    }

    /// Signal session completion
    pub fn complete(&self) {
        let _ = self.sender.send(ReportMessage::Complete);
    }
}

/// Runs the reporter task until completion is signalled or every handle is dropped.
///
/// The sink's header is written just before the first row, so a session
/// that never produces a row prints nothing. Returns the number of rows written.
pub async fn run_reporter_task(
    mut receiver: mpsc::UnboundedReceiver<ReportMessage>,
    mode: Mode,
    sink: Arc<dyn ReportSink>,
) -> usize {
    let mut written = 0usize;

    while let Some(msg) = receiver.recv().await {
        match msg {
            ReportMessage::Row(row) => {
                if written == 0 {
                    sink.header(mode);
                }
                sink.emit(&row);
                written += 1;
            }
            ReportMessage::Complete => break,
        }
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{MemorySink, RowKind};
    use crate::units::Unit;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn row(bytes: u64) -> ReportRow {
        ReportRow::final_row("127.0.0.1:9000", Duration::from_secs(1), bytes, Unit::Bytes)
    }

    struct HeaderCounter {
        headers: Mutex<Vec<Mode>>,
        rows: Mutex<usize>,
    }

    impl ReportSink for HeaderCounter {
        fn emit(&self, _row: &ReportRow) {
            *self.rows.lock() += 1;
        }

        fn header(&self, mode: Mode) {
            self.headers.lock().push(mode);
        }
    }

    #[tokio::test]
    async fn test_reporter_report() {
        let (reporter, mut receiver) = IntervalReporter::new();
        reporter.report(row(1000));

        match receiver.recv().await.unwrap() {
            ReportMessage::Row(r) => {
                assert_eq!(r.bytes, 1000);
                assert_eq!(r.kind, RowKind::Final);
            }
            _ => panic!("Expected Row message"),
        }
    }

    #[tokio::test]
    async fn test_reporter_task_writes_in_order() {
        let (reporter, receiver) = IntervalReporter::new();
        let sink = MemorySink::new();

        for i in 0..3 {
            reporter.report(row(1000 * (i + 1)));
        }
        reporter.complete();

        let written = run_reporter_task(receiver, Mode::Client, Arc::new(sink.clone())).await;
        assert_eq!(written, 3);
        let bytes: Vec<u64> = sink.rows().iter().map(|r| r.bytes).collect();
        assert_eq!(bytes, vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn test_header_once_and_only_with_rows() {
        let sink = Arc::new(HeaderCounter {
            headers: Mutex::new(Vec::new()),
            rows: Mutex::new(0),
        });

        let (reporter, receiver) = IntervalReporter::new();
        reporter.complete();
        assert_eq!(run_reporter_task(receiver, Mode::Server, sink.clone()).await, 0);
        assert!(sink.headers.lock().is_empty());

        let (reporter, receiver) = IntervalReporter::new();
        reporter.report(row(1));
        reporter.report(row(2));
        drop(reporter);
        assert_eq!(run_reporter_task(receiver, Mode::Server, sink.clone()).await, 2);
        assert_eq!(*sink.headers.lock(), vec![Mode::Server]);
        assert_eq!(*sink.rows.lock(), 2);
    }
}
