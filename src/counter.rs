//! Per-connection byte and time accounting.
//!
//! A [`TransferCounter`] is owned by exactly one connection loop. It does no
//! I/O; every time-dependent method takes the current instant so callers
//! read the clock once per iteration.

use std::time::Duration;
use tokio::time::Instant;

/// A closed interval window, expressed as offsets from the session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalWindow {
    pub start: Duration,
    pub end: Duration,
    pub bytes: u64,
}

/// Cumulative and interval byte counts for one connection.
///
/// # Examples
///
/// ```
/// use simpleperf::counter::TransferCounter;
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// let start = Instant::now();
/// let mut counter = TransferCounter::start(start);
/// counter.record(1000);
/// counter.record(1000);
///
/// let window = counter
///     .flush_interval(start + Duration::from_secs(1), Duration::from_secs(1))
///     .unwrap();
/// assert_eq!(window.bytes, 2000);
/// assert_eq!(counter.total_bytes(), 2000);
/// assert_eq!(counter.interval_bytes(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransferCounter {
    total_bytes: u64,
    interval_bytes: u64,
    started_at: Instant,
    boundary: Instant,
}

impl TransferCounter {
    /// Starts a counter whose session and first interval begin at `now`.
    pub fn start(now: Instant) -> Self {
        Self {
            total_bytes: 0,
            interval_bytes: 0,
            started_at: now,
            boundary: now,
        }
    }

    /// Adds `bytes` to both the cumulative and the interval count.
    pub fn record(&mut self, bytes: usize) {
        let bytes = bytes as u64;
        self.total_bytes += bytes;
        self.interval_bytes += bytes;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes recorded since the last interval flush.
    pub fn interval_bytes(&self) -> u64 {
        self.interval_bytes
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since the session started.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Offset of the current interval boundary from the session start.
    pub fn boundary_offset(&self) -> Duration {
        self.boundary.saturating_duration_since(self.started_at)
    }

    /// Whether at least one full interval has passed since the last boundary.
    pub fn interval_due(&self, now: Instant, interval: Duration) -> bool {
        !interval.is_zero() && now.saturating_duration_since(self.boundary) >= interval
    }

    /// Closes every whole interval that has elapsed and resets the interval count.
    ///
    /// The boundary advances by whole multiples of `interval` so windows stay
    /// on the `i, 2i, 3i, ...` grid even when a check runs late. When several
    /// intervals passed since the last flush they are merged into one window.
    /// Returns `None` if no interval is due.
    pub fn flush_interval(&mut self, now: Instant, interval: Duration) -> Option<IntervalWindow> {
        if !self.interval_due(now, interval) {
            return None;
        }

        let behind = now.saturating_duration_since(self.boundary);
        let whole = (behind.as_nanos() / interval.as_nanos()).min(u32::MAX as u128) as u32;

        let start = self.boundary_offset();
        self.boundary += interval * whole;
        let window = IntervalWindow {
            start,
            end: self.boundary_offset(),
            bytes: self.interval_bytes,
        };
        self.interval_bytes = 0;
        Some(window)
    }
}
