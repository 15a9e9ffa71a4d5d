//! Decides when a sending loop stops.

use crate::config::TransferLimit;
use crate::counter::TransferCounter;
use std::time::Duration;
use tokio::time::Instant;

/// Termination rule for a sender, fixed for the lifetime of a stream.
///
/// # Examples
///
/// ```
/// use simpleperf::counter::TransferCounter;
/// use simpleperf::termination::TerminationPolicy;
/// use tokio::time::Instant;
///
/// let now = Instant::now();
/// let mut counter = TransferCounter::start(now);
/// let policy = TerminationPolicy::ByteBound(2000);
///
/// counter.record(1000);
/// assert!(policy.should_continue(&counter, now));
/// counter.record(1000);
/// assert!(!policy.should_continue(&counter, now));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    /// Continue while less than this much time has elapsed
    TimeBound(Duration),
    /// Continue while fewer than this many bytes have been sent
    ByteBound(u64),
}

impl TerminationPolicy {
    pub fn should_continue(&self, counter: &TransferCounter, now: Instant) -> bool {
        match *self {
            TerminationPolicy::TimeBound(duration) => counter.elapsed(now) < duration,
            TerminationPolicy::ByteBound(target) => counter.total_bytes() < target,
        }
    }
}

impl From<TransferLimit> for TerminationPolicy {
    fn from(limit: TransferLimit) -> Self {
        match limit {
            TransferLimit::Duration(d) => TerminationPolicy::TimeBound(d),
            TransferLimit::Bytes(b) => TerminationPolicy::ByteBound(b),
        }
    }
}
