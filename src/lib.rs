//! simpleperf - point-to-point TCP throughput measurement
//!
//! A server accepts connections and counts what it receives; a client opens
//! one to five parallel streams and sends fixed-size chunks until a time or
//! byte limit is reached. Each stream ends with a two-token completion
//! handshake (`BYE` / `ACK: BYE`) so that both sides agree the transfer
//! finished before a final report row is produced.
//!
//! # Features
//!
//! - Time-bound or byte-bound transfers
//! - Periodic interval rows on the sending side
//! - Up to five parallel streams, each with its own counters
//! - Length-prefixed framing, with a raw legacy format for compatibility
//! - Table or JSON-lines output
//! - Asynchronous I/O using tokio

pub mod client;
pub mod config;
pub mod counter;
pub mod error;
pub mod interval_reporter;
pub mod protocol;
pub mod report;
pub mod server;
pub mod termination;
pub mod transfer;
pub mod units;

pub use client::{Client, SessionSummary};
pub use config::{Config, Mode, TransferLimit};
pub use error::{Error, Result};
pub use protocol::WireFormat;
pub use report::{ReportRow, ReportSink};
pub use server::Server;
pub use transfer::StreamOutcome;
pub use units::Unit;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
