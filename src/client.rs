use crate::config::{Config, Mode};
use crate::interval_reporter::{run_reporter_task, IntervalReporter};
use crate::report::{jain_fairness_index, ReportRow, ReportSink, TableSink};
use crate::transfer::{run_sender, Connection, StreamOutcome};
use crate::{Error, Result};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Result of a client session: one entry per stream that got as far as
/// running its transfer loop, plus the errors of those that did not.
#[derive(Debug, Default)]
pub struct SessionSummary {
    /// Outcomes in stream order
    pub streams: Vec<StreamOutcome>,
    /// Errors from streams that failed to connect or hit a transport error
    pub errors: Vec<Error>,
}

impl SessionSummary {
    /// Final rows of the streams that completed the handshake.
    pub fn final_rows(&self) -> impl Iterator<Item = &ReportRow> {
        self.streams.iter().filter_map(StreamOutcome::final_row)
    }

    pub fn completed(&self) -> usize {
        self.final_rows().count()
    }

    /// Total bytes sent by completed streams.
    pub fn total_bytes(&self) -> u64 {
        self.final_rows().map(|row| row.bytes).sum()
    }

    /// Jain's fairness index over the completed streams' rates.
    pub fn fairness_index(&self) -> Option<f64> {
        let rates: Vec<f64> = self.final_rows().map(|row| row.rate_mbps).collect();
        jain_fairness_index(&rates)
    }
}

/// Throughput measurement client.
///
/// The `Client` opens `parallel` connections to the server, drives a sender
/// loop on each concurrently and waits for all of them. Every stream has its
/// own counters and reports rows tagged with its own local endpoint.
///
/// # Examples
///
/// ## Time-bound test with interval rows
///
/// ```no_run
/// use simpleperf::{Client, Config};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 8088)
///     .with_duration(Duration::from_secs(10))
///     .with_interval(Duration::from_secs(2));
///
/// let client = Client::new(config)?;
/// let summary = client.run().await?;
/// println!("{} of {} streams completed", summary.completed(), summary.streams.len());
/// # Ok(())
/// # }
/// ```
///
/// ## Collecting rows instead of printing them
///
/// ```no_run
/// use simpleperf::report::MemorySink;
/// use simpleperf::{Client, Config};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = MemorySink::new();
/// let config = Config::client("127.0.0.1".to_string(), 8088).with_bytes(5_000);
///
/// Client::new(config)?.with_sink(sink.clone()).run().await?;
/// for row in sink.rows() {
///     println!("{} {:.2} Mbps", row.id, row.rate_mbps);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    sink: Arc<dyn ReportSink>,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration doesn't have a server address set.
    ///
    /// # Examples
    ///
    /// ```
    /// use simpleperf::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 8088);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }

        let sink: Arc<dyn ReportSink> = Arc::new(TableSink::new(config.json));
        Ok(Self {
            config,
            sink,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Replaces the default stdout table with another sink.
    pub fn with_sink<K: ReportSink + 'static>(mut self, sink: K) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it ends every stream at its next suspension point without a
    /// final row.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs every stream to completion.
    ///
    /// A stream that fails to connect does not affect its siblings.
    ///
    /// # Errors
    ///
    /// Returns the first error only when every stream failed with one, for
    /// example when nothing is listening at the target. In that case no
    /// row has been reported.
    pub async fn run(&self) -> Result<SessionSummary> {
        let server_addr = self
            .config
            .server_addr
            .as_ref()
            .ok_or_else(|| Error::Config("Server address not set".to_string()))?;
        let target = format!("{}:{}", server_addr, self.config.port);

        info!(
            "A simpleperf client connecting to server {}, port {}",
            server_addr, self.config.port
        );

        let (reporter, receiver) = IntervalReporter::new();
        let reporter_task = tokio::spawn(run_reporter_task(
            receiver,
            Mode::Client,
            self.sink.clone(),
        ));
        let config = Arc::new(self.config.clone());

        let handles: Vec<_> = (0..self.config.parallel.max(1))
            .map(|index| {
                let config = config.clone();
                let reporter = reporter.clone();
                let cancel = self.cancellation_token.child_token();
                let target = target.clone();

                tokio::spawn(async move {
                    let stream = TcpStream::connect(&target).await.map_err(|e| {
                        Error::Connection(format!("stream {} cannot connect to {}: {}", index, target, e))
                    })?;
                    let connection = Connection::from_tcp(stream)?;
                    info!(
                        "A simpleperf client with {} is connected with {}",
                        connection.local_addr(),
                        connection.peer_addr()
                    );
                    run_sender(connection, &config, &reporter, &cancel).await
                })
            })
            .collect();

        let mut summary = SessionSummary::default();
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => summary.streams.push(outcome),
                Ok(Err(e)) => {
                    error!("{}", e);
                    summary.errors.push(e);
                }
                Err(e) => {
                    error!("Stream task failed: {}", e);
                    summary.errors.push(e.into());
                }
            }
        }

        reporter.complete();
        if let Err(e) = reporter_task.await {
            error!("Report task failed: {}", e);
        }

        if summary.streams.is_empty() && !summary.errors.is_empty() {
            return Err(summary.errors.remove(0));
        }

        if let Some(index) = summary.fairness_index().filter(|_| summary.completed() > 1) {
            debug!(
                "Jain's fairness index across {} streams: {:.3}",
                summary.completed(),
                index
            );
        }

        Ok(summary)
    }
}
