use crate::config::{Config, Mode};
use crate::interval_reporter::{run_reporter_task, IntervalReporter};
use crate::report::{ReportSink, TableSink};
use crate::transfer::{run_receiver, Connection, StreamOutcome};
use crate::{Error, Result};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Throughput measurement server.
///
/// The `Server` listens for incoming connections and runs an independent
/// receive loop for each one, reporting one final row per connection that
/// completes the handshake. At most `max_connections` loops run at once;
/// further clients wait in the listen backlog until a slot frees up.
///
/// # Examples
///
/// ```no_run
/// use simpleperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind(Config::server(8088)).await?;
/// println!("Listening on {}", server.local_addr()?);
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    listener: TcpListener,
    sink: Arc<dyn ReportSink>,
    slots: Arc<Semaphore>,
    cancellation_token: CancellationToken,
}

impl Server {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the address cannot be bound. Nothing
    /// else has been started at that point.
    pub async fn bind(config: Config) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.bind_addr, config.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::Connection(format!("cannot bind {}: {}", bind_addr, e)))?;

        let slots = Arc::new(Semaphore::new(config.max_connections.max(1)));
        let sink: Arc<dyn ReportSink> = Arc::new(TableSink::new(config.json));

        Ok(Self {
            config,
            listener,
            sink,
            slots,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Replaces the default stdout table with another sink.
    pub fn with_sink<K: ReportSink + 'static>(mut self, sink: K) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Address the server is actually listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop and every connection it started.
    ///
    /// The command line never cancels; embedders and tests do.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Accepts connections until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if `accept` fails. Errors inside a single connection
    /// are logged and never stop the server.
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            listener,
            sink,
            slots,
            cancellation_token,
        } = self;

        info!(
            "A simpleperf server is listening on port {}",
            listener.local_addr()?.port()
        );

        let (reporter, receiver) = IntervalReporter::new();
        let reporter_task = tokio::spawn(run_reporter_task(receiver, Mode::Server, sink));
        let config = Arc::new(config);

        let result = loop {
            let permit = tokio::select! {
                _ = cancellation_token.cancelled() => break Ok(()),
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let (stream, addr) = tokio::select! {
                _ = cancellation_token.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        break Err(e.into());
                    }
                },
            };

            let config = config.clone();
            let reporter = reporter.clone();
            let cancel = cancellation_token.child_token();

            tokio::spawn(async move {
                match handle_connection(stream, &config, &reporter, &cancel).await {
                    Ok(outcome) => debug!("Connection {} finished: {:?}", addr, outcome),
                    Err(e) => error!("Error handling client {}: {}", addr, e),
                }
                drop(permit);
            });
        };

        reporter.complete();
        if let Err(e) = reporter_task.await {
            error!("Report task failed: {}", e);
        }
        result
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: &Config,
    reporter: &IntervalReporter,
    cancel: &CancellationToken,
) -> Result<StreamOutcome> {
    let connection = Connection::from_tcp(stream)?;
    info!(
        "A simpleperf client with {} is connected with {}",
        connection.peer_addr(),
        connection.local_addr()
    );
    run_receiver(connection, config, reporter, cancel).await
}
