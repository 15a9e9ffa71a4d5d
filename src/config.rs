use crate::protocol::{WireFormat, CHUNK_SIZE};
use crate::units::Unit;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default port shared by server and client.
pub const DEFAULT_PORT: u16 = 8088;

/// Upper bound on parallel client streams.
pub const MAX_PARALLEL: usize = 5;

/// Default bound on concurrently served connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Client test length when neither a duration nor a byte target is given.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);

/// Test mode: client or server.
///
/// Determines whether this instance acts as a server (listening for connections
/// and measuring inbound traffic) or as a client (driving outbound traffic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Server mode - listens for incoming connections
    Server,
    /// Client mode - connects to a server and sends data
    Client,
}

/// How a client transfer ends.
///
/// Exactly one limit is active per client session. It is fixed when the
/// session starts and never re-evaluated mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferLimit {
    /// Send until this much time has elapsed since the stream started
    Duration(Duration),
    /// Send until at least this many bytes have been accepted by the transport
    Bytes(u64),
}

/// Configuration for simpleperf sessions.
///
/// This structure holds all parameters for both client and server modes.
/// Use the builder pattern methods to customize the configuration.
///
/// # Examples
///
/// ## Time-bound client
///
/// ```
/// use simpleperf::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 8088)
///     .with_duration(Duration::from_secs(30))
///     .with_interval(Duration::from_secs(5));
/// ```
///
/// ## Byte-bound client with parallel streams
///
/// ```
/// use simpleperf::{Config, TransferLimit};
///
/// let config = Config::client("192.168.1.100".to_string(), 8088)
///     .with_bytes(10_000_000)
///     .with_parallel(3);
///
/// assert_eq!(config.limit, Some(TransferLimit::Bytes(10_000_000)));
/// ```
///
/// ## Server
///
/// ```
/// use simpleperf::Config;
///
/// let config = Config::server(8088);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Port number to listen on or connect to
    pub port: u16,

    /// Server address (for client mode)
    pub server_addr: Option<String>,

    /// Bind address (for server mode)
    pub bind_addr: IpAddr,

    /// Unit used when displaying transferred amounts
    pub unit: Unit,

    /// Termination limit for client streams; servers have none
    pub limit: Option<TransferLimit>,

    /// Interval for periodic reports (client only)
    pub interval: Option<Duration>,

    /// Number of parallel streams
    pub parallel: usize,

    /// Size of each data chunk in bytes
    pub chunk_size: usize,

    /// Framing used on the wire
    pub wire_format: WireFormat,

    /// Emit report rows as JSON lines
    pub json: bool,

    /// Maximum number of connections the server handles at once
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            unit: Unit::Megabytes,
            limit: Some(TransferLimit::Duration(DEFAULT_DURATION)),
            interval: None,
            parallel: 1,
            chunk_size: CHUNK_SIZE,
            wire_format: WireFormat::Framed,
            json: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    ///
    /// # Examples
    ///
    /// ```
    /// use simpleperf::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.port, 8088);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server configuration listening on `port`.
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            limit: None,
            ..Default::default()
        }
    }

    /// Creates a new client configuration targeting `server_addr:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use simpleperf::Config;
    ///
    /// let config = Config::client("10.0.0.2".to_string(), 8088);
    /// assert_eq!(config.server_addr.as_deref(), Some("10.0.0.2"));
    /// ```
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    /// Sets the address the server binds to.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Makes the session time-bound. Replaces any byte target.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.limit = Some(TransferLimit::Duration(duration));
        self
    }

    /// Makes the session byte-bound. Replaces any duration.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.limit = Some(TransferLimit::Bytes(bytes));
        self
    }

    /// Enables interval reporting on the sender side.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Sets the number of parallel streams.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the display unit for report rows.
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Sets the size of each data chunk.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Selects the wire format. Both ends must agree.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Enables or disables JSON-lines output.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Sets how many connections the server serves concurrently.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Checks the configuration against the limits the command line accepts.
    ///
    /// The coordinators never call this; it exists so front ends can reject
    /// bad input before any socket is opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated constraint.
    ///
    /// # Examples
    ///
    /// ```
    /// use simpleperf::Config;
    ///
    /// assert!(Config::client("127.0.0.1".to_string(), 8088).validate().is_ok());
    /// assert!(Config::client("127.0.0.1".to_string(), 80).validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<()> {
        if self.port < 1024 {
            return Err(Error::Config(format!(
                "port {} is outside 1024-65535",
                self.port
            )));
        }

        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".to_string()));
        }

        match self.mode {
            Mode::Server => {
                if self.max_connections == 0 {
                    return Err(Error::Config(
                        "max connections must be at least 1".to_string(),
                    ));
                }

                if self.limit.is_some() {
                    return Err(Error::Config(
                        "duration and byte target apply to the client only".to_string(),
                    ));
                }
            }
            Mode::Client => {
                match self.server_addr.as_deref() {
                    None | Some("") => {
                        return Err(Error::Config(
                            "Server address is required for client mode".to_string(),
                        ))
                    }
                    Some(_) => {}
                }

                if !(1..=MAX_PARALLEL).contains(&self.parallel) {
                    return Err(Error::Config(format!(
                        "parallel streams must be between 1 and {}, got {}",
                        MAX_PARALLEL, self.parallel
                    )));
                }

                match self.limit {
                    None => {
                        return Err(Error::Config(
                            "client needs a duration or a byte target".to_string(),
                        ))
                    }
                    Some(TransferLimit::Duration(d)) if d < Duration::from_secs(1) => {
                        return Err(Error::Config(
                            "duration must be at least 1 second".to_string(),
                        ))
                    }
                    Some(TransferLimit::Bytes(0)) => {
                        return Err(Error::Config("byte target must be positive".to_string()))
                    }
                    _ => {}
                }

                if let Some(interval) = self.interval {
                    if interval < Duration::from_secs(1) {
                        return Err(Error::Config(
                            "interval must be at least 1 second".to_string(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}
