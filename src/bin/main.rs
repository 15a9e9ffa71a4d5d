use clap::{ArgGroup, Parser};
use simpleperf::units::parse_byte_count;
use simpleperf::{Client, Config, Server, Unit, WireFormat};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "simpleperf")]
#[command(about = "Point-to-point TCP throughput measurement", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("role").required(true).args(["server", "client"])))]
struct Cli {
    /// Run in server mode
    #[arg(short, long)]
    server: bool,

    /// Run in client mode
    #[arg(short, long)]
    client: bool,

    /// Address the server binds to
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Server address the client connects to
    #[arg(short = 'I', long = "serverip", default_value = "127.0.0.1")]
    server_ip: String,

    /// Port to listen on or connect to
    #[arg(short, long, default_value_t = simpleperf::config::DEFAULT_PORT)]
    port: u16,

    /// Unit for reported amounts: B, KB or MB
    #[arg(short, long, default_value = "MB")]
    format: Unit,

    /// Test duration in seconds
    #[arg(short, long, default_value = "10", conflicts_with = "num")]
    time: u64,

    /// Bytes to send instead of a duration, e.g. 5000B, 10KB, 1MB
    #[arg(short, long, value_parser = parse_num)]
    num: Option<u64>,

    /// Interval for periodic reports in seconds
    #[arg(short, long)]
    interval: Option<u64>,

    /// Number of parallel streams (1-5)
    #[arg(short = 'P', long, default_value = "1")]
    parallel: usize,

    /// Output rows as JSON lines
    #[arg(long)]
    json: bool,

    /// Use the raw substring handshake instead of framed messages
    #[arg(long)]
    legacy: bool,

    /// Connections the server serves at once
    #[arg(long, default_value_t = simpleperf::config::DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

fn parse_num(input: &str) -> Result<u64, String> {
    parse_byte_count(input).map_err(|e| e.to_string())
}

impl Cli {
    fn config(&self) -> Config {
        let format = if self.legacy {
            WireFormat::Legacy
        } else {
            WireFormat::Framed
        };

        let config = if self.server {
            Config::server(self.port)
                .with_bind_addr(self.bind)
                .with_max_connections(self.max_connections)
        } else {
            let mut config =
                Config::client(self.server_ip.clone(), self.port).with_parallel(self.parallel);
            config = match self.num {
                Some(bytes) => config.with_bytes(bytes),
                None => config.with_duration(Duration::from_secs(self.time)),
            };
            if let Some(secs) = self.interval {
                config = config.with_interval(Duration::from_secs(secs));
            }
            config
        };

        config
            .with_unit(self.format)
            .with_wire_format(format)
            .with_json(self.json)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();
    config.validate()?;

    if cli.server {
        let server = Server::bind(config).await?;
        server.run().await?;
        return Ok(());
    }

    let parallel = config.parallel;
    let json = config.json;
    let client = Client::new(config)?;
    let summary = client.run().await?;

    if parallel > 1 {
        if let Some(index) = summary.fairness_index() {
            if json {
                println!("{}", serde_json::json!({ "jfi": index }));
            } else {
                println!("JFI: {:.3}", index);
            }
        }
    }

    Ok(())
}
