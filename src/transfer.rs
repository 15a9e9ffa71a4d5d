//! Per-connection transfer loops.
//!
//! A [`Connection`] is moved into exactly one loop, which owns it (and its
//! [`TransferCounter`]) until it returns. The transport is released when the
//! loop's scope ends, whatever the outcome.

use crate::config::{Config, TransferLimit, DEFAULT_DURATION};
use crate::counter::TransferCounter;
use crate::interval_reporter::IntervalReporter;
use crate::protocol::{self, ChunkWriter, Inbound, InboundDecoder};
use crate::report::ReportRow;
use crate::termination::TerminationPolicy;
use crate::Result;
use log::{debug, warn};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A transport handle together with its endpoint identities.
pub struct Connection<S> {
    stream: S,
    local: SocketAddr,
    peer: SocketAddr,
}

impl<S> Connection<S> {
    pub fn new(stream: S, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            stream,
            local,
            peer,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection<TcpStream> {
    /// Wraps a connected TCP stream, capturing both endpoint addresses.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        Ok(Self::new(stream, local, peer))
    }
}

/// How a connection loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// Handshake completed; the final row was reported
    Completed(ReportRow),
    /// The acknowledgement was missing or wrong; no final row
    HandshakeFailed { id: String },
    /// The peer closed before sending the termination token; no final row
    PeerClosed { id: String },
    /// The loop's cancellation token fired; no final row
    Cancelled { id: String },
}

impl StreamOutcome {
    /// Endpoint identity the outcome belongs to.
    pub fn id(&self) -> &str {
        match self {
            StreamOutcome::Completed(row) => &row.id,
            StreamOutcome::HandshakeFailed { id }
            | StreamOutcome::PeerClosed { id }
            | StreamOutcome::Cancelled { id } => id,
        }
    }

    /// The final row, if the transfer completed.
    pub fn final_row(&self) -> Option<&ReportRow> {
        match self {
            StreamOutcome::Completed(row) => Some(row),
            _ => None,
        }
    }
}

/// Drives the sending side of one connection.
///
/// Writes chunks until the termination policy says stop, flushing interval
/// rows on the way when an interval is configured, then sends the
/// termination token and waits for the acknowledgement. Rows are tagged with
/// the local endpoint.
///
/// # Errors
///
/// Returns an error if the transport fails. Handshake failure is reported as
/// [`StreamOutcome::HandshakeFailed`], not as an error.
pub async fn run_sender<S>(
    connection: Connection<S>,
    config: &Config,
    reporter: &IntervalReporter,
    cancel: &CancellationToken,
) -> Result<StreamOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Connection {
        mut stream, local, ..
    } = connection;
    let id = local.to_string();
    let policy = TerminationPolicy::from(
        config
            .limit
            .unwrap_or(TransferLimit::Duration(DEFAULT_DURATION)),
    );
    let writer = ChunkWriter::new(config.wire_format, config.chunk_size);
    let mut counter = TransferCounter::start(Instant::now());

    loop {
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream {} cancelled while sending", id);
                return Ok(StreamOutcome::Cancelled { id });
            }
            result = writer.write_chunk(&mut stream) => result?,
        };
        counter.record(written);

        let now = Instant::now();
        if let Some(interval) = config.interval {
            if let Some(window) = counter.flush_interval(now, interval) {
                reporter.report(ReportRow::interval(id.clone(), window, config.unit));
            }
        }

        if !policy.should_continue(&counter, now) {
            break;
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Stream {} cancelled while sending the termination token", id);
            return Ok(StreamOutcome::Cancelled { id });
        }
        result = protocol::send_termination(&mut stream, config.wire_format) => result?,
    }

    let acknowledged = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Stream {} cancelled while awaiting acknowledgement", id);
            return Ok(StreamOutcome::Cancelled { id });
        }
        result = protocol::await_ack(&mut stream, config.wire_format) => result?,
    };

    if !acknowledged {
        warn!("Stream {}: handshake failed, no acknowledgement from peer", id);
        return Ok(StreamOutcome::HandshakeFailed { id });
    }

    let row = ReportRow::final_row(
        id,
        counter.elapsed(Instant::now()),
        counter.total_bytes(),
        config.unit,
    );
    reporter.report(row.clone());
    Ok(StreamOutcome::Completed(row))
}

/// Drives the receiving side of one connection.
///
/// Reads until the termination token arrives, acknowledges it exactly once
/// and reports one final row tagged with the peer endpoint. A close without
/// the token ends the loop with no acknowledgement and no row.
///
/// # Errors
///
/// Returns an error on transport failure or a malformed frame.
pub async fn run_receiver<S>(
    connection: Connection<S>,
    config: &Config,
    reporter: &IntervalReporter,
    cancel: &CancellationToken,
) -> Result<StreamOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Connection { mut stream, peer, .. } = connection;
    let id = peer.to_string();
    let mut decoder = InboundDecoder::new(config.wire_format, config.chunk_size);
    let mut counter = TransferCounter::start(Instant::now());

    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Connection {} cancelled while receiving", id);
                return Ok(StreamOutcome::Cancelled { id });
            }
            result = decoder.next(&mut stream) => result?,
        };

        match inbound {
            Inbound::Data(n) => counter.record(n),
            Inbound::Termination { preceding } => {
                counter.record(preceding);
                break;
            }
            Inbound::Closed => {
                warn!(
                    "Connection {} closed after {} bytes without completing the handshake",
                    id,
                    counter.total_bytes()
                );
                return Ok(StreamOutcome::PeerClosed { id });
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Connection {} cancelled while acknowledging", id);
            return Ok(StreamOutcome::Cancelled { id });
        }
        result = protocol::send_ack(&mut stream, config.wire_format) => result?,
    }

    let row = ReportRow::final_row(
        id,
        counter.elapsed(Instant::now()),
        counter.total_bytes(),
        config.unit,
    );
    reporter.report(row.clone());
    Ok(StreamOutcome::Completed(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval_reporter::ReportMessage;
    use crate::protocol::{encode_header, FrameKind, WireFormat, ACK_TOKEN};
    use crate::report::RowKind;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let client_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:8088".parse().unwrap();
        let (a, b) = duplex(64 * 1024);
        (
            Connection::new(a, client_addr, server_addr),
            Connection::new(b, server_addr, client_addr),
        )
    }

    fn drain(receiver: &mut UnboundedReceiver<ReportMessage>) -> Vec<ReportRow> {
        let mut rows = Vec::new();
        while let Ok(msg) = receiver.try_recv() {
            if let ReportMessage::Row(row) = msg {
                rows.push(row);
            }
        }
        rows
    }

    async fn run_pair(config: Config) -> (StreamOutcome, StreamOutcome, Vec<ReportRow>) {
        let (client, server) = pair();
        let (reporter, mut receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();

        let (sent, received) = tokio::join!(
            run_sender(client, &config, &reporter, &cancel),
            run_receiver(server, &config, &reporter, &cancel),
        );
        (sent.unwrap(), received.unwrap(), drain(&mut receiver))
    }

    #[tokio::test]
    async fn test_byte_bound_sends_minimum_chunks() {
        for format in [WireFormat::Framed, WireFormat::Legacy] {
            let config = Config::client("127.0.0.1".to_string(), 8088)
                .with_bytes(5000)
                .with_wire_format(format);
            let (sent, received, rows) = run_pair(config).await;

            let sent = sent.final_row().cloned().expect("sender should complete");
            let received = received.final_row().cloned().expect("receiver should complete");
            assert_eq!(sent.bytes, 5000, "{:?}", format);
            assert_eq!(received.bytes, 5000, "{:?}", format);
            assert_eq!(sent.id, "127.0.0.1:40001");
            assert_eq!(received.id, "127.0.0.1:40001");
            assert_eq!(rows.len(), 2);
        }
    }

    #[tokio::test]
    async fn test_byte_bound_overshoot() {
        let config = Config::client("127.0.0.1".to_string(), 8088).with_bytes(2500);
        let (sent, received, _) = run_pair(config).await;
        assert_eq!(sent.final_row().unwrap().bytes, 3000);
        assert_eq!(received.final_row().unwrap().bytes, 3000);
    }

    #[tokio::test]
    async fn test_time_bound_with_intervals() {
        let config = Config::client("127.0.0.1".to_string(), 8088)
            .with_duration(Duration::from_millis(300))
            .with_interval(Duration::from_millis(100));
        let (sent, _, rows) = run_pair(config).await;

        let total = sent.final_row().unwrap();
        assert!(total.end_secs >= 0.3);

        let intervals: Vec<&ReportRow> = rows.iter().filter(|r| r.kind == RowKind::Interval).collect();
        assert!(!intervals.is_empty() && intervals.len() <= 3);
        let flushed: u64 = intervals.iter().map(|r| r.bytes).sum();
        assert!(flushed <= total.bytes);
        for pair in intervals.windows(2) {
            assert_eq!(pair[0].end_secs, pair[1].start_secs);
        }
    }

    #[tokio::test]
    async fn test_handshake_failure_emits_no_row() {
        let (client, mut server) = pair();
        let (reporter, mut receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::client("127.0.0.1".to_string(), 8088).with_bytes(1000);

        let peer = tokio::spawn(async move {
            let mut decoder = InboundDecoder::new(WireFormat::Framed, 1000);
            while let Ok(Inbound::Data(_)) = decoder.next(&mut server.stream).await {}
            let reply = b"NOPE";
            server
                .stream
                .write_all(&encode_header(FrameKind::Control, reply.len() as u32))
                .await
                .unwrap();
            server.stream.write_all(reply).await.unwrap();
            server
        });

        let outcome = run_sender(client, &config, &reporter, &cancel).await.unwrap();
        assert_eq!(
            outcome,
            StreamOutcome::HandshakeFailed {
                id: "127.0.0.1:40001".to_string()
            }
        );
        assert!(drain(&mut receiver).is_empty());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_can_be_cancelled() {
        let (client, server) = pair();
        let (reporter, mut receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::client("127.0.0.1".to_string(), 8088).with_bytes(1000);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        // The peer never reads nor replies; hold it open until the sender returns.
        let outcome = run_sender(client, &config, &reporter, &cancel).await.unwrap();
        drop(server);

        assert!(matches!(outcome, StreamOutcome::Cancelled { .. }));
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_termination_token_is_blocked() {
        // Room for exactly one framed chunk; the peer never reads, so
        // writing the termination token cannot make progress.
        let client_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:8088".parse().unwrap();
        let (a, _b) = duplex(protocol::FRAME_HEADER_LEN + 1000);
        let client = Connection::new(a, client_addr, server_addr);

        let (reporter, mut receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::client("127.0.0.1".to_string(), 8088).with_bytes(1000);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            run_sender(client, &config, &reporter, &cancel),
        )
        .await
        .expect("sender should observe cancellation")
        .unwrap();

        assert!(matches!(outcome, StreamOutcome::Cancelled { .. }));
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_acknowledgement_is_blocked() {
        let client_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let server_addr: SocketAddr = "127.0.0.1:8088".parse().unwrap();
        let (mut a, b) = duplex(4);
        let server = Connection::new(b, server_addr, client_addr);

        // Sends the token, then holds the stream open without reading.
        let peer = tokio::spawn(async move {
            protocol::send_termination(&mut a, WireFormat::Framed)
                .await
                .unwrap();
            a
        });

        let (reporter, mut receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::server(8088);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            run_receiver(server, &config, &reporter, &cancel),
        )
        .await
        .expect("receiver should observe cancellation")
        .unwrap();

        assert!(matches!(outcome, StreamOutcome::Cancelled { .. }));
        assert!(drain(&mut receiver).is_empty());
        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_receiver_peer_closed_without_token() {
        let (mut client, server) = pair();
        let (reporter, mut receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::server(8088);

        let writer = ChunkWriter::new(WireFormat::Framed, 1000);
        writer.write_chunk(&mut client.stream).await.unwrap();
        drop(client);

        let outcome = run_receiver(server, &config, &reporter, &cancel).await.unwrap();
        assert!(matches!(outcome, StreamOutcome::PeerClosed { .. }));
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_receiver_acknowledges_exactly_once() {
        let (mut client, server) = pair();
        let (reporter, _receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::server(8088).with_wire_format(WireFormat::Legacy);

        client.stream.write_all(&[0u8; 1500]).await.unwrap();
        client.stream.write_all(b"BYE").await.unwrap();

        let outcome = run_receiver(server, &config, &reporter, &cancel).await.unwrap();
        assert_eq!(outcome.final_row().unwrap().bytes, 1500);

        // Receiver is gone: everything it wrote is exactly one acknowledgement.
        let mut reply = Vec::new();
        client.stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, ACK_TOKEN);
    }

    #[tokio::test]
    async fn test_receiver_never_acks_without_token() {
        let (mut client, server) = pair();
        let (reporter, _receiver) = IntervalReporter::new();
        let cancel = CancellationToken::new();
        let config = Config::server(8088);

        let writer = ChunkWriter::new(WireFormat::Framed, 1000);
        writer.write_chunk(&mut client.stream).await.unwrap();
        client.stream.shutdown().await.unwrap();

        let outcome = run_receiver(server, &config, &reporter, &cancel).await.unwrap();
        assert!(matches!(outcome, StreamOutcome::PeerClosed { .. }));

        let mut reply = Vec::new();
        client.stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }
}
