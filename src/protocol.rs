//! Wire protocol: data chunks plus the `BYE` / `ACK: BYE` completion handshake.
//!
//! Two wire formats carry the same handshake:
//!
//! - [`WireFormat::Framed`] prefixes every message with a 5-byte header
//!   (`kind: u8`, `len: u32` big-endian). Control frames carry the literal
//!   tokens as payload, so filler data can never be mistaken for `BYE`.
//! - [`WireFormat::Legacy`] is a raw byte stream. The receiver stops as soon
//!   as `BYE` appears anywhere in what it has read, which keeps it
//!   compatible with plain-socket peers that have no framing at all.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sent by the sender after its last data chunk.
pub const TERMINATION_TOKEN: &[u8] = b"BYE";

/// Sent once by the receiver after it sees [`TERMINATION_TOKEN`].
pub const ACK_TOKEN: &[u8] = b"ACK: BYE";

/// Reference chunk size in bytes.
pub const CHUNK_SIZE: usize = 1000;

/// Size of a framed message header.
pub const FRAME_HEADER_LEN: usize = 5;

/// Control frames longer than this are rejected.
pub const MAX_CONTROL_LEN: usize = 64;

/// Largest single read when waiting for the acknowledgement in legacy mode.
const LEGACY_ACK_READ: usize = 1024;

/// Framing used on a connection. Both ends must use the same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WireFormat {
    /// Length-prefixed data and control frames
    #[default]
    Framed,
    /// Raw bytes with substring token detection
    Legacy,
}

/// Frame discriminator in the framed wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0x01,
    Control = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::Control),
            other => Err(Error::Protocol(format!("unknown frame kind 0x{:02x}", other))),
        }
    }
}

/// Encodes a frame header.
///
/// # Examples
///
/// ```
/// use simpleperf::protocol::{encode_header, FrameKind};
///
/// assert_eq!(encode_header(FrameKind::Control, 3), [0x02, 0, 0, 0, 3]);
/// ```
pub fn encode_header(kind: FrameKind, len: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = kind as u8;
    header[1..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Reads one frame header. `Ok(None)` means the peer closed the stream.
async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(FrameKind, usize)>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let kind = FrameKind::try_from(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    Ok(Some((kind, len)))
}

async fn read_control<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    if len > MAX_CONTROL_LEN {
        return Err(Error::Protocol(format!(
            "control frame of {} bytes exceeds {}",
            len, MAX_CONTROL_LEN
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_control<W: AsyncWrite + Unpin>(writer: &mut W, token: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + token.len());
    frame.extend_from_slice(&encode_header(FrameKind::Control, token.len() as u32));
    frame.extend_from_slice(token);
    writer.write_all(&frame).await
}

/// Writes fixed-size filler chunks.
///
/// The encoded chunk is built once and reused for every write.
pub struct ChunkWriter {
    format: WireFormat,
    encoded: Vec<u8>,
    payload_len: usize,
}

impl ChunkWriter {
    pub fn new(format: WireFormat, chunk_size: usize) -> Self {
        let mut encoded = Vec::with_capacity(FRAME_HEADER_LEN + chunk_size);
        if format == WireFormat::Framed {
            encoded.extend_from_slice(&encode_header(FrameKind::Data, chunk_size as u32));
        }
        // Zero filler never contains the termination token.
        encoded.resize(encoded.len() + chunk_size, 0);

        Self {
            format,
            encoded,
            payload_len: chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.payload_len
    }

    /// Writes one chunk and returns the number of data bytes the transport accepted.
    pub async fn write_chunk<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<usize> {
        match self.format {
            WireFormat::Framed => {
                writer.write_all(&self.encoded).await?;
                Ok(self.payload_len)
            }
            WireFormat::Legacy => {
                let n = writer.write(&self.encoded).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ));
                }
                Ok(n)
            }
        }
    }
}

/// Sends the termination token after the last data chunk.
pub async fn send_termination<W: AsyncWrite + Unpin>(writer: &mut W, format: WireFormat) -> Result<()> {
    match format {
        WireFormat::Framed => write_control(writer, TERMINATION_TOKEN).await?,
        WireFormat::Legacy => writer.write_all(TERMINATION_TOKEN).await?,
    }
    writer.flush().await?;
    Ok(())
}

/// Sends the acknowledgement token.
pub async fn send_ack<W: AsyncWrite + Unpin>(writer: &mut W, format: WireFormat) -> Result<()> {
    match format {
        WireFormat::Framed => write_control(writer, ACK_TOKEN).await?,
        WireFormat::Legacy => writer.write_all(ACK_TOKEN).await?,
    }
    writer.flush().await?;
    Ok(())
}

/// Performs the single blocking read that follows the termination token.
///
/// Returns `true` only when the peer answered with exactly [`ACK_TOKEN`].
/// Anything else, including an orderly close, is a failed handshake.
pub async fn await_ack<R: AsyncRead + Unpin>(reader: &mut R, format: WireFormat) -> Result<bool> {
    match format {
        WireFormat::Framed => match read_header(reader).await? {
            Some((FrameKind::Control, len)) => {
                let payload = read_control(reader, len).await?;
                Ok(payload == ACK_TOKEN)
            }
            Some((FrameKind::Data, _)) | None => Ok(false),
        },
        WireFormat::Legacy => {
            let mut buf = [0u8; LEGACY_ACK_READ];
            let n = reader.read(&mut buf).await?;
            Ok(&buf[..n] == ACK_TOKEN)
        }
    }
}

/// What the receiver observed on one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Data bytes were received
    Data(usize),
    /// The termination token was seen; `preceding` data bytes arrived with it
    Termination { preceding: usize },
    /// The peer closed the stream without sending the termination token
    Closed,
}

/// Receiver-side decoder for either wire format.
///
/// # Examples
///
/// ```
/// use simpleperf::protocol::{Inbound, InboundDecoder, WireFormat};
///
/// # #[tokio::main]
/// # async fn main() -> simpleperf::Result<()> {
/// let mut wire: &[u8] = b"\0\0\0\0BYE";
/// let mut decoder = InboundDecoder::new(WireFormat::Legacy, 1000);
/// assert_eq!(decoder.next(&mut wire).await?, Inbound::Termination { preceding: 4 });
/// # Ok(())
/// # }
/// ```
pub struct InboundDecoder {
    format: WireFormat,
    buf: Vec<u8>,
    carry: Vec<u8>,
}

impl InboundDecoder {
    pub fn new(format: WireFormat, chunk_size: usize) -> Self {
        Self {
            format,
            buf: vec![0u8; chunk_size.max(1)],
            carry: Vec::with_capacity(TERMINATION_TOKEN.len()),
        }
    }

    pub async fn next<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Inbound> {
        match self.format {
            WireFormat::Framed => self.next_framed(reader).await,
            WireFormat::Legacy => self.next_legacy(reader).await,
        }
    }

    async fn next_framed<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Inbound> {
        let (kind, len) = match read_header(reader).await? {
            Some(header) => header,
            None => return Ok(Inbound::Closed),
        };

        match kind {
            FrameKind::Data => {
                let mut remaining = len;
                while remaining > 0 {
                    let step = remaining.min(self.buf.len());
                    match reader.read_exact(&mut self.buf[..step]).await {
                        Ok(_) => remaining -= step,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            return Ok(Inbound::Closed)
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(Inbound::Data(len))
            }
            FrameKind::Control => {
                let payload = read_control(reader, len).await?;
                if payload == TERMINATION_TOKEN {
                    Ok(Inbound::Termination { preceding: 0 })
                } else {
                    Err(Error::Protocol(format!(
                        "unexpected control token {:?}",
                        String::from_utf8_lossy(&payload)
                    )))
                }
            }
        }
    }

    async fn next_legacy<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Inbound> {
        let n = reader.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(Inbound::Closed);
        }

        let data = &self.buf[..n];
        let keep = TERMINATION_TOKEN.len() - 1;

        if !self.carry.is_empty() {
            let mut junction = self.carry.clone();
            junction.extend_from_slice(&data[..data.len().min(keep)]);
            if find_token(&junction).is_some() {
                return Ok(Inbound::Termination { preceding: 0 });
            }
        }

        if let Some(pos) = find_token(data) {
            return Ok(Inbound::Termination { preceding: pos });
        }

        self.carry.extend_from_slice(data);
        let excess = self.carry.len().saturating_sub(keep);
        self.carry.drain(..excess);
        Ok(Inbound::Data(n))
    }
}

fn find_token(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(TERMINATION_TOKEN.len())
        .position(|window| window == TERMINATION_TOKEN)
}
