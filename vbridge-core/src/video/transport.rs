//! UDP transport for session payloads and signals.
//!
//! [`UdpSink`] implements [`TransportSink`]: each payload becomes a
//! header datagram followed by MTU-sized chunks, and progress, error and
//! close signals travel as single datagrams. [`UdpReceiver`] is the
//! client half and reassembles payloads.
//!
//! ## Wire format
//!
//! Every datagram is one `bincode`-serialised [`Datagram`]. A payload's
//! chunks carry the concatenation `frame bytes ‖ data bytes`; the header
//! gives both lengths so the receiver can split them again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::video::encoder::{EncodedFrame, EncodedPayload};
use crate::video::traits::TransportSink;
use crate::video::types::{CloseReason, PixelFormat};

// ── Constants ────────────────────────────────────────────────────

/// Maximum transmission unit minus IP (20) + UDP (8) headers.
pub const DEFAULT_MTU: usize = 1400;

/// Room reserved for the serialised `Chunk` envelope.
const CHUNK_OVERHEAD: usize = 32;

const MIN_MTU: usize = CHUNK_OVERHEAD + 64;

const RECV_BUFFER: usize = 64 * 1024;

/// Largest payload body a receiver accepts.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

// ── Datagram ─────────────────────────────────────────────────────

/// Frame metadata carried in a payload header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame_number: u64,
    /// Canonical format string, e.g. `"delta"`.
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub keyframe: bool,
    pub block_count: u32,
}

/// First datagram of every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeader {
    pub sequence: u32,
    pub frame: Option<FrameMeta>,
    pub frame_len: u32,
    /// `None` when the payload carries no data buffer.
    pub data_len: Option<u32>,
    pub total_chunks: u32,
}

/// Everything that travels between sink and receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datagram {
    Header(PayloadHeader),
    Chunk {
        sequence: u32,
        index: u32,
        bytes: Bytes,
    },
    Progress {
        value: f64,
        area: String,
        message: String,
    },
    Error {
        code: i32,
        message: String,
    },
    Closed(CloseReason),
}

// ── UdpSink ──────────────────────────────────────────────────────

/// Server half: sends everything to one remote address.
pub struct UdpSink {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    sequence: AtomicU32,
    mtu: usize,
    /// Total bytes put on the wire (for diagnostics).
    bytes_sent: AtomicU64,
}

impl UdpSink {
    /// Wrap an already-bound socket targeting `remote_addr`.
    pub fn new(socket: UdpSocket, remote_addr: SocketAddr) -> Self {
        Self {
            socket,
            remote_addr,
            sequence: AtomicU32::new(0),
            mtu: DEFAULT_MTU,
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Override the effective MTU.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu.max(MIN_MTU);
        self
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn send_datagram(&self, datagram: &Datagram) -> Result<(), TransportError> {
        let buf = bincode::serialize(datagram)?;
        self.socket
            .send_to(&buf, self.remote_addr)
            .await
            .map_err(map_io)?;
        self.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TransportSink for UdpSink {
    async fn send(&self, payload: &EncodedPayload) -> Result<(), TransportError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let frame_bytes = payload.frame.as_ref().map(|f| f.data.clone()).unwrap_or_default();
        let data_bytes = payload.data.clone().unwrap_or_default();

        let mut body = Vec::with_capacity(frame_bytes.len() + data_bytes.len());
        body.extend_from_slice(&frame_bytes);
        body.extend_from_slice(&data_bytes);
        let body = Bytes::from(body);

        let chunk_max = self.mtu - CHUNK_OVERHEAD;
        let header = PayloadHeader {
            sequence,
            frame: payload.frame.as_ref().map(frame_meta),
            frame_len: frame_bytes.len() as u32,
            data_len: payload.data.as_ref().map(|d| d.len() as u32),
            total_chunks: body.len().div_ceil(chunk_max) as u32,
        };
        self.send_datagram(&Datagram::Header(header)).await?;

        let mut start = 0;
        let mut index = 0u32;
        while start < body.len() {
            let end = (start + chunk_max).min(body.len());
            self.send_datagram(&Datagram::Chunk {
                sequence,
                index,
                bytes: body.slice(start..end),
            })
            .await?;
            start = end;
            index += 1;
        }

        trace!(sequence, bytes = body.len(), chunks = index, "payload sent");
        Ok(())
    }

    async fn send_progress(
        &self,
        value: f64,
        area: &str,
        message: &str,
    ) -> Result<(), TransportError> {
        self.send_datagram(&Datagram::Progress {
            value,
            area: area.to_string(),
            message: message.to_string(),
        })
        .await
    }

    async fn send_error(&self, code: i32, message: &str) -> Result<(), TransportError> {
        self.send_datagram(&Datagram::Error {
            code,
            message: message.to_string(),
        })
        .await
    }

    async fn notify_closed(&self, reason: CloseReason) -> Result<(), TransportError> {
        self.send_datagram(&Datagram::Closed(reason)).await
    }
}

fn frame_meta(frame: &EncodedFrame) -> FrameMeta {
    FrameMeta {
        frame_number: frame.frame_number,
        format: frame.format.name().to_string(),
        width: frame.width,
        height: frame.height,
        pixel_format: frame.pixel_format,
        keyframe: frame.keyframe,
        block_count: frame.block_count,
    }
}

/// A vanished peer shows up as refused/reset on the socket.
fn map_io(e: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
            TransportError::Disconnected
        }
        _ => TransportError::Io(e),
    }
}

// ── UdpReceiver ──────────────────────────────────────────────────

/// What the client half receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Payload(EncodedPayload),
    Progress {
        value: f64,
        area: String,
        message: String,
    },
    Error {
        code: i32,
        message: String,
    },
    Closed(CloseReason),
}

struct Assembly {
    header: PayloadHeader,
    chunks: Vec<Option<Bytes>>,
    received: usize,
}

impl Assembly {
    /// Start collecting the chunks `header` announces. Headers whose
    /// lengths and chunk count do not fit together are refused.
    fn new(header: PayloadHeader) -> Result<Self, TransportError> {
        let body_len = header.frame_len as usize + header.data_len.unwrap_or(0) as usize;
        let total = header.total_chunks as usize;
        if body_len > MAX_PAYLOAD || total > body_len || (total == 0) != (body_len == 0) {
            return Err(TransportError::Encoding(format!(
                "payload {} announces {total} chunks for {body_len} bytes",
                header.sequence
            )));
        }
        Ok(Self {
            header,
            chunks: vec![None; total],
            received: 0,
        })
    }

    /// Store a chunk; returns `true` once all chunks are present.
    fn insert(&mut self, index: u32, bytes: Bytes) -> bool {
        if let Some(slot) = self.chunks.get_mut(index as usize) {
            if slot.is_none() {
                *slot = Some(bytes);
                self.received += 1;
            }
        }
        self.received == self.chunks.len()
    }

    fn finish(self) -> Result<EncodedPayload, TransportError> {
        let mut body = Vec::new();
        for chunk in self.chunks.into_iter().flatten() {
            body.extend_from_slice(&chunk);
        }
        let body = Bytes::from(body);

        let frame_len = self.header.frame_len as usize;
        let data_len = self.header.data_len.unwrap_or(0) as usize;
        if body.len() != frame_len + data_len {
            return Err(TransportError::Encoding(format!(
                "payload {} carries {} bytes, header announced {}",
                self.header.sequence,
                body.len(),
                frame_len + data_len
            )));
        }

        let frame = match self.header.frame {
            Some(meta) => Some(EncodedFrame {
                frame_number: meta.frame_number,
                format: meta
                    .format
                    .parse()
                    .map_err(|e| TransportError::Encoding(format!("{e}")))?,
                width: meta.width,
                height: meta.height,
                pixel_format: meta.pixel_format,
                keyframe: meta.keyframe,
                block_count: meta.block_count,
                data: body.slice(..frame_len),
            }),
            None => None,
        };
        let data = self.header.data_len.map(|_| body.slice(frame_len..));

        Ok(EncodedPayload { frame, data })
    }
}

/// Client half: reassembles payloads sent by a [`UdpSink`].
pub struct UdpReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
    /// Payload whose chunks are still arriving.
    assembly: Option<Assembly>,
}

impl UdpReceiver {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            buf: vec![0u8; RECV_BUFFER],
            assembly: None,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive the next complete payload or signal, in arrival order.
    ///
    /// The sink sends every chunk of a payload before anything else, so
    /// a new header or signal means the unfinished payload lost a chunk;
    /// it is dropped. Chunks of other sequences, inconsistent headers and
    /// undecodable datagrams are dropped as well. Safe to cancel: a
    /// partial payload survives until the next call.
    pub async fn recv(&mut self) -> Result<Received, TransportError> {
        loop {
            let signal = match self.next_datagram().await? {
                Datagram::Header(header) => {
                    self.abandon_partial();
                    let pending = match Assembly::new(header) {
                        Ok(pending) => pending,
                        Err(e) => {
                            debug!("dropping header: {e}");
                            continue;
                        }
                    };
                    if pending.chunks.is_empty() {
                        return pending.finish().map(Received::Payload);
                    }
                    self.assembly = Some(pending);
                    continue;
                }
                Datagram::Chunk {
                    sequence,
                    index,
                    bytes,
                } => {
                    let complete = match self.assembly.as_mut() {
                        Some(a) if a.header.sequence == sequence => a.insert(index, bytes),
                        _ => false,
                    };
                    if complete {
                        if let Some(done) = self.assembly.take() {
                            return done.finish().map(Received::Payload);
                        }
                    }
                    continue;
                }
                Datagram::Progress {
                    value,
                    area,
                    message,
                } => Received::Progress {
                    value,
                    area,
                    message,
                },
                Datagram::Error { code, message } => Received::Error { code, message },
                Datagram::Closed(reason) => Received::Closed(reason),
            };

            self.abandon_partial();
            return Ok(signal);
        }
    }

    fn abandon_partial(&mut self) {
        if let Some(partial) = self.assembly.take() {
            debug!(
                sequence = partial.header.sequence,
                received = partial.received,
                total = partial.chunks.len(),
                "dropping incomplete payload"
            );
        }
    }

    async fn next_datagram(&mut self) -> Result<Datagram, TransportError> {
        loop {
            let (len, _) = self.socket.recv_from(&mut self.buf).await.map_err(map_io)?;
            match bincode::deserialize::<Datagram>(&self.buf[..len]) {
                Ok(datagram) => return Ok(datagram),
                Err(e) => trace!("dropping undecodable datagram: {e}"),
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
