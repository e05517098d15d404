//! Streaming service core logic.
//!
//! Drives one video session over UDP with the synthetic pattern source,
//! or (in receive mode) decodes what such a session sends.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use vbridge_core::{DecodeError, FrameDecoder, Received, UdpReceiver, UdpSink, VideoServer};

use crate::config::ServerConfig;
use crate::pattern::PatternSource;

pub type ServiceResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// What a receive run saw before it stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiveSummary {
    pub payloads: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    /// Whether the server announced the end of the session.
    pub closed_by_server: bool,
}

// ── StreamService ────────────────────────────────────────────────

/// The top-level streaming service.
pub struct StreamService {
    config: ServerConfig,
    running: Arc<AtomicBool>,
}

impl StreamService {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task (e.g. a Ctrl-C handler).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stream the test pattern until stopped.
    ///
    /// 1. Binds the UDP socket and opens a session towards `remote_addr`.
    /// 2. Applies the `[video]` settings and binds the pattern source.
    /// 3. Signals a ready frame at the render rate, reporting progress
    ///    once per second.
    /// 4. Closes the session when stopped, after `duration_secs`, or
    ///    stops early if the session closes on a network error.
    pub async fn run(&self) -> ServiceResult<()> {
        self.running.store(true, Ordering::SeqCst);

        let remote: SocketAddr = self.config.network.remote_addr.parse()?;
        let socket = UdpSocket::bind(&self.config.network.bind_addr).await?;
        info!("streaming from {} to {remote}", socket.local_addr()?);

        let sink = UdpSink::new(socket, remote).with_mtu(self.config.network.mtu);
        let server = VideoServer::new(self.config.to_context_config());
        let ctx = server.create_context(Arc::new(sink));

        let video = &self.config.video;
        ctx.configure(
            &video.format,
            video.max_frame_rate,
            video.min_bitrate,
            video.max_bitrate,
        )?;
        ctx.set_render_frame_rate(video.render_frame_rate)?;

        let source = Arc::new(PatternSource::new(video.width, video.height));
        ctx.bind_source(&source);
        info!(
            session = ctx.id(),
            format = %ctx.video_format(),
            "session configured, {}x{} @ {} fps",
            video.width,
            video.height,
            video.render_frame_rate
        );

        let started = Instant::now();
        let duration = (video.duration_secs > 0).then(|| Duration::from_secs(video.duration_secs));
        let period = Duration::from_secs_f64(1.0 / video.render_frame_rate);

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut report = tokio::time::interval(Duration::from_secs(1));

        while self.is_running() && ctx.is_open() {
            tokio::select! {
                _ = ticker.tick() => ctx.notify_frame_ready(),
                _ = report.tick() => {
                    let elapsed = started.elapsed();
                    if duration.is_some_and(|d| elapsed >= d) {
                        info!("stream duration reached");
                        break;
                    }
                    let stats = ctx.stats();
                    let value = duration.map_or(0.0, |d| elapsed.as_secs_f64() / d.as_secs_f64());
                    let message = format!(
                        "{} frames, {} kbit/s",
                        stats.frames_sent,
                        stats.estimated_bandwidth / 1000
                    );
                    debug!(?stats, "progress");
                    ctx.report_progress(value, "stream", &message);
                }
                _ = Self::wait_for_stop(&self.running) => break,
            }
        }

        let stats = ctx.stats();
        if ctx.is_open() {
            server.close(ctx.id());
            // Let the delivery task flush the close notification.
            tokio::time::sleep(Duration::from_millis(50)).await;
        } else {
            warn!(session = ctx.id(), "session ended by the transport");
        }
        info!(
            frames = stats.frames_sent,
            bytes = stats.bytes_sent,
            rendered = source.frames_rendered(),
            "stream finished"
        );

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Receive, decode and log a session's output until the server
    /// closes it or the service is stopped.
    pub async fn run_receiver(&self) -> ServiceResult<ReceiveSummary> {
        self.running.store(true, Ordering::SeqCst);

        let socket = UdpSocket::bind(&self.config.network.remote_addr).await?;
        let mut receiver = UdpReceiver::new(socket);
        info!("receiving on {}", receiver.local_addr()?);

        let mut decoder = FrameDecoder::new();
        let mut summary = ReceiveSummary::default();

        while self.is_running() {
            let received = tokio::select! {
                r = receiver.recv() => r,
                _ = Self::wait_for_stop(&self.running) => break,
            };

            match received {
                Ok(Received::Payload(payload)) => {
                    summary.payloads += 1;
                    if let Some(frame) = &payload.frame {
                        match decoder.decode(frame) {
                            Ok(canvas) => {
                                summary.frames_decoded += 1;
                                debug!(
                                    frame = frame.frame_number,
                                    keyframe = frame.keyframe,
                                    blocks = frame.block_count,
                                    bytes = frame.data.len(),
                                    "decoded {}x{}",
                                    canvas.width,
                                    canvas.height
                                );
                            }
                            Err(DecodeError::MissingKeyframe) => {
                                summary.decode_errors += 1;
                                debug!(frame = frame.frame_number, "waiting for keyframe");
                            }
                            Err(e) => {
                                summary.decode_errors += 1;
                                warn!(frame = frame.frame_number, "decode failed: {e}");
                                decoder.reset();
                            }
                        }
                    }
                    if let Some(data) = &payload.data {
                        debug!("data: {}", String::from_utf8_lossy(data));
                    }
                }
                Ok(Received::Progress {
                    value,
                    area,
                    message,
                }) => info!("[{area}] {:.0}% {message}", value * 100.0),
                Ok(Received::Error { code, message }) => warn!(code, "server error: {message}"),
                Ok(Received::Closed(reason)) => {
                    info!(?reason, "session closed by server");
                    summary.closed_by_server = true;
                    break;
                }
                Err(e) => warn!("receive error: {e}"),
            }
        }

        info!(
            payloads = summary.payloads,
            decoded = summary.frames_decoded,
            errors = summary.decode_errors,
            "receiver stopped"
        );
        self.running.store(false, Ordering::SeqCst);
        Ok(summary)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
