//! Server-side video context: one streaming session.
//!
//! A [`VideoContext`] mediates between a [`FrameSource`] and a
//! [`TransportSink`]. The application calls
//! [`notify_frame_ready`](VideoContext::notify_frame_ready) whenever it
//! has something new; the context then, on its own driver task:
//!
//! 1. waits until the [`RateController`] admits a send,
//! 2. pulls one frame from the source,
//! 3. encodes it with the current settings,
//! 4. hands the payload to the sink.
//!
//! At most one such cycle runs at a time. Signals received while a cycle
//! is in flight collapse into a single follow-up cycle.
//!
//! ## Tasks
//!
//! ```text
//!  caller threads ──notify/configure/close──► [Mutex<Session>] ──wake──► driver task
//!                                                                         │ pull / encode
//!  report_progress / report_error / close ──► outbound queue ◄── payload ─┘
//!                                                  │
//!                                            delivery task ──► TransportSink
//! ```
//!
//! Every sink call goes through the outbound queue, so the sink sees
//! signals in exactly the order the context issued them. Source pulls
//! and sink calls never run under the session lock.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, TransportError};
use crate::video::encoder::{EncodeSettings, EncodedPayload, Encoder};
use crate::video::rate::{RateController, RateTuning};
use crate::video::traits::{FrameSource, TransportSink};
use crate::video::types::{CloseReason, SessionState, VideoErrorKind, VideoFormat};

// ── ContextConfig ────────────────────────────────────────────────

/// Tunables fixed for the lifetime of a context.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Upper bound for any single sink call.
    pub transport_timeout: Duration,
    /// Consecutive non-fatal transport failures that close the session.
    pub max_transport_failures: u32,
    /// Rate-controller constants.
    pub rate: RateTuning,
    /// Quality used by the `jpeg` format.
    pub jpeg_quality: u8,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            transport_timeout: Duration::from_secs(5),
            max_transport_failures: 3,
            rate: RateTuning::default(),
            jpeg_quality: 85,
        }
    }
}

// ── VideoSettings ────────────────────────────────────────────────

/// Settings a caller may change while the session is open.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoSettings {
    pub format: VideoFormat,
    pub max_frame_rate: u32,
    pub render_frame_rate: Option<f64>,
    /// Bits per second.
    pub min_bitrate: u32,
    /// Bits per second; `0` means unlimited.
    pub max_bitrate: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            format: VideoFormat::Lossless,
            max_frame_rate: 30,
            render_frame_rate: None,
            min_bitrate: 0,
            max_bitrate: 0,
        }
    }
}

// ── ContextStats ─────────────────────────────────────────────────

/// Counters and current estimates for one context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStats {
    /// Frames requested from the source.
    pub pulls: u64,
    /// Payloads accepted by the transport.
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub encode_errors: u64,
    /// Current bitrate in bits/second (`0` when unlimited).
    pub bit_rate: u32,
    /// Estimated bandwidth in bits/second.
    pub estimated_bandwidth: u64,
    /// Smoothed time the transport takes to accept a payload.
    pub latency: Duration,
}

// ── Internal state ───────────────────────────────────────────────

enum Outbound {
    Payload(EncodedPayload, oneshot::Sender<Result<(), TransportError>>),
    Progress {
        value: f64,
        area: String,
        message: String,
    },
    Error {
        code: i32,
        message: String,
    },
    /// Tell the peer and stop delivering.
    Closed(CloseReason),
    /// Stop delivering without telling the peer.
    Shutdown,
}

/// Everything guarded by the session lock.
struct Session {
    state: SessionState,
    settings: VideoSettings,
    source: Option<Weak<dyn FrameSource>>,
    /// A pull-and-deliver cycle is running or about to run.
    in_flight: bool,
    /// Another cycle was requested while one was in flight.
    pending: bool,
    /// Bumped by `reset()`; the driver resets the encoder on change.
    reset_epoch: u64,
    rate: RateController,
    transport_failures: u32,
    stats: ContextStats,
}

impl Session {
    fn source(&self) -> Option<Arc<dyn FrameSource>> {
        self.source.as_ref().and_then(Weak::upgrade)
    }

    fn has_source(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.strong_count() > 0)
    }

    fn apply(&mut self, settings: VideoSettings) {
        self.rate.configure(
            settings.max_frame_rate,
            settings.min_bitrate,
            settings.max_bitrate,
            settings.format.is_bitrate_controlled(),
        );
        self.rate.set_render_frame_rate(settings.render_frame_rate);
        self.settings = settings;
    }
}

struct Shared {
    id: u32,
    session: Mutex<Session>,
    wake: Notify,
    outbound: mpsc::UnboundedSender<Outbound>,
    config: ContextConfig,
}

// ── VideoContext ─────────────────────────────────────────────────

/// One streaming session.
///
/// Must be created inside a Tokio runtime: construction spawns the
/// driver and delivery tasks. All methods are synchronous and cheap, and
/// may be called from any thread. Dropping the context closes it.
pub struct VideoContext {
    shared: Arc<Shared>,
}

impl VideoContext {
    pub fn new(id: u32, sink: Arc<dyn TransportSink>, config: ContextConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut session = Session {
            state: SessionState::Open,
            settings: VideoSettings::default(),
            source: None,
            in_flight: false,
            pending: false,
            reset_epoch: 0,
            rate: RateController::new(config.rate.clone()),
            transport_failures: 0,
            stats: ContextStats::default(),
        };
        session.apply(VideoSettings::default());

        let encoder = Encoder::new().with_jpeg_quality(config.jpeg_quality);
        let timeout = config.transport_timeout;
        let shared = Arc::new(Shared {
            id,
            session: Mutex::new(session),
            wake: Notify::new(),
            outbound: tx,
            config,
        });

        tokio::spawn(deliver(rx, sink, Arc::downgrade(&shared), timeout, id));
        tokio::spawn(drive(Arc::clone(&shared), encoder));

        debug!(session = id, "video context opened");
        Self { shared }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.session.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    // ── Configuration ────────────────────────────────────────────

    /// Validate and apply format, frame rate and bitrate bounds in one
    /// step. Nothing changes if any value is rejected.
    ///
    /// Best called before the first frame-ready signal or from within
    /// [`FrameSource::next_frame`]; the next cycle picks up the
    /// settings as a whole either way.
    pub fn configure(
        &self,
        format: &str,
        max_frame_rate: u32,
        min_bitrate: u32,
        max_bitrate: u32,
    ) -> Result<(), ConfigError> {
        let format: VideoFormat = format.parse()?;
        check_frame_rate(max_frame_rate)?;
        self.update(|s| {
            s.format = format;
            s.max_frame_rate = max_frame_rate;
            s.min_bitrate = min_bitrate;
            s.max_bitrate = max_bitrate;
        })
    }

    pub fn set_video_format(&self, format: &str) -> Result<(), ConfigError> {
        let format: VideoFormat = format.parse()?;
        self.update(|s| s.format = format)
    }

    pub fn set_max_frame_rate(&self, rate: u32) -> Result<(), ConfigError> {
        check_frame_rate(rate)?;
        self.update(|s| s.max_frame_rate = rate)
    }

    /// Hint about the rate the application actually renders at.
    pub fn set_render_frame_rate(&self, rate: f64) -> Result<(), ConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidRange {
                field: "render_frame_rate",
                reason: "must be a positive number",
            });
        }
        self.update(|s| s.render_frame_rate = Some(rate))
    }

    /// Pin the bitrate: same as setting both bounds to `bit_rate`.
    pub fn set_bit_rate(&self, bit_rate: u32) -> Result<(), ConfigError> {
        self.update(|s| {
            s.min_bitrate = bit_rate;
            s.max_bitrate = bit_rate;
        })
    }

    pub fn set_min_bitrate(&self, bit_rate: u32) -> Result<(), ConfigError> {
        self.update(|s| s.min_bitrate = bit_rate)
    }

    pub fn set_max_bitrate(&self, bit_rate: u32) -> Result<(), ConfigError> {
        self.update(|s| s.max_bitrate = bit_rate)
    }

    pub fn settings(&self) -> VideoSettings {
        self.shared.session.lock().settings.clone()
    }

    pub fn video_format(&self) -> VideoFormat {
        self.shared.session.lock().settings.format
    }

    pub fn max_frame_rate(&self) -> u32 {
        self.shared.session.lock().settings.max_frame_rate
    }

    pub fn render_frame_rate(&self) -> Option<f64> {
        self.shared.session.lock().settings.render_frame_rate
    }

    pub fn min_bitrate(&self) -> u32 {
        self.shared.session.lock().settings.min_bitrate
    }

    pub fn max_bitrate(&self) -> u32 {
        self.shared.session.lock().settings.max_bitrate
    }

    /// Bitrate currently used by the rate controller.
    pub fn bit_rate(&self) -> u32 {
        self.shared.session.lock().rate.bit_rate()
    }

    // ── Source binding ───────────────────────────────────────────

    /// Bind `source`, replacing any previous one. Only a weak reference
    /// is kept: once the caller drops the source it counts as detached.
    pub fn bind_source<S: FrameSource + 'static>(&self, source: &Arc<S>) {
        let weak = Arc::downgrade(source);
        let weak: Weak<dyn FrameSource> = weak;
        let mut s = self.shared.session.lock();
        if s.state == SessionState::Open {
            s.source = Some(weak);
        }
    }

    /// Detach the current source; frame-ready signals become no-ops.
    pub fn unbind_source(&self) {
        self.shared.session.lock().source = None;
    }

    pub fn video_source(&self) -> Option<Arc<dyn FrameSource>> {
        self.shared.session.lock().source()
    }

    // ── Delivery ─────────────────────────────────────────────────

    /// Ask for the next frame.
    ///
    /// Any number of calls while a pull is outstanding result in exactly
    /// one further pull once it completes.
    pub fn notify_frame_ready(&self) {
        {
            let mut s = self.shared.session.lock();
            if s.state != SessionState::Open || !s.has_source() {
                return;
            }
            if s.in_flight {
                s.pending = true;
                return;
            }
            s.in_flight = true;
        }
        self.shared.wake.notify_one();
    }

    /// Forward a progress message to the client.
    pub fn report_progress(&self, value: f64, area: &str, message: &str) {
        self.enqueue(Outbound::Progress {
            value,
            area: area.to_string(),
            message: message.to_string(),
        });
    }

    /// Forward an application error to the client.
    pub fn report_error(&self, code: i32, message: &str) {
        self.enqueue(Outbound::Error {
            code,
            message: message.to_string(),
        });
    }

    /// Drop inter-frame encoder state before the next frame.
    pub fn reset(&self) {
        let mut s = self.shared.session.lock();
        if s.state == SessionState::Open {
            s.reset_epoch += 1;
        }
    }

    pub fn stats(&self) -> ContextStats {
        let s = self.shared.session.lock();
        ContextStats {
            bit_rate: s.rate.bit_rate(),
            estimated_bandwidth: s.rate.estimated_bandwidth(),
            latency: s.rate.latency(),
            ..s.stats.clone()
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Close the session from the server side.
    ///
    /// Returns immediately; an outstanding pull may still finish but its
    /// result is discarded. Further calls are no-ops.
    pub fn close(&self) {
        let source = {
            let mut s = self.shared.session.lock();
            if s.state != SessionState::Open {
                return;
            }
            s.state = SessionState::Closing;
            s.pending = false;
            s.source()
        };

        info!(session = self.shared.id, "closing video context");
        let _ = self
            .shared
            .outbound
            .send(Outbound::Closed(CloseReason::ByServer));
        self.shared.session.lock().state = SessionState::Closed;
        self.shared.wake.notify_one();

        if let Some(source) = source {
            source.on_closed(CloseReason::ByServer);
        }
    }

    /// The transport reports that the peer went away.
    pub fn on_remote_closed(&self, reason: CloseReason) {
        let source = {
            let mut s = self.shared.session.lock();
            if s.state != SessionState::Open {
                return;
            }
            s.state = SessionState::Closed;
            s.pending = false;
            s.source()
        };

        info!(session = self.shared.id, ?reason, "video context closed by peer");
        let _ = self.shared.outbound.send(Outbound::Shutdown);
        self.shared.wake.notify_one();

        if let Some(source) = source {
            source.on_closed(reason);
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut VideoSettings),
    {
        let mut s = self.shared.session.lock();
        if s.state != SessionState::Open {
            return Ok(());
        }
        let mut next = s.settings.clone();
        change(&mut next);
        if next != s.settings {
            debug!(session = self.shared.id, settings = ?next, "settings updated");
            s.apply(next);
        }
        Ok(())
    }

    fn enqueue(&self, msg: Outbound) {
        if self.is_open() {
            let _ = self.shared.outbound.send(msg);
        }
    }
}

impl Drop for VideoContext {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_frame_rate(rate: u32) -> Result<(), ConfigError> {
    if rate == 0 {
        return Err(ConfigError::InvalidRange {
            field: "max_frame_rate",
            reason: "must be at least 1",
        });
    }
    Ok(())
}

// ── Driver task ──────────────────────────────────────────────────

/// Runs pull-and-deliver cycles until the session closes. Owns the
/// encoder, which is released when the task ends.
async fn drive(shared: Arc<Shared>, mut encoder: Encoder) {
    let mut epoch = 0u64;

    'driver: loop {
        shared.wake.notified().await;

        loop {
            {
                let s = shared.session.lock();
                if s.state != SessionState::Open {
                    break 'driver;
                }
                if !s.in_flight {
                    break;
                }
            }

            shared.run_cycle(&mut encoder, &mut epoch).await;

            let mut s = shared.session.lock();
            if s.state != SessionState::Open {
                break 'driver;
            }
            if s.pending {
                s.pending = false;
                continue;
            }
            s.in_flight = false;
            break;
        }
    }

    debug!(
        session = shared.id,
        frames = encoder.frame_count(),
        "driver stopped, encoder released"
    );
}

impl Shared {
    fn is_open(&self) -> bool {
        self.session.lock().state == SessionState::Open
    }

    async fn run_cycle(&self, encoder: &mut Encoder, epoch: &mut u64) {
        if !self.wait_for_budget().await {
            return;
        }

        let (source, settings, reset_epoch) = {
            let mut s = self.session.lock();
            if s.state != SessionState::Open {
                return;
            }
            let Some(source) = s.source() else {
                debug!(session = self.id, "no frame source bound; request dropped");
                return;
            };
            s.stats.pulls += 1;
            let settings = EncodeSettings {
                format: s.settings.format,
                bit_rate: s.rate.bit_rate(),
                frame_budget: s.rate.frame_budget_bytes(),
            };
            (source, settings, s.reset_epoch)
        };

        let next = match source.next_frame().await {
            Ok(next) => next,
            Err(e) => {
                warn!(session = self.id, "{e}; nothing sent this cycle");
                return;
            }
        };

        if !self.is_open() {
            debug!(session = self.id, "session closed during pull; frame discarded");
            return;
        }

        if reset_epoch != *epoch {
            encoder.reset();
            *epoch = reset_epoch;
        }

        let payload = match encoder.encode(next.frame.as_ref(), next.data, &settings) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = self.id, "frame rejected: {e}");
                self.session.lock().stats.encode_errors += 1;
                source.on_error(e.kind(), &e.to_string());
                return;
            }
        };
        if payload.is_empty() {
            return;
        }

        let bytes = payload.byte_len() as u64;
        let started = Instant::now();
        match self.send_payload(payload).await {
            Ok(()) => {
                let now = Instant::now();
                let mut s = self.session.lock();
                s.rate.on_sent(bytes, now - started, now);
                s.transport_failures = 0;
                s.stats.frames_sent += 1;
                s.stats.bytes_sent += bytes;
            }
            Err(e) => {
                // The peer never saw this frame; do not predict from it.
                if settings.format.is_stateful() {
                    encoder.reset();
                }
                self.transport_failed(&e);
            }
        }
    }

    /// Sleep in bounded slices until the rate controller admits a send.
    /// Returns `false` if the session closed meanwhile.
    async fn wait_for_budget(&self) -> bool {
        loop {
            let delay = {
                let s = self.session.lock();
                if s.state != SessionState::Open {
                    return false;
                }
                s.rate.delay_until(Instant::now())
            };
            if delay.is_zero() {
                return true;
            }
            tokio::time::sleep(delay.min(self.config.rate.recheck_interval)).await;
        }
    }

    async fn send_payload(&self, payload: EncodedPayload) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Payload(payload, tx))
            .map_err(|_| TransportError::ChannelClosed)?;
        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }

    /// Report a transport failure to the source and close the session if
    /// it is fatal or has repeated too often.
    fn transport_failed(&self, err: &TransportError) {
        let (source, failures, closing) = {
            let mut s = self.session.lock();
            if s.state != SessionState::Open {
                return;
            }
            s.transport_failures += 1;
            let closing =
                err.is_fatal() || s.transport_failures >= self.config.max_transport_failures;
            if closing {
                s.state = SessionState::Closed;
                s.pending = false;
            }
            (s.source(), s.transport_failures, closing)
        };

        warn!(session = self.id, failures, "transport error: {err}");
        if let Some(source) = &source {
            source.on_error(VideoErrorKind::NetworkError, &err.to_string());
        }

        if closing {
            info!(session = self.id, "closing video context after network error");
            let _ = self.outbound.send(Outbound::Shutdown);
            self.wake.notify_one();
            if let Some(source) = source {
                source.on_closed(CloseReason::NetworkError);
            }
        }
    }
}

// ── Delivery task ────────────────────────────────────────────────

/// Drains the outbound queue into the sink, one call at a time.
async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    sink: Arc<dyn TransportSink>,
    shared: Weak<Shared>,
    timeout: Duration,
    id: u32,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Payload(payload, reply) => {
                let result = bounded(timeout, sink.send(&payload)).await;
                let _ = reply.send(result);
            }
            Outbound::Progress {
                value,
                area,
                message,
            } => {
                let result = bounded(timeout, sink.send_progress(value, &area, &message)).await;
                signal_failed(&shared, result);
            }
            Outbound::Error { code, message } => {
                let result = bounded(timeout, sink.send_error(code, &message)).await;
                signal_failed(&shared, result);
            }
            Outbound::Closed(reason) => {
                if let Err(e) = bounded(timeout, sink.notify_closed(reason)).await {
                    warn!(session = id, "close notification not delivered: {e}");
                }
                break;
            }
            Outbound::Shutdown => break,
        }
    }
    debug!(session = id, "delivery task stopped");
}

fn signal_failed(shared: &Weak<Shared>, result: Result<(), TransportError>) {
    if let Err(e) = result {
        if let Some(shared) = shared.upgrade() {
            shared.transport_failed(&e);
        }
    }
}

async fn bounded<F>(limit: Duration, call: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(TransportError::Timeout(limit)))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::status_code;
    use crate::video::types::VideoCodec;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl TransportSink for NullSink {
        async fn send(&self, _: &EncodedPayload) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send_progress(&self, _: f64, _: &str, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send_error(&self, _: i32, _: &str) -> Result<(), TransportError> {
            Ok(())
        }
        async fn notify_closed(&self, _: CloseReason) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn context() -> VideoContext {
        VideoContext::new(1, Arc::new(NullSink), ContextConfig::default())
    }

    #[tokio::test]
    async fn configure_applies_all_settings() {
        let ctx = context();
        assert_eq!(status_code(&ctx.configure("delta", 24, 1_000, 8_000)), 0);
        assert_eq!(ctx.video_format(), VideoFormat::Encoded(VideoCodec::Delta));
        assert_eq!(ctx.max_frame_rate(), 24);
        assert_eq!(ctx.min_bitrate(), 1_000);
        assert_eq!(ctx.max_bitrate(), 8_000);
        assert_eq!(ctx.bit_rate(), 8_000);
    }

    #[tokio::test]
    async fn unsupported_format_leaves_settings_alone() {
        let ctx = context();
        let before = ctx.settings();
        assert_eq!(status_code(&ctx.configure("mpeg9", 60, 0, 0)), -1);
        assert_eq!(ctx.settings(), before);
        assert_eq!(ctx.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn zero_frame_rate_is_out_of_range() {
        let ctx = context();
        let result = ctx.configure("lossless", 0, 0, 0);
        assert!(status_code(&result) <= -2);
        assert_eq!(ctx.max_frame_rate(), 30);
        assert!(ctx.set_render_frame_rate(f64::NAN).is_err());
    }

    #[tokio::test]
    async fn set_bit_rate_pins_both_bounds() {
        let ctx = context();
        ctx.set_video_format("delta").unwrap();
        ctx.set_bit_rate(2_000_000).unwrap();
        assert_eq!(ctx.min_bitrate(), 2_000_000);
        assert_eq!(ctx.max_bitrate(), 2_000_000);
        assert_eq!(ctx.bit_rate(), 2_000_000);
    }

    #[tokio::test]
    async fn configuration_after_close_is_ignored() {
        let ctx = context();
        ctx.close();
        assert!(ctx.set_max_frame_rate(5).is_ok());
        assert_eq!(ctx.max_frame_rate(), 30);
        assert_eq!(ctx.state(), SessionState::Closed);
    }
}
