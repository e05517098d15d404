//! Integration tests: session lifecycle, pull coalescing, error paths
//! and signal ordering against recording doubles, plus one run over a
//! real UDP socket pair on localhost.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_test::assert_ok;
use vbridge_core::{
    Canvas, CloseReason, ContextConfig, EncodedPayload, FrameDecoder, FrameSource, NextFrame,
    PixelFormat, Received, SessionState, SourceError, TransportError, TransportSink, UdpReceiver,
    UdpSink, VideoContext, VideoErrorKind, VideoFormat, VideoServer, status_code,
};

// ── Helpers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum SinkEvent {
    Payload(EncodedPayload),
    Progress(f64, String, String),
    Error(i32, String),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Failure {
    None,
    Disconnected,
    Flaky,
}

/// Records every successful sink call; fails payload sends on demand.
struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    sent_at: Mutex<Vec<Instant>>,
    failure: Mutex<Failure>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            failure: Mutex::new(Failure::None),
        })
    }

    fn failing(failure: Failure) -> Arc<Self> {
        let sink = Self::new();
        *sink.failure.lock() = failure;
        sink
    }

    fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    fn payloads(&self) -> Vec<EncodedPayload> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Payload(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    fn closed(&self) -> Vec<CloseReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Closed(r) => Some(*r),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TransportSink for RecordingSink {
    async fn send(&self, payload: &EncodedPayload) -> Result<(), TransportError> {
        match *self.failure.lock() {
            Failure::None => {}
            Failure::Disconnected => return Err(TransportError::Disconnected),
            Failure::Flaky => return Err(std::io::Error::other("link flaky").into()),
        }
        self.sent_at.lock().push(Instant::now());
        self.events.lock().push(SinkEvent::Payload(payload.clone()));
        Ok(())
    }

    async fn send_progress(
        &self,
        value: f64,
        area: &str,
        message: &str,
    ) -> Result<(), TransportError> {
        self.events
            .lock()
            .push(SinkEvent::Progress(value, area.into(), message.into()));
        Ok(())
    }

    async fn send_error(&self, code: i32, message: &str) -> Result<(), TransportError> {
        self.events.lock().push(SinkEvent::Error(code, message.into()));
        Ok(())
    }

    async fn notify_closed(&self, reason: CloseReason) -> Result<(), TransportError> {
        self.events.lock().push(SinkEvent::Closed(reason));
        Ok(())
    }
}

/// Frame source whose pulls block until the test releases permits.
struct GatedSource {
    gate: Semaphore,
    /// Pulls started (counted before waiting on the gate).
    requested: AtomicUsize,
    scripted: Mutex<VecDeque<NextFrame>>,
    errors: Mutex<Vec<VideoErrorKind>>,
    closed: Mutex<Vec<CloseReason>>,
}

impl GatedSource {
    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            requested: AtomicUsize::new(0),
            scripted: Mutex::new(VecDeque::new()),
            errors: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
        })
    }

    fn open() -> Arc<Self> {
        let source = Self::gated();
        source.gate.add_permits(1_000);
        source
    }

    fn script(&self, next: NextFrame) {
        self.scripted.lock().push_back(next);
    }

    fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for GatedSource {
    async fn next_frame(&self) -> Result<NextFrame, SourceError> {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|_| SourceError::from("gate closed"))?
            .forget();
        let scripted = self.scripted.lock().pop_front();
        Ok(scripted.unwrap_or_else(|| NextFrame::frame(test_canvas(16, 16))))
    }

    fn on_error(&self, kind: VideoErrorKind, _message: &str) {
        self.errors.lock().push(kind);
    }

    fn on_closed(&self, reason: CloseReason) {
        self.closed.lock().push(reason);
    }
}

fn test_canvas(w: u32, h: u32) -> Canvas {
    let data: Vec<u8> = (0..w * h * 4).map(|i| (i % 251) as u8).collect();
    Canvas::new(w, h, PixelFormat::Bgra8, data)
}

/// Poll `cond` until it holds or five seconds pass.
async fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn context(sink: &Arc<RecordingSink>) -> VideoContext {
    VideoContext::new(1, sink.clone(), ContextConfig::default())
}

// ── Pull cycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_rapid_frame_ready_signals_coalesce() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::gated();
    ctx.bind_source(&source);

    for _ in 0..5 {
        ctx.notify_frame_ready();
    }
    assert!(wait_until(|| source.requested() == 1).await);

    source.gate.add_permits(10);
    assert!(wait_until(|| sink.payloads().len() == 2).await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(source.requested(), 2);
    assert_eq!(sink.payloads().len(), 2);
    assert_eq!(ctx.stats().pulls, 2);
    assert_eq!(ctx.stats().frames_sent, 2);
}

#[tokio::test]
async fn test_data_only_payload_passes_through() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::open();
    source.script(NextFrame::data(Bytes::from_static(b"cursor=12,40")));
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 1).await);

    let payloads = sink.payloads();
    let payload = &payloads[0];
    assert!(payload.frame.is_none());
    assert_eq!(payload.data.as_deref(), Some(&b"cursor=12,40"[..]));
}

#[tokio::test]
async fn test_frames_are_paced_by_frame_rate() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    assert_ok!(ctx.configure("lossless", 10, 0, 0));
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 2).await);

    let sent = sink.sent_at.lock().clone();
    assert!(sent[1] - sent[0] >= Duration::from_millis(90));
}

#[tokio::test]
async fn test_reset_forces_keyframe() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    assert_ok!(ctx.configure("delta", 30, 0, 0));
    let source = GatedSource::open();
    ctx.bind_source(&source);

    let keyframes = || -> Vec<bool> {
        sink.payloads()
            .iter()
            .filter_map(|p| p.frame.as_ref().map(|f| f.keyframe))
            .collect()
    };

    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 1).await);
    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 2).await);
    ctx.reset();
    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 3).await);

    assert_eq!(keyframes(), vec![true, false, true]);
}

// ── Configuration ────────────────────────────────────────────────

#[tokio::test]
async fn test_inverted_bitrate_bounds_use_max() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    assert_eq!(status_code(&ctx.configure("delta", 30, 5_000_000, 1_000_000)), 0);
    assert_eq!(ctx.bit_rate(), 1_000_000);
    assert_eq!(ctx.stats().bit_rate, 1_000_000);
}

#[tokio::test]
async fn test_unsupported_format_keeps_session_usable() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    assert_eq!(status_code(&ctx.configure("mpeg9", 30, 0, 0)), -1);
    assert_eq!(ctx.state(), SessionState::Open);
    assert_eq!(ctx.video_format(), VideoFormat::Lossless);

    let source = GatedSource::open();
    ctx.bind_source(&source);
    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 1).await);
    let frame = sink.payloads()[0].frame.clone().unwrap();
    assert_eq!(frame.format, VideoFormat::Lossless);
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_twice_notifies_once() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.close();
    ctx.close();
    assert_eq!(ctx.state(), SessionState::Closed);
    assert!(wait_until(|| !sink.closed().is_empty()).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.closed(), vec![CloseReason::ByServer]);
    assert_eq!(*source.closed.lock(), vec![CloseReason::ByServer]);
}

#[tokio::test]
async fn test_frame_ready_after_close_is_ignored() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.close();
    ctx.notify_frame_ready();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(source.requested(), 0);
    assert_eq!(sink.events(), vec![SinkEvent::Closed(CloseReason::ByServer)]);
}

#[tokio::test]
async fn test_close_during_pull_discards_frame() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::gated();
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    assert!(wait_until(|| source.requested() == 1).await);
    ctx.close();
    source.gate.add_permits(1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.payloads().is_empty());
    assert_eq!(sink.closed(), vec![CloseReason::ByServer]);
}

#[tokio::test]
async fn test_remote_close_does_not_notify_peer() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.on_remote_closed(CloseReason::ByClient);
    assert_eq!(ctx.state(), SessionState::Closed);
    assert_eq!(*source.closed.lock(), vec![CloseReason::ByClient]);

    // A later server-side close is a no-op.
    ctx.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn test_detached_source_makes_signal_a_noop() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);

    let dropped = GatedSource::open();
    ctx.bind_source(&dropped);
    drop(dropped);
    assert!(ctx.video_source().is_none());
    ctx.notify_frame_ready();

    let unbound = GatedSource::open();
    ctx.bind_source(&unbound);
    ctx.unbind_source();
    ctx.notify_frame_ready();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(unbound.requested(), 0);
    assert!(sink.events().is_empty());
    assert_eq!(ctx.state(), SessionState::Open);
}

// ── Error paths ──────────────────────────────────────────────────

#[tokio::test]
async fn test_invalid_canvas_is_reported_and_session_survives() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);
    let source = GatedSource::open();
    source.script(NextFrame::frame(Canvas::new(
        4,
        4,
        PixelFormat::Bgra8,
        vec![0u8; 3],
    )));
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    assert!(wait_until(|| !source.errors.lock().is_empty()).await);
    assert_eq!(*source.errors.lock(), vec![VideoErrorKind::InvalidCanvas]);
    assert_eq!(ctx.state(), SessionState::Open);
    assert!(sink.payloads().is_empty());

    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 1).await);
    assert_eq!(ctx.stats().encode_errors, 1);
}

#[tokio::test]
async fn test_disconnected_transport_closes_session() {
    let sink = RecordingSink::failing(Failure::Disconnected);
    let ctx = context(&sink);
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    assert!(wait_until(|| ctx.state() == SessionState::Closed).await);
    assert_eq!(*source.errors.lock(), vec![VideoErrorKind::NetworkError]);
    assert_eq!(*source.closed.lock(), vec![CloseReason::NetworkError]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.closed().is_empty());
}

#[tokio::test]
async fn test_repeated_transport_failures_close_session() {
    let sink = RecordingSink::failing(Failure::Flaky);
    let config = ContextConfig {
        max_transport_failures: 3,
        ..ContextConfig::default()
    };
    let ctx = VideoContext::new(7, sink.clone(), config);
    let source = GatedSource::open();
    ctx.bind_source(&source);

    for attempt in 1..=2 {
        ctx.notify_frame_ready();
        assert!(wait_until(|| source.errors.lock().len() == attempt).await);
        assert_eq!(ctx.state(), SessionState::Open);
    }

    ctx.notify_frame_ready();
    assert!(wait_until(|| ctx.state() == SessionState::Closed).await);
    assert_eq!(source.errors.lock().len(), 3);
    assert_eq!(*source.closed.lock(), vec![CloseReason::NetworkError]);
}

#[tokio::test]
async fn test_transport_recovers_before_failure_limit() {
    let sink = RecordingSink::failing(Failure::Flaky);
    let ctx = context(&sink);
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    assert!(wait_until(|| source.errors.lock().len() == 1).await);

    *sink.failure.lock() = Failure::None;
    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 1).await);
    assert_eq!(ctx.state(), SessionState::Open);
}

#[tokio::test]
async fn test_failed_send_restarts_delta_prediction() {
    let sink = RecordingSink::failing(Failure::Flaky);
    let ctx = context(&sink);
    assert_ok!(ctx.configure("delta", 30, 0, 0));
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    assert!(wait_until(|| source.errors.lock().len() == 1).await);

    *sink.failure.lock() = Failure::None;
    ctx.notify_frame_ready();
    assert!(wait_until(|| sink.payloads().len() == 1).await);

    let frame = sink.payloads()[0].frame.clone().unwrap();
    assert!(frame.keyframe);
    let mut decoder = FrameDecoder::new();
    assert_eq!(decoder.decode(&frame).unwrap(), test_canvas(16, 16));
}

// ── Signals ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_signals_reach_sink_in_order() {
    let sink = RecordingSink::new();
    let ctx = context(&sink);

    ctx.report_progress(0.25, "load", "reading scene");
    ctx.report_error(-5, "texture missing");
    ctx.report_progress(1.0, "load", "done");
    ctx.close();
    ctx.report_progress(0.0, "load", "after close");

    assert!(wait_until(|| !sink.closed().is_empty()).await);
    assert_eq!(
        sink.events(),
        vec![
            SinkEvent::Progress(0.25, "load".into(), "reading scene".into()),
            SinkEvent::Error(-5, "texture missing".into()),
            SinkEvent::Progress(1.0, "load".into(), "done".into()),
            SinkEvent::Closed(CloseReason::ByServer),
        ]
    );
}

// ── UDP end to end ───────────────────────────────────────────────

#[tokio::test]
async fn test_udp_session_delivers_decodable_frames() {
    let recv_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut receiver = UdpReceiver::new(recv_sock);
    let remote = receiver.local_addr().unwrap();

    let send_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink = UdpSink::new(send_sock, remote).with_mtu(600);

    let server = VideoServer::new(ContextConfig::default());
    let ctx = server.create_context(Arc::new(sink));
    assert_ok!(ctx.configure("delta", 30, 0, 0));
    let source = GatedSource::open();
    ctx.bind_source(&source);

    ctx.notify_frame_ready();
    let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timeout")
        .unwrap();

    let Received::Payload(payload) = received else {
        panic!("expected a payload, got {received:?}");
    };
    let frame = payload.frame.expect("frame");
    assert!(frame.keyframe);

    let mut decoder = FrameDecoder::new();
    assert_eq!(decoder.decode(&frame).unwrap(), test_canvas(16, 16));

    assert!(server.close(ctx.id()));
    let received = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timeout")
        .unwrap();
    assert_eq!(received, Received::Closed(CloseReason::ByServer));
}
