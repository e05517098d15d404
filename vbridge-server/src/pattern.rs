//! Synthetic frame source: a gradient that scrolls one step per frame,
//! with a small square bouncing across it so delta frames stay small.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, warn};

use vbridge_core::{
    Canvas, CloseReason, FrameSource, NextFrame, PixelFormat, SourceError, VideoErrorKind,
};

const SQUARE: u32 = 32;

/// Test-pattern producer bound to one session.
pub struct PatternSource {
    width: u32,
    height: u32,
    frame: AtomicU64,
    closed: AtomicBool,
}

impl PatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(SQUARE),
            height: height.max(SQUARE),
            frame: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether the session told us it closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    /// Render frame `n` as BGRA.
    pub fn render(&self, n: u64) -> Canvas {
        let (w, h) = (self.width, self.height);
        let mut data = vec![0u8; w as usize * h as usize * 4];

        let shift = (n % 256) as u32;
        let span_x = (w - SQUARE) as u64;
        let span_y = (h - SQUARE) as u64;
        let sq_x = bounce(n * 3, span_x) as u32;
        let sq_y = bounce(n * 2, span_y) as u32;

        for (y, row) in data.chunks_exact_mut(w as usize * 4).enumerate() {
            let y = y as u32;
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let x = x as u32;
                let inside =
                    (sq_x..sq_x + SQUARE).contains(&x) && (sq_y..sq_y + SQUARE).contains(&y);
                if inside {
                    px.copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
                } else {
                    px[0] = ((x + shift) * 255 / w) as u8;
                    px[1] = (y * 255 / h) as u8;
                    px[2] = 0x40;
                    px[3] = 0xFF;
                }
            }
        }

        Canvas::new(w, h, PixelFormat::Bgra8, data)
    }
}

/// Position along `0..=span` for a value bouncing back and forth.
fn bounce(t: u64, span: u64) -> u64 {
    if span == 0 {
        return 0;
    }
    let period = span * 2;
    let p = t % period;
    if p <= span { p } else { period - p }
}

#[async_trait]
impl FrameSource for PatternSource {
    async fn next_frame(&self) -> Result<NextFrame, SourceError> {
        if self.is_closed() {
            return Err(SourceError::from("pattern source closed"));
        }
        let n = self.frame.fetch_add(1, Ordering::Relaxed);
        Ok(NextFrame {
            frame: Some(self.render(n)),
            data: Some(Bytes::from(format!("frame={n}"))),
        })
    }

    fn on_error(&self, kind: VideoErrorKind, message: &str) {
        warn!(code = kind.code(), "session reported {kind:?}: {message}");
    }

    fn on_closed(&self, reason: CloseReason) {
        info!(?reason, "session closed");
        self.closed.store(true, Ordering::SeqCst);
    }
}
