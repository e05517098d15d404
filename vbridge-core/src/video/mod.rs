//! # Video sessions
//!
//! Server side of an adaptive frame-streaming session: the application
//! signals that a frame is ready, the session pulls it from a
//! [`FrameSource`], encodes it and hands it to a [`TransportSink`],
//! pacing sends against the measured bandwidth.
//!
//! ## Architecture
//!
//! ```text
//! SERVER                                        CLIENT
//! ┌──────────────────────────┐                 ┌──────────────────────┐
//! │ FrameSource::next_frame  │                 │ UdpReceiver::recv    │
//! │   ↓                      │                 │   ↓                  │
//! │ RateController (pacing)  │      UDP        │ FrameDecoder         │
//! │   ↓                      │ ──────────►     │   ↓                  │
//! │ Encoder (+DeltaDetector) │                 │ application          │
//! │   ↓                      │                 │                      │
//! │ TransportSink (UdpSink)  │                 │                      │
//! └──────────────────────────┘                 └──────────────────────┘
//! ```
//!
//! ## Sub-modules
//!
//! | Module       | Purpose                                              |
//! |--------------|------------------------------------------------------|
//! | `types`      | Canvas, formats, close reasons and session states    |
//! | `rate`       | Frame pacing and bitrate adaptation                  |
//! | `delta`      | Tile-level change detection between frames           |
//! | `encoder`    | Per-session encoder for every output format          |
//! | `decoder`    | Client-side reconstruction of encoded frames         |
//! | `traits`     | `FrameSource` / `TransportSink` capabilities         |
//! | `context`    | `VideoContext`, one streaming session                |
//! | `server`     | Registry handing out context ids                     |
//! | `transport`  | UDP sink and receiver with chunked framing           |

pub mod context;
pub mod decoder;
pub mod delta;
pub mod encoder;
pub mod rate;
pub mod server;
pub mod traits;
pub mod transport;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────

pub use context::{ContextConfig, ContextStats, VideoContext, VideoSettings};
pub use decoder::FrameDecoder;
pub use delta::{Block, DeltaDetector, Prediction};
pub use encoder::{EncodeSettings, EncodedFrame, EncodedPayload, Encoder};
pub use rate::{RateController, RateTuning};
pub use server::VideoServer;
pub use traits::{FrameSource, NextFrame, TransportSink};
pub use transport::{DEFAULT_MTU, Datagram, Received, UdpReceiver, UdpSink};
pub use types::{
    Canvas, CloseReason, ImageCodec, PixelFormat, SessionState, VideoCodec, VideoErrorKind,
    VideoFormat,
};
