//! # vbridge-core
//!
//! Core library for adaptive video streaming sessions.
//!
//! This crate contains:
//! - **Sessions**: `VideoContext` pulls frames from a `FrameSource`, encodes
//!   them and delivers them to a `TransportSink`; `VideoServer` owns many
//! - **Rate control**: `RateController` paces frames against the measured
//!   bandwidth within configurable bitrate bounds
//! - **Codecs**: `Encoder` / `FrameDecoder` for lossless, image and delta formats
//! - **Transport**: `UdpSink` / `UdpReceiver` with MTU-sized chunking
//! - **Error**: typed, `thiserror`-based errors with the numeric result codes
//!   callers see

pub mod error;
pub mod video;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::{
    BridgeError, ConfigError, DecodeError, EncodeError, SourceError, TransportError, status_code,
};
pub use video::{
    Canvas, CloseReason, ContextConfig, ContextStats, EncodedFrame, EncodedPayload, Encoder,
    FrameDecoder, FrameSource, NextFrame, PixelFormat, RateController, RateTuning, Received,
    SessionState, TransportSink, UdpReceiver, UdpSink, VideoContext, VideoErrorKind, VideoFormat,
    VideoServer, VideoSettings,
};
