//! Domain-specific error types for the vbridge session core.
//!
//! Configuration calls return [`ConfigError`], which also maps onto the
//! integer result codes existing callers expect (see [`status_code`]).
//! Encoder, decoder, transport and source failures each have their own
//! enum so the session can route them to the right callback.

use std::time::Duration;
use thiserror::Error;

use crate::video::types::VideoErrorKind;

// ── ConfigError ──────────────────────────────────────────────────

/// A rejected configuration call. The session is left unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// The format string is not one of the recognised formats.
    #[error("unsupported video format: {0:?}")]
    UnsupportedFormat(String),

    /// A numeric setting is outside its valid range.
    #[error("invalid {field}: {reason}")]
    InvalidRange {
        field: &'static str,
        reason: &'static str,
    },
}

impl ConfigError {
    /// Result code: `-1` unsupported format, `<= -2` any other failure.
    pub fn code(&self) -> i32 {
        match self {
            ConfigError::UnsupportedFormat(_) => -1,
            ConfigError::InvalidRange { .. } => -2,
        }
    }
}

/// Collapse a configuration result into the integer code surface
/// (`0` success, `-1` unsupported format, `<= -2` other failure).
pub fn status_code(result: &Result<(), ConfigError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

// ── EncodeError ──────────────────────────────────────────────────

/// Failure to turn a canvas into a wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Unsupported pixel layout, or a canvas incompatible with the
    /// current settings.
    #[error("invalid canvas: {0}")]
    InvalidCanvas(String),

    /// The codec itself failed.
    #[error("encoding failed: {0}")]
    EncodingFailure(String),
}

impl EncodeError {
    /// The error kind reported to the frame source.
    pub fn kind(&self) -> VideoErrorKind {
        match self {
            EncodeError::InvalidCanvas(_) => VideoErrorKind::InvalidCanvas,
            EncodeError::EncodingFailure(_) => VideoErrorKind::EncodingFailure,
        }
    }
}

// ── DecodeError ──────────────────────────────────────────────────

/// Failure to reconstruct a canvas on the receiving side.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload ended before a complete structure could be read.
    #[error("truncated payload: {0}")]
    Truncated(&'static str),

    /// A delta frame arrived before any keyframe.
    #[error("delta frame without a preceding keyframe")]
    MissingKeyframe,

    /// Decompression or image decoding failed.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

// ── TransportError ───────────────────────────────────────────────

/// Failure reported by a [`TransportSink`](crate::video::traits::TransportSink).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote peer is gone.
    #[error("peer disconnected")]
    Disconnected,

    /// The outbound queue was torn down.
    #[error("channel closed")]
    ChannelClosed,

    /// A sink call exceeded the transport timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The socket layer reported an error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram could not be serialised or parsed.
    #[error("wire encoding error: {0}")]
    Encoding(String),
}

impl TransportError {
    /// Fatal errors close the session immediately; the others only
    /// after repeated consecutive failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::ChannelClosed)
    }
}

impl From<Box<bincode::ErrorKind>> for TransportError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TransportError::Encoding(e.to_string())
    }
}

// ── SourceError ──────────────────────────────────────────────────

/// A frame source could not produce the requested frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("frame source failed: {0}")]
pub struct SourceError(pub String);

impl From<&str> for SourceError {
    fn from(s: &str) -> Self {
        SourceError(s.to_string())
    }
}

// ── BridgeError ──────────────────────────────────────────────────

/// Umbrella error for callers that do not need to distinguish layers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
