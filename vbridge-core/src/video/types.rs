//! Shared types for the session pipeline.
//!
//! [`Canvas`] is the raw frame handed over by a frame source.
//! [`VideoFormat`] is the parsed form of the configuration format string.
//! The remaining enums carry the integer codes of the callback surface.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EncodeError};

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of a raw canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra8,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

// ── Canvas ───────────────────────────────────────────────────────

/// An uncompressed frame produced by a [`FrameSource`](crate::video::traits::FrameSource).
///
/// `data` holds `height` rows of `stride` bytes each; `stride` may be
/// larger than `width * bytes_per_pixel` when the producer pads rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Bytes,
}

impl Canvas {
    /// A tightly packed canvas (`stride == width * bpp`).
    pub fn new(width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
            data: data.into(),
        }
    }

    /// A canvas with an explicit row pitch.
    pub fn with_stride(
        width: u32,
        height: u32,
        stride: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            width,
            height,
            stride,
            format,
            data: data.into(),
        }
    }

    /// Bytes of visible pixels in one row.
    pub fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Check that the geometry is consistent with the buffer.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncodeError::InvalidCanvas(format!(
                "empty canvas {}x{}",
                self.width, self.height
            )));
        }
        if (self.stride as usize) < self.row_len() {
            return Err(EncodeError::InvalidCanvas(format!(
                "stride {} shorter than row of {} bytes",
                self.stride,
                self.row_len()
            )));
        }
        let needed = self.stride as usize * (self.height as usize - 1) + self.row_len();
        if self.data.len() < needed {
            return Err(EncodeError::InvalidCanvas(format!(
                "buffer holds {} bytes, {}x{} {:?} needs {needed}",
                self.data.len(),
                self.width,
                self.height,
                self.format
            )));
        }
        Ok(())
    }

    /// Visible bytes of row `y`, without padding.
    ///
    /// # Panics
    ///
    /// Panics if `y` is out of bounds or the canvas fails [`validate`](Self::validate).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.row_len()]
    }

    /// All rows packed tightly, padding removed.
    pub fn packed(&self) -> Vec<u8> {
        if self.stride as usize == self.row_len() {
            return self.data[..self.row_len() * self.height as usize].to_vec();
        }
        let mut out = Vec::with_capacity(self.row_len() * self.height as usize);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }
}

// ── VideoFormat ──────────────────────────────────────────────────

/// Still-image codecs; every frame is self-contained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageCodec {
    Png,
    Jpeg,
}

/// Video codecs with inter-frame prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    /// Changed-block delta against the previous frame, zstd-compressed.
    Delta,
}

/// The encoding applied to canvases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VideoFormat {
    /// zstd over raw rows; supports every pixel format.
    #[default]
    Lossless,
    Image(ImageCodec),
    Encoded(VideoCodec),
}

impl VideoFormat {
    /// Canonical format string.
    pub fn name(&self) -> &'static str {
        match self {
            VideoFormat::Lossless => "lossless",
            VideoFormat::Image(ImageCodec::Png) => "png",
            VideoFormat::Image(ImageCodec::Jpeg) => "jpeg",
            VideoFormat::Encoded(VideoCodec::Delta) => "delta",
        }
    }

    /// Whether frame pacing and quality follow the bitrate settings.
    /// Lossless and image formats are governed by the frame rate only.
    pub fn is_bitrate_controlled(&self) -> bool {
        matches!(self, VideoFormat::Encoded(_))
    }

    /// Whether the encoder keeps state between frames.
    pub fn is_stateful(&self) -> bool {
        matches!(self, VideoFormat::Encoded(_))
    }
}

impl FromStr for VideoFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lossless" => Ok(VideoFormat::Lossless),
            "png" => Ok(VideoFormat::Image(ImageCodec::Png)),
            "jpeg" | "jpg" => Ok(VideoFormat::Image(ImageCodec::Jpeg)),
            "delta" => Ok(VideoFormat::Encoded(VideoCodec::Delta)),
            _ => Err(ConfigError::UnsupportedFormat(s.to_string())),
        }
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Callback codes ───────────────────────────────────────────────

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    ByServer,
    ByClient,
    NetworkError,
}

impl CloseReason {
    /// `0` by server, `1` by client, `-1` network error.
    pub const fn code(self) -> i32 {
        match self {
            CloseReason::ByServer => 0,
            CloseReason::ByClient => 1,
            CloseReason::NetworkError => -1,
        }
    }
}

/// Failure class reported to the frame source for the last frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoErrorKind {
    /// The canvas has unsupported features or does not fit the settings.
    InvalidCanvas,
    /// Lost connection to the client.
    NetworkError,
    /// The frame could not be encoded.
    EncodingFailure,
}

impl VideoErrorKind {
    pub const fn code(self) -> i32 {
        match self {
            VideoErrorKind::InvalidCanvas => -1,
            VideoErrorKind::NetworkError => -3,
            VideoErrorKind::EncodingFailure => -4,
        }
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// Session lifecycle.
///
/// ```text
///  Open ──close()──► Closing ──► Closed
///    │                             ▲
///    └──── remote close / network ─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}
