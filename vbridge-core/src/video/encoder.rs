//! Frame encoder.
//!
//! Turns a [`Canvas`] into an [`EncodedFrame`] according to the
//! session's current [`VideoFormat`]:
//!
//! - **lossless**: tightly packed rows → zstd. Stateless.
//! - **png / jpeg**: still-image codecs from the `image` crate. Stateless.
//! - **delta**: keyframe or changed tiles (see [`DeltaDetector`]) → zstd.
//!   Stateful; the zstd level adapts to the per-frame byte budget.
//!
//! Raw data buffers travel next to the frame untouched.
//!
//! ## Delta layout (before compression)
//!
//! Keyframes carry the packed rows. Delta frames carry
//! ```text
//! block_count: u32
//! repeat block_count times:
//!   x, y, width, height: u32 (little-endian)
//!   pixels: width * height * bpp bytes, packed rows
//! ```

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tracing::debug;

use crate::error::EncodeError;
use crate::video::delta::{Block, DeltaDetector, Prediction};
use crate::video::types::{Canvas, ImageCodec, PixelFormat, VideoCodec, VideoFormat};

const BLOCK_SIZE: u32 = 64;
const LOSSLESS_LEVEL: i32 = 1;
const DEFAULT_DELTA_LEVEL: i32 = 1;
const MAX_DELTA_LEVEL: i32 = 9;
const DEFAULT_JPEG_QUALITY: u8 = 85;

// ── EncodedFrame / EncodedPayload ────────────────────────────────

/// A compressed frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Sequential number assigned by the encoder.
    pub frame_number: u64,
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    /// Pixel layout of the source canvas.
    pub pixel_format: PixelFormat,
    /// Decodable without any earlier frame.
    pub keyframe: bool,
    /// Changed tiles in a delta frame, `0` otherwise.
    pub block_count: u32,
    pub data: Bytes,
}

/// What one delivery cycle hands to the transport. Neither part set
/// means nothing is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedPayload {
    pub frame: Option<EncodedFrame>,
    pub data: Option<Bytes>,
}

impl EncodedPayload {
    pub fn is_empty(&self) -> bool {
        self.frame.is_none() && self.data.is_none()
    }

    /// Bytes on the wire, excluding transport framing.
    pub fn byte_len(&self) -> usize {
        self.frame.as_ref().map_or(0, |f| f.data.len()) + self.data.as_ref().map_or(0, Bytes::len)
    }
}

/// Per-frame settings snapshot taken by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSettings {
    pub format: VideoFormat,
    /// Current bitrate in bits/second (`0` when unlimited).
    pub bit_rate: u32,
    /// Target size of one encoded frame, if the bitrate is limited.
    pub frame_budget: Option<usize>,
}

impl EncodeSettings {
    pub fn new(format: VideoFormat) -> Self {
        Self {
            format,
            bit_rate: 0,
            frame_budget: None,
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────

/// Stateful encoder owned by one session.
#[derive(Debug)]
pub struct Encoder {
    format: Option<VideoFormat>,
    delta: DeltaDetector,
    compression_level: i32,
    jpeg_quality: u8,
    frame_count: u64,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            format: None,
            delta: DeltaDetector::new(BLOCK_SIZE),
            compression_level: DEFAULT_DELTA_LEVEL,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            frame_count: 0,
        }
    }

    /// Override the JPEG quality (1..=100).
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Drop all inter-frame state. The next delta frame is a keyframe.
    pub fn reset(&mut self) {
        self.delta.reset();
        self.compression_level = DEFAULT_DELTA_LEVEL;
    }

    /// Format of the last encode call.
    pub fn current_format(&self) -> Option<VideoFormat> {
        self.format
    }

    /// Current zstd level of the delta codec.
    pub fn compression_level(&self) -> i32 {
        self.compression_level
    }

    /// Number of canvases encoded so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Encode one cycle's output. A format different from the previous
    /// call resets the encoder first.
    pub fn encode(
        &mut self,
        frame: Option<&Canvas>,
        data: Option<Bytes>,
        settings: &EncodeSettings,
    ) -> Result<EncodedPayload, EncodeError> {
        if self.format != Some(settings.format) {
            if let Some(previous) = self.format {
                debug!("format switch {previous} → {}: resetting encoder", settings.format);
            }
            self.reset();
            self.format = Some(settings.format);
        }

        let frame = match frame {
            Some(canvas) => Some(self.encode_canvas(canvas, settings)?),
            None => None,
        };

        Ok(EncodedPayload { frame, data })
    }

    // ── Internal encoding helpers ────────────────────────────────

    fn encode_canvas(
        &mut self,
        canvas: &Canvas,
        settings: &EncodeSettings,
    ) -> Result<EncodedFrame, EncodeError> {
        canvas.validate()?;

        let (data, keyframe, block_count) = match settings.format {
            VideoFormat::Lossless => (compress(&canvas.packed(), LOSSLESS_LEVEL)?, true, 0),
            VideoFormat::Image(codec) => (encode_image(canvas, codec, self.jpeg_quality)?, true, 0),
            VideoFormat::Encoded(VideoCodec::Delta) => {
                self.encode_delta(canvas, settings.frame_budget)?
            }
        };

        let frame_number = self.frame_count;
        self.frame_count += 1;

        Ok(EncodedFrame {
            frame_number,
            format: settings.format,
            width: canvas.width,
            height: canvas.height,
            pixel_format: canvas.format,
            keyframe,
            block_count,
            data: Bytes::from(data),
        })
    }

    fn encode_delta(
        &mut self,
        canvas: &Canvas,
        budget: Option<usize>,
    ) -> Result<(Vec<u8>, bool, u32), EncodeError> {
        let (raw, keyframe, block_count) = match self.delta.predict(canvas) {
            Prediction::Keyframe => (canvas.packed(), true, 0),
            Prediction::Blocks(blocks) => {
                let count = blocks.len() as u32;
                (pack_blocks(&blocks, canvas), false, count)
            }
        };

        let compressed = match compress(&raw, self.compression_level) {
            Ok(c) => c,
            Err(e) => {
                // The receiver never saw this frame; do not predict from it.
                self.delta.reset();
                return Err(e);
            }
        };

        if let Some(budget) = budget {
            self.adjust_level(compressed.len(), budget);
        }

        Ok((compressed, keyframe, block_count))
    }

    /// Over budget → compress harder; under 80 % → back off.
    fn adjust_level(&mut self, size: usize, budget: usize) {
        if size > budget {
            self.compression_level = (self.compression_level + 1).min(MAX_DELTA_LEVEL);
        } else if size < budget * 8 / 10 {
            self.compression_level = (self.compression_level - 1).max(DEFAULT_DELTA_LEVEL);
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn compress(raw: &[u8], level: i32) -> Result<Vec<u8>, EncodeError> {
    zstd::encode_all(raw, level)
        .map_err(|e| EncodeError::EncodingFailure(format!("zstd encode failed: {e}")))
}

fn pack_blocks(blocks: &[Block], canvas: &Canvas) -> Vec<u8> {
    let bpp = canvas.format.bytes_per_pixel();
    let mut out = Vec::new();
    out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());

    for block in blocks {
        out.extend_from_slice(&block.x.to_le_bytes());
        out.extend_from_slice(&block.y.to_le_bytes());
        out.extend_from_slice(&block.width.to_le_bytes());
        out.extend_from_slice(&block.height.to_le_bytes());

        let left = block.x as usize * bpp;
        let len = block.width as usize * bpp;
        for y in block.y..block.y + block.height {
            let offset = y as usize * canvas.stride as usize + left;
            out.extend_from_slice(&canvas.data[offset..offset + len]);
        }
    }
    out
}

fn encode_image(canvas: &Canvas, codec: ImageCodec, jpeg_quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    let (w, h) = (canvas.width, canvas.height);

    let result = match codec {
        ImageCodec::Png => {
            let (pixels, color) = match canvas.format {
                PixelFormat::Rgba8 => (canvas.packed(), ExtendedColorType::Rgba8),
                PixelFormat::Bgra8 => (bgra_to_rgba(canvas.packed()), ExtendedColorType::Rgba8),
                PixelFormat::Rgb8 => (canvas.packed(), ExtendedColorType::Rgb8),
            };
            PngEncoder::new(&mut out).write_image(&pixels, w, h, color)
        }
        ImageCodec::Jpeg => {
            let pixels = to_rgb(canvas);
            JpegEncoder::new_with_quality(&mut out, jpeg_quality).write_image(
                &pixels,
                w,
                h,
                ExtendedColorType::Rgb8,
            )
        }
    };

    result.map_err(|e| EncodeError::EncodingFailure(format!("{codec:?} encode failed: {e}")))?;
    Ok(out)
}

fn bgra_to_rgba(mut pixels: Vec<u8>) -> Vec<u8> {
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
    }
    pixels
}

/// JPEG has no alpha channel.
fn to_rgb(canvas: &Canvas) -> Vec<u8> {
    let packed = canvas.packed();
    match canvas.format {
        PixelFormat::Rgb8 => packed,
        PixelFormat::Rgba8 => packed.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect(),
        PixelFormat::Bgra8 => packed.chunks_exact(4).flat_map(|p| [p[2], p[1], p[0]]).collect(),
    }
}

// ── Tests ────────────────────────────────────────────────────────
