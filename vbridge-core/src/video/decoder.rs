//! Receiver-side frame decoder.
//!
//! Reconstructs a [`Canvas`] from each [`EncodedFrame`]. Lossless and
//! image frames stand alone; delta frames patch a persistent buffer and
//! therefore need a keyframe first (after a decoder reset or a
//! geometry change).

use bytes::Bytes;

use crate::error::DecodeError;
use crate::video::encoder::EncodedFrame;
use crate::video::types::{Canvas, PixelFormat, VideoFormat};

/// Stateful decoder mirroring one session's encoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Packed pixels of the last reconstructed delta-codec frame.
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    pixel_format: Option<PixelFormat>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the reference frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pixel_format = None;
    }

    pub fn decode(&mut self, frame: &EncodedFrame) -> Result<Canvas, DecodeError> {
        match frame.format {
            VideoFormat::Lossless => {
                let pixels = decompress(&frame.data)?;
                packed_canvas(frame.width, frame.height, frame.pixel_format, pixels)
            }
            VideoFormat::Image(_) => {
                let rgba = image::load_from_memory(&frame.data)
                    .map_err(|e| DecodeError::Decompress(e.to_string()))?
                    .to_rgba8();
                let (w, h) = rgba.dimensions();
                Ok(Canvas::new(w, h, PixelFormat::Rgba8, rgba.into_raw()))
            }
            VideoFormat::Encoded(_) => self.decode_delta(frame),
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn decode_delta(&mut self, frame: &EncodedFrame) -> Result<Canvas, DecodeError> {
        let raw = decompress(&frame.data)?;

        if frame.keyframe {
            let canvas = packed_canvas(frame.width, frame.height, frame.pixel_format, raw)?;
            self.buffer = canvas.data.to_vec();
            self.width = frame.width;
            self.height = frame.height;
            self.pixel_format = Some(frame.pixel_format);
            return Ok(canvas);
        }

        if self.pixel_format != Some(frame.pixel_format)
            || self.width != frame.width
            || self.height != frame.height
        {
            return Err(DecodeError::MissingKeyframe);
        }

        self.apply_blocks(&raw, frame.pixel_format.bytes_per_pixel())?;
        Ok(Canvas::new(
            self.width,
            self.height,
            frame.pixel_format,
            Bytes::copy_from_slice(&self.buffer),
        ))
    }

    fn apply_blocks(&mut self, data: &[u8], bpp: usize) -> Result<(), DecodeError> {
        let count = read_u32(data, 0)?;
        let row_stride = self.width as usize * bpp;
        let mut offset = 4;

        for _ in 0..count {
            let x = read_u32(data, offset)?;
            let y = read_u32(data, offset + 4)?;
            let w = read_u32(data, offset + 8)?;
            let h = read_u32(data, offset + 12)?;
            offset += 16;

            if x.saturating_add(w) > self.width || y.saturating_add(h) > self.height {
                return Err(DecodeError::Truncated("block outside frame"));
            }

            let len = w as usize * bpp;
            for row in 0..h as usize {
                let src = data
                    .get(offset..offset + len)
                    .ok_or(DecodeError::Truncated("block pixels"))?;
                let dst = (y as usize + row) * row_stride + x as usize * bpp;
                self.buffer[dst..dst + len].copy_from_slice(src);
                offset += len;
            }
        }
        Ok(())
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    zstd::decode_all(data).map_err(|e| DecodeError::Decompress(format!("zstd: {e}")))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, DecodeError> {
    match data.get(offset..offset + 4) {
        Some(&[a, b, c, d]) => Ok(u32::from_le_bytes([a, b, c, d])),
        _ => Err(DecodeError::Truncated("block header")),
    }
}

fn packed_canvas(
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
) -> Result<Canvas, DecodeError> {
    let expected = width as usize * height as usize * format.bytes_per_pixel();
    if pixels.len() != expected {
        return Err(DecodeError::Truncated("frame pixels"));
    }
    Ok(Canvas::new(width, height, format, pixels))
}
