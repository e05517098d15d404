//! Inter-frame prediction state for the `delta` codec.
//!
//! Frames are split into `block_size × block_size` tiles; each tile is
//! compared byte-for-byte with the previous frame and only differing
//! tiles are emitted. The previous frame is the only state carried
//! between frames, so [`DeltaDetector::reset`] is enough to make the
//! next frame independent of everything before it.

use std::cmp;

use crate::video::types::Canvas;

/// Fraction of changed tiles above which a keyframe is cheaper.
const KEYFRAME_RATIO: f64 = 0.80;

// ── Block ────────────────────────────────────────────────────────

/// A rectangular region that changed since the previous frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

// ── Prediction ───────────────────────────────────────────────────

/// What the encoder has to transmit for the current frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prediction {
    /// No usable reference: send the whole frame.
    Keyframe,
    /// Send only these tiles (possibly none).
    Blocks(Vec<Block>),
}

// ── DeltaDetector ────────────────────────────────────────────────

/// Remembers the previous canvas and diffs each new one against it.
#[derive(Debug)]
pub struct DeltaDetector {
    previous: Option<Canvas>,
    block_size: u32,
}

impl DeltaDetector {
    /// Create a detector with the given tile size in pixels.
    pub fn new(block_size: u32) -> Self {
        assert!(block_size > 0, "block_size must be > 0");
        Self {
            previous: None,
            block_size,
        }
    }

    /// Forget the reference frame; the next frame becomes a keyframe.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// Whether a reference frame is held.
    pub fn has_reference(&self) -> bool {
        self.previous.is_some()
    }

    /// Diff `current` against the reference, then make it the new
    /// reference. Geometry or pixel-format changes force a keyframe.
    pub fn predict(&mut self, current: &Canvas) -> Prediction {
        let prediction = match &self.previous {
            Some(prev)
                if prev.width == current.width
                    && prev.height == current.height
                    && prev.format == current.format =>
            {
                self.diff(current, prev)
            }
            _ => Prediction::Keyframe,
        };

        // `Bytes` clone: the reference shares the producer's buffer.
        self.previous = Some(current.clone());
        prediction
    }

    // ── Internal ─────────────────────────────────────────────────

    fn diff(&self, current: &Canvas, previous: &Canvas) -> Prediction {
        let bs = self.block_size;
        let blocks_x = current.width.div_ceil(bs);
        let blocks_y = current.height.div_ceil(bs);

        let mut changed = Vec::new();
        for by in 0..blocks_y {
            for bx in 0..blocks_x {
                let x = bx * bs;
                let y = by * bs;
                let block = Block {
                    x,
                    y,
                    width: cmp::min(bs, current.width - x),
                    height: cmp::min(bs, current.height - y),
                };
                if Self::block_differs(current, previous, &block) {
                    changed.push(block);
                }
            }
        }

        let total = (blocks_x * blocks_y) as f64;
        if !changed.is_empty() && changed.len() as f64 / total > KEYFRAME_RATIO {
            Prediction::Keyframe
        } else {
            Prediction::Blocks(changed)
        }
    }

    fn block_differs(current: &Canvas, previous: &Canvas, block: &Block) -> bool {
        let bpp = current.format.bytes_per_pixel();
        let left = block.x as usize * bpp;
        let right = left + block.width as usize * bpp;

        (block.y..block.y + block.height).any(|y| {
            let cur = &current.data[y as usize * current.stride as usize..];
            let prev = &previous.data[y as usize * previous.stride as usize..];
            cur[left..right] != prev[left..right]
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::types::PixelFormat;

    fn make_canvas(w: u32, h: u32, fill: u8) -> Canvas {
        Canvas::new(w, h, PixelFormat::Bgra8, vec![fill; (w * h * 4) as usize])
    }

    #[test]
    fn first_frame_is_keyframe() {
        let mut det = DeltaDetector::new(64);
        assert_eq!(det.predict(&make_canvas(128, 128, 0)), Prediction::Keyframe);
        assert!(det.has_reference());
    }

    #[test]
    fn identical_frame_has_no_changes() {
        let mut det = DeltaDetector::new(64);
        let canvas = make_canvas(128, 128, 0xAA);
        det.predict(&canvas);
        assert_eq!(det.predict(&canvas), Prediction::Blocks(Vec::new()));
    }

    #[test]
    fn single_pixel_change_detects_block() {
        let mut det = DeltaDetector::new(64);
        det.predict(&make_canvas(128, 128, 0));

        let mut data = vec![0u8; 128 * 128 * 4];
        // Pixel (70, 10) lives in tile (1, 0).
        data[(10 * 128 + 70) * 4] = 0xFF;
        let changed = Canvas::new(128, 128, PixelFormat::Bgra8, data);

        assert_eq!(
            det.predict(&changed),
            Prediction::Blocks(vec![Block {
                x: 64,
                y: 0,
                width: 64,
                height: 64
            }])
        );
    }

    #[test]
    fn edge_tiles_are_clipped() {
        let mut det = DeltaDetector::new(64);
        det.predict(&make_canvas(100, 70, 0));

        let mut data = vec![0u8; 100 * 70 * 4];
        let last = data.len() - 1;
        data[last] = 1;
        let changed = Canvas::new(100, 70, PixelFormat::Bgra8, data);

        match det.predict(&changed) {
            Prediction::Blocks(blocks) => {
                assert_eq!(blocks, vec![Block { x: 64, y: 64, width: 36, height: 6 }]);
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn full_change_collapses_to_keyframe() {
        let mut det = DeltaDetector::new(64);
        det.predict(&make_canvas(128, 128, 0));
        assert_eq!(det.predict(&make_canvas(128, 128, 0xFF)), Prediction::Keyframe);
    }

    #[test]
    fn resolution_change_is_keyframe() {
        let mut det = DeltaDetector::new(64);
        det.predict(&make_canvas(64, 64, 0));
        assert_eq!(det.predict(&make_canvas(128, 64, 0)), Prediction::Keyframe);
    }

    #[test]
    fn reset_forces_keyframe() {
        let mut det = DeltaDetector::new(64);
        let canvas = make_canvas(64, 64, 0);
        det.predict(&canvas);
        det.reset();
        assert!(!det.has_reference());
        assert_eq!(det.predict(&canvas), Prediction::Keyframe);
    }
}
