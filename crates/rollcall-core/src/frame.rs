//! Grayscale frame type, dark-frame detection and fixed-size face crops.

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Pixels below this level count as unlit.
pub const DARK_LEVEL: u8 = 32;
/// Unlit share above which a frame carries no usable face signal.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// A captured grayscale frame (one byte per pixel, row-major).
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawFrame")]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Deserialize)]
struct RawFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl TryFrom<RawFrame> for Frame {
    type Error = FrameError;

    fn try_from(raw: RawFrame) -> Result<Self, Self::Error> {
        Frame::new(raw.data, raw.width, raw.height)
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data, width, height })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Share of pixels below [`DARK_LEVEL`]; an empty frame is fully dark.
    pub fn dark_fraction(&self) -> f32 {
        if self.data.is_empty() {
            return 1.0;
        }
        let unlit = self.data.iter().filter(|&&p| p < DARK_LEVEL).count();
        unlit as f32 / self.data.len() as f32
    }

    /// Covered lens or lights out; liveness skips these frames.
    pub fn is_dark(&self) -> bool {
        self.dark_fraction() > DARK_FRAME_THRESHOLD
    }

    /// Resample the region under `bbox` into a `size`×`size` crop.
    ///
    /// Nearest-neighbour sampling; coordinates are clamped to the frame.
    /// Returns `None` when the box lies entirely outside the frame.
    pub fn crop(&self, bbox: &crate::types::BoundingBox, size: usize) -> Option<FaceCrop> {
        let w = self.width as f32;
        let h = self.height as f32;
        let x0 = bbox.x.max(0.0);
        let y0 = bbox.y.max(0.0);
        let x1 = (bbox.x + bbox.width).min(w);
        let y1 = (bbox.y + bbox.height).min(h);
        if size == 0 || x1 <= x0 || y1 <= y0 {
            return None;
        }

        let step_x = (x1 - x0) / size as f32;
        let step_y = (y1 - y0) / size as f32;
        let mut pixels = Vec::with_capacity(size * size);
        for row in 0..size {
            let sy = ((y0 + (row as f32 + 0.5) * step_y) as usize).min(self.height as usize - 1);
            for col in 0..size {
                let sx = ((x0 + (col as f32 + 0.5) * step_x) as usize).min(self.width as usize - 1);
                pixels.push(self.data[sy * self.width as usize + sx]);
            }
        }

        Some(FaceCrop { pixels, size })
    }
}

/// Square grayscale sample of a face region.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    pixels: Vec<u8>,
    size: usize,
}

impl FaceCrop {
    pub fn from_pixels(pixels: Vec<u8>, size: usize) -> Option<Self> {
        (size > 0 && pixels.len() == size * size).then_some(Self { pixels, size })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.size + x]
    }

    /// Mean absolute per-pixel difference to another crop of the same size.
    pub fn mean_abs_diff(&self, other: &FaceCrop) -> Option<f32> {
        if self.size != other.size {
            return None;
        }
        let total: u32 = self
            .pixels
            .iter()
            .zip(&other.pixels)
            .map(|(&a, &b)| a.abs_diff(b) as u32)
            .sum();
        Some(total as f32 / self.pixels.len() as f32)
    }

    /// SHA-256 hex digest of the crop, used as a source image reference.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.size as u32).to_le_bytes());
        hasher.update(&self.pixels);
        format!("{:x}", hasher.finalize())
    }
}
