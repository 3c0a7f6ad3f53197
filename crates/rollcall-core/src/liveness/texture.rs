//! Texture heuristics for flat reproductions (prints, screens).
//!
//! Skin under real lighting has fine local contrast and a wide tonal range.
//! Re-photographed prints and displays tend to lose both. Three cheap
//! measurements are combined into a score in [0, 1]:
//!
//! - mean variance of 4×4 pixel blocks,
//! - number of occupied tonal bins,
//! - density of sharp neighbour transitions.

use serde::{Deserialize, Serialize};

use crate::frame::FaceCrop;
use crate::vector;

const BLOCK: usize = 4;
const TONAL_BINS: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureConfig {
    /// Score at or below this marks the crop as a suspected spoof.
    pub spoof_threshold: f32,
    /// Block variance treated as full local contrast.
    pub variance_full_scale: f32,
    /// Occupied tonal bins treated as a full palette.
    pub palette_full_scale: usize,
    /// Neighbour difference that counts as a sharp transition.
    pub edge_step: u8,
    /// Transition density treated as full micro-texture.
    pub edge_density_full_scale: f32,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self {
            spoof_threshold: 0.35,
            variance_full_scale: 100.0,
            palette_full_scale: 24,
            edge_step: 8,
            edge_density_full_scale: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureReport {
    pub local_variance: f32,
    pub palette_cardinality: usize,
    pub micro_pattern_density: f32,
    pub score: f32,
    pub spoof_suspected: bool,
}

fn mean_block_variance(crop: &FaceCrop) -> f32 {
    let size = crop.size();
    let block = BLOCK.min(size);
    let mut variances = Vec::new();
    let mut values = Vec::with_capacity(block * block);
    for by in (0..=size - block).step_by(block) {
        for bx in (0..=size - block).step_by(block) {
            values.clear();
            for y in by..by + block {
                for x in bx..bx + block {
                    values.push(crop.pixel(x, y) as f32);
                }
            }
            if let Some(v) = vector::variance(&values) {
                variances.push(v);
            }
        }
    }
    vector::mean_scalar(&variances).unwrap_or(0.0)
}

fn palette_cardinality(crop: &FaceCrop) -> usize {
    let shift = 256 / TONAL_BINS;
    let mut bins = [false; TONAL_BINS];
    for &p in crop.pixels() {
        bins[p as usize / shift] = true;
    }
    bins.iter().filter(|&&b| b).count()
}

fn edge_density(crop: &FaceCrop, step: u8) -> f32 {
    let size = crop.size();
    if size < 2 {
        return 0.0;
    }
    let mut edges = 0usize;
    let mut pairs = 0usize;
    for y in 0..size {
        for x in 0..size - 1 {
            pairs += 1;
            if crop.pixel(x, y).abs_diff(crop.pixel(x + 1, y)) >= step {
                edges += 1;
            }
        }
    }
    edges as f32 / pairs as f32
}

pub fn analyze_texture(crop: &FaceCrop, config: &TextureConfig) -> TextureReport {
    let local_variance = mean_block_variance(crop);
    let palette = palette_cardinality(crop);
    let micro_pattern_density = edge_density(crop, config.edge_step);

    let variance_term = (local_variance / config.variance_full_scale.max(f32::EPSILON)).min(1.0);
    let palette_term = (palette as f32 / config.palette_full_scale.max(1) as f32).min(1.0);
    let micro_term =
        (micro_pattern_density / config.edge_density_full_scale.max(f32::EPSILON)).min(1.0);
    let score = 0.4 * variance_term + 0.3 * palette_term + 0.3 * micro_term;

    TextureReport {
        local_variance,
        palette_cardinality: palette,
        micro_pattern_density,
        score,
        spoof_suspected: score <= config.spoof_threshold,
    }
}
