//! Passive motion analysis over consecutive face crops.
//!
//! A printed photograph held in front of the camera produces near-identical
//! crops frame to frame; a live face never does. Each new crop is compared
//! with the previous one (mean absolute pixel difference) and the last
//! `window` differences are scored by four independent checks.
//!
//! # Threat Coverage
//!
//! - **Blocks:** static photographs, frozen video frames.
//! - **Weak against:** video replay with natural motion; pair with texture
//!   analysis or a challenge.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::frame::FaceCrop;
use crate::vector;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Number of frame differences kept.
    pub window: usize,
    /// Fewer differences than this yield an insufficient report.
    pub min_samples: usize,
    /// Any difference above this counts as head movement.
    pub head_movement_min: f32,
    pub eye_movement_min: f32,
    pub eye_movement_max: f32,
    pub blink_min: f32,
    pub blink_max: f32,
    /// Variance of differences above this counts as natural movement.
    pub natural_variance_min: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            window: 30,
            min_samples: 3,
            head_movement_min: 5.0,
            eye_movement_min: 2.0,
            eye_movement_max: 15.0,
            blink_min: 3.0,
            blink_max: 10.0,
            natural_variance_min: 1.5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionReport {
    pub head_movement: bool,
    pub eye_movement: bool,
    pub blink_detected: bool,
    pub natural_movement: bool,
    pub diff_variance: f32,
    pub samples: usize,
    /// Fraction of the four checks that passed.
    pub score: f32,
    /// Enough differences were available to trust the checks.
    pub sufficient: bool,
}

impl MotionReport {
    pub fn positive_checks(&self) -> usize {
        [
            self.head_movement,
            self.eye_movement,
            self.blink_detected,
            self.natural_movement,
        ]
        .iter()
        .filter(|&&c| c)
        .count()
    }
}

/// Score a run of frame differences.
pub fn analyze_diffs(diffs: &[f32], config: &MotionConfig) -> MotionReport {
    if diffs.len() < config.min_samples.max(1) {
        return MotionReport {
            samples: diffs.len(),
            ..MotionReport::default()
        };
    }

    let head_movement = diffs.iter().any(|&d| d > config.head_movement_min);
    let eye_movement = diffs
        .iter()
        .any(|&d| d > config.eye_movement_min && d < config.eye_movement_max);
    let blink_detected = diffs
        .iter()
        .any(|&d| d > config.blink_min && d < config.blink_max);
    let diff_variance = vector::variance(diffs).unwrap_or(0.0);
    let natural_movement = diff_variance > config.natural_variance_min;

    let mut report = MotionReport {
        head_movement,
        eye_movement,
        blink_detected,
        natural_movement,
        diff_variance,
        samples: diffs.len(),
        score: 0.0,
        sufficient: true,
    };
    report.score = report.positive_checks() as f32 / 4.0;
    report
}

/// Rolling per-track motion state.
#[derive(Debug, Clone)]
pub struct MotionAnalyzer {
    config: MotionConfig,
    previous: Option<FaceCrop>,
    diffs: VecDeque<f32>,
}

impl MotionAnalyzer {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            diffs: VecDeque::with_capacity(config.window),
            config,
            previous: None,
        }
    }

    /// Compare `crop` with the previous one and record the difference.
    ///
    /// Crops of a different size restart the comparison chain.
    pub fn push(&mut self, crop: FaceCrop) {
        if let Some(diff) = self.previous.as_ref().and_then(|p| p.mean_abs_diff(&crop)) {
            if self.diffs.len() == self.config.window.max(1) {
                self.diffs.pop_front();
            }
            self.diffs.push_back(diff);
        }
        self.previous = Some(crop);
    }

    pub fn diffs(&self) -> Vec<f32> {
        self.diffs.iter().copied().collect()
    }

    pub fn report(&self) -> MotionReport {
        analyze_diffs(&self.diffs(), &self.config)
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.diffs.clear();
    }
}
