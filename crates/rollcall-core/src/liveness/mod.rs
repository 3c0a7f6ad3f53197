//! Liveness gating for recognised faces.
//!
//! Two signal families feed a [`LivenessVerdict`]:
//!
//! - passive: frame-to-frame motion ([`motion`]) and crop texture ([`texture`]),
//!   collected continuously for every track;
//! - active: an explicit challenge ([`challenge`]) in `Challenge` mode.
//!
//! The verdict carries every report so the decision layer can apply its own
//! texture policy.

pub mod challenge;
pub mod motion;
pub mod texture;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub use challenge::{
    ChallengeConfig, ChallengeKind, ChallengeOutcome, ChallengePlan, ChallengeResult, ChallengeSample,
    LivenessError, LivenessVerifier, VerifierState,
};
pub use motion::{MotionAnalyzer, MotionConfig, MotionReport};
pub use texture::{TextureConfig, TextureReport};

pub const DEFAULT_COMPOSITE_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// Motion checks only; composite = fraction of positive checks.
    #[default]
    Passive,
    /// Motion checks weighted with an explicit challenge.
    Challenge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub mode: LivenessMode,
    /// Composite confidence must be strictly above this.
    pub composite_threshold: f32,
    pub passive_weight: f32,
    pub challenge_weight: f32,
    /// Side of the square crop sampled for motion and texture.
    pub crop_size: usize,
    pub plan: ChallengePlan,
    pub motion: MotionConfig,
    pub texture: TextureConfig,
    pub challenge: ChallengeConfig,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            mode: LivenessMode::Passive,
            composite_threshold: DEFAULT_COMPOSITE_THRESHOLD,
            passive_weight: 0.5,
            challenge_weight: 0.5,
            crop_size: 64,
            plan: ChallengePlan::Random,
            motion: MotionConfig::default(),
            texture: TextureConfig::default(),
            challenge: ChallengeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    /// Composite confidence in [0, 1].
    pub confidence: f32,
    pub motion: Option<MotionReport>,
    pub texture: Option<TextureReport>,
    pub challenge: Option<ChallengeResult>,
}

impl LivenessVerdict {
    /// Verdict from a precomputed composite score, without signal reports.
    pub fn from_confidence(confidence: f32, threshold: f32) -> Self {
        Self {
            is_live: confidence > threshold,
            confidence,
            motion: None,
            texture: None,
            challenge: None,
        }
    }

    /// The texture heuristic flagged a likely print or screen.
    pub fn texture_spoof_suspected(&self) -> bool {
        self.texture.as_ref().is_some_and(|t| t.spoof_suspected)
    }
}

/// Combine passive and challenge signals into a verdict.
///
/// Without a challenge the composite is the motion score alone; with one,
/// `passive_weight · motion + challenge_weight · [challenge passed]`.
/// Insufficient motion data counts as zero positive checks.
pub fn assess(
    config: &LivenessConfig,
    motion: &MotionReport,
    challenge: Option<&ChallengeResult>,
    texture: Option<&TextureReport>,
) -> LivenessVerdict {
    let fraction = if motion.sufficient { motion.score } else { 0.0 };
    let confidence = match challenge {
        None => fraction,
        Some(c) => {
            let completed = if c.verified { 1.0 } else { 0.0 };
            config.passive_weight * fraction + config.challenge_weight * completed
        }
    }
    .clamp(0.0, 1.0);

    LivenessVerdict {
        is_live: confidence > config.composite_threshold,
        confidence,
        motion: Some(motion.clone()),
        texture: texture.cloned(),
        challenge: challenge.cloned(),
    }
}

/// Liveness state for one track.
#[derive(Debug)]
pub struct TrackLiveness {
    config: LivenessConfig,
    motion: MotionAnalyzer,
    verifier: Option<LivenessVerifier>,
    texture: Option<TextureReport>,
    observed: usize,
}

impl TrackLiveness {
    pub fn new(config: &LivenessConfig) -> Result<Self, LivenessError> {
        let verifier = match config.mode {
            LivenessMode::Passive => None,
            LivenessMode::Challenge => Some(LivenessVerifier::new(
                config.challenge.clone(),
                config.plan.clone(),
            )?),
        };
        Ok(Self {
            motion: MotionAnalyzer::new(config.motion.clone()),
            config: config.clone(),
            verifier,
            texture: None,
            observed: 0,
        })
    }

    /// Record one frame of detector output for this track.
    ///
    /// In challenge mode the first observation issues the challenge.
    pub fn observe<R: Rng>(&mut self, sample: ChallengeSample, rng: &mut R) -> Result<(), LivenessError> {
        self.observed += 1;
        if let Some(crop) = &sample.crop {
            self.texture = Some(texture::analyze_texture(crop, &self.config.texture));
            self.motion.push(crop.clone());
        }

        if let Some(verifier) = self.verifier.as_mut() {
            let now = sample.captured_at;
            if verifier.state() == VerifierState::Idle {
                let challenge = verifier.issue_challenge(rng, now)?;
                tracing::info!(
                    kind = ?challenge.kind,
                    instruction = challenge.kind.instruction(),
                    "liveness challenge issued"
                );
            }
            match verifier.state() {
                VerifierState::ChallengeIssued | VerifierState::Collecting => verifier.feed(sample)?,
                _ => {}
            }
            verifier.advance(now);
        }
        Ok(())
    }

    /// Current verdict, or `None` while evidence is still being collected.
    pub fn verdict(&self) -> Option<LivenessVerdict> {
        let motion = self.motion.report();
        match &self.verifier {
            None => {
                // min_samples differences need one more observation
                (self.observed > self.config.motion.min_samples)
                    .then(|| assess(&self.config, &motion, None, self.texture.as_ref()))
            }
            Some(verifier) => verifier
                .result()
                .map(|result| assess(&self.config, &motion, Some(&result), self.texture.as_ref())),
        }
    }

    /// Discard collected evidence and any open challenge.
    pub fn reset(&mut self) {
        self.motion.reset();
        self.texture = None;
        self.observed = 0;
        if let Some(verifier) = self.verifier.as_mut() {
            verifier.reset();
        }
    }

    pub fn challenge(&self) -> Option<&challenge::Challenge> {
        self.verifier.as_ref().and_then(|v| v.current())
    }
}
