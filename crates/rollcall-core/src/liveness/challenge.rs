//! Challenge-response liveness: blink, head turn, smile, nod.
//!
//! A [`LivenessVerifier`] issues one challenge (or a short fixed sequence),
//! collects detector output for the challenge's fixed window, then scores the
//! buffered samples. The state machine is
//! `Idle → ChallengeIssued → Collecting → Verified | Failed`.
//!
//! Thresholds (EAR 0.20/0.25, turn 0.15 of face width, nod step 5 px, smile
//! 0.70/0.40) are carried over uncalibrated from the deployed kiosk; they are
//! configuration, not constants.

use chrono::{DateTime, FixedOffset};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::frame::FaceCrop;
use crate::types::{BoundingBox, Expressions, Landmarks};

/// Minimum EAR readings for a blink verdict.
const MIN_BLINK_FRAMES: usize = 3;
/// Minimum nose positions for a head-turn verdict.
const MIN_TURN_FRAMES: usize = 2;
/// Minimum expression readings for a smile verdict.
const MIN_SMILE_FRAMES: usize = 3;
/// Minimum nose positions for a nod verdict.
const MIN_NOD_FRAMES: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LivenessError {
    #[error("a challenge is already in progress")]
    ChallengeInProgress,
    #[error("no challenge has been issued")]
    NoActiveChallenge,
    #[error("verification already concluded")]
    Concluded,
    #[error("invalid challenge plan: {0}")]
    InvalidPlan(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChallengeKind {
    Blink,
    TurnLeft,
    TurnRight,
    Smile,
    Nod,
}

impl ChallengeKind {
    pub const ALL: [ChallengeKind; 5] = [
        ChallengeKind::Blink,
        ChallengeKind::TurnLeft,
        ChallengeKind::TurnRight,
        ChallengeKind::Smile,
        ChallengeKind::Nod,
    ];

    /// Prompt shown to the subject.
    pub fn instruction(&self) -> &'static str {
        match self {
            ChallengeKind::Blink => "Blink twice",
            ChallengeKind::TurnLeft => "Turn your head to the left",
            ChallengeKind::TurnRight => "Turn your head to the right",
            ChallengeKind::Smile => "Smile",
            ChallengeKind::Nod => "Nod your head",
        }
    }
}

/// Which challenges to issue per verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "type", content = "kinds")]
pub enum ChallengePlan {
    /// One kind chosen uniformly at random.
    #[default]
    Random,
    /// A fixed sequence of one or two kinds, all of which must pass.
    Sequence(Vec<ChallengeKind>),
}

impl ChallengePlan {
    pub fn validate(&self) -> Result<(), LivenessError> {
        match self {
            ChallengePlan::Random => Ok(()),
            ChallengePlan::Sequence(kinds) if (1..=2).contains(&kinds.len()) => Ok(()),
            ChallengePlan::Sequence(kinds) => Err(LivenessError::InvalidPlan(format!(
                "sequence must hold 1 or 2 challenges, got {}",
                kinds.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub blink_duration_ms: u64,
    pub turn_duration_ms: u64,
    pub smile_duration_ms: u64,
    pub nod_duration_ms: u64,
    /// EAR below this counts as eyes closed.
    pub ear_closed: f32,
    /// EAR above this after a closure completes a blink.
    pub ear_open: f32,
    pub min_blinks: usize,
    /// Peak nose displacement as a fraction of face width.
    pub turn_min_displacement: f32,
    pub smile_min_peak: f32,
    pub smile_min_mean: f32,
    /// Vertical nose steps smaller than this are treated as noise.
    pub nod_min_step: f32,
    pub nod_min_reversals: usize,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            blink_duration_ms: 3000,
            turn_duration_ms: 2500,
            smile_duration_ms: 2000,
            nod_duration_ms: 3000,
            ear_closed: 0.20,
            ear_open: 0.25,
            min_blinks: 2,
            turn_min_displacement: 0.15,
            smile_min_peak: 0.70,
            smile_min_mean: 0.40,
            nod_min_step: 5.0,
            nod_min_reversals: 1,
        }
    }
}

impl ChallengeConfig {
    pub fn duration_ms(&self, kind: ChallengeKind) -> u64 {
        match kind {
            ChallengeKind::Blink => self.blink_duration_ms,
            ChallengeKind::TurnLeft | ChallengeKind::TurnRight => self.turn_duration_ms,
            ChallengeKind::Smile => self.smile_duration_ms,
            ChallengeKind::Nod => self.nod_duration_ms,
        }
    }
}

/// One frame's worth of detector output fed into a running challenge.
#[derive(Debug, Clone)]
pub struct ChallengeSample {
    pub captured_at: DateTime<FixedOffset>,
    pub bounding_box: BoundingBox,
    pub landmarks: Option<Landmarks>,
    pub expressions: Option<Expressions>,
    pub crop: Option<FaceCrop>,
}

#[derive(Debug, Clone)]
pub struct DetectionSample {
    pub bounding_box: BoundingBox,
    pub landmarks: Option<Landmarks>,
}

/// Samples accumulated during one challenge window.
#[derive(Debug, Clone, Default)]
pub struct ChallengeBuffers {
    pub frames: Vec<FaceCrop>,
    pub detections: Vec<DetectionSample>,
    pub expressions: Vec<Expressions>,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub kind: ChallengeKind,
    pub started_at: DateTime<FixedOffset>,
    pub duration_ms: u64,
    pub buffers: ChallengeBuffers,
}

impl Challenge {
    pub fn new(kind: ChallengeKind, started_at: DateTime<FixedOffset>, duration_ms: u64) -> Self {
        Self {
            kind,
            started_at,
            duration_ms,
            buffers: ChallengeBuffers::default(),
        }
    }

    pub fn is_elapsed(&self, now: DateTime<FixedOffset>) -> bool {
        (now - self.started_at).num_milliseconds() >= self.duration_ms as i64
    }

    fn record(&mut self, sample: ChallengeSample) {
        if sample.captured_at < self.started_at {
            return;
        }
        if let Some(crop) = sample.crop {
            self.buffers.frames.push(crop);
        }
        if let Some(expressions) = sample.expressions {
            self.buffers.expressions.push(expressions);
        }
        self.buffers.detections.push(DetectionSample {
            bounding_box: sample.bounding_box,
            landmarks: sample.landmarks,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "check")]
pub enum ChallengeDetails {
    Blink { blink_count: usize, min_ear: f32 },
    Turn { peak_displacement: f32, direction_matched: bool },
    Smile { peak: f32, mean: f32 },
    Nod { reversals: usize, vertical_range: f32 },
    InsufficientSamples { required: usize, received: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeOutcome {
    pub kind: ChallengeKind,
    pub verified: bool,
    pub confidence: f32,
    pub details: ChallengeDetails,
}

impl ChallengeOutcome {
    fn insufficient(kind: ChallengeKind, required: usize, received: usize) -> Self {
        Self {
            kind,
            verified: false,
            confidence: 0.0,
            details: ChallengeDetails::InsufficientSamples { required, received },
        }
    }
}

/// Eye aspect ratio from the six contour points of one eye.
///
/// `(|p2-p6| + |p3-p5|) / (2·|p1-p4|)`; `None` for malformed input.
pub fn eye_aspect_ratio(eye: &[(f32, f32)]) -> Option<f32> {
    if eye.len() != 6 {
        return None;
    }
    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let horizontal = dist(eye[0], eye[3]);
    if horizontal <= f32::EPSILON {
        return None;
    }
    Some((dist(eye[1], eye[5]) + dist(eye[2], eye[4])) / (2.0 * horizontal))
}

/// Mean EAR of both eyes, if the landmarks carry eye contours.
pub fn landmarks_ear(landmarks: &Landmarks) -> Option<f32> {
    let left = eye_aspect_ratio(landmarks.left_eye()?)?;
    let right = eye_aspect_ratio(landmarks.right_eye()?)?;
    Some((left + right) / 2.0)
}

/// Count closed→open transitions: EAR below `closed`, then above `open`.
pub fn count_blinks(ears: &[f32], closed: f32, open: f32) -> usize {
    let mut blinks = 0;
    let mut eyes_closed = false;
    for &ear in ears {
        if !eyes_closed && ear < closed {
            eyes_closed = true;
        } else if eyes_closed && ear > open {
            eyes_closed = false;
            blinks += 1;
        }
    }
    blinks
}

pub fn verify_blink_sequence(ears: &[f32], config: &ChallengeConfig) -> ChallengeOutcome {
    if ears.len() < MIN_BLINK_FRAMES {
        return ChallengeOutcome::insufficient(ChallengeKind::Blink, MIN_BLINK_FRAMES, ears.len());
    }
    let blink_count = count_blinks(ears, config.ear_closed, config.ear_open);
    let min_ear = ears.iter().copied().fold(f32::INFINITY, f32::min);
    let required = config.min_blinks.max(1);
    ChallengeOutcome {
        kind: ChallengeKind::Blink,
        verified: blink_count >= required,
        confidence: (blink_count as f32 / required as f32).min(1.0),
        details: ChallengeDetails::Blink { blink_count, min_ear },
    }
}

pub fn verify_blink(buffers: &ChallengeBuffers, config: &ChallengeConfig) -> ChallengeOutcome {
    let ears: Vec<f32> = buffers
        .detections
        .iter()
        .filter_map(|d| d.landmarks.as_ref().and_then(landmarks_ear))
        .collect();
    verify_blink_sequence(&ears, config)
}

/// Horizontal nose displacement relative to the first frame, normalised by
/// face width. Negative values move toward image-left.
pub fn verify_turn(
    buffers: &ChallengeBuffers,
    kind: ChallengeKind,
    config: &ChallengeConfig,
) -> ChallengeOutcome {
    let points: Vec<(f32, f32)> = buffers
        .detections
        .iter()
        .filter_map(|d| {
            let nose = d.landmarks.as_ref()?.nose_tip()?;
            (d.bounding_box.width > 0.0).then_some((nose.0, d.bounding_box.width))
        })
        .collect();
    if points.len() < MIN_TURN_FRAMES {
        return ChallengeOutcome::insufficient(kind, MIN_TURN_FRAMES, points.len());
    }

    // Only excursions toward the requested side count.
    let sign = match kind {
        ChallengeKind::TurnLeft => -1.0,
        ChallengeKind::TurnRight => 1.0,
        _ => 0.0,
    };
    let origin = points[0].0;
    let reach = points
        .iter()
        .map(|(x, width)| sign * (x - origin) / width)
        .fold(0.0f32, f32::max);

    let direction_matched = reach > 0.0;
    let verified = direction_matched && reach > config.turn_min_displacement;
    let confidence = if verified {
        (reach / (2.0 * config.turn_min_displacement)).min(1.0)
    } else {
        0.0
    };
    let peak = sign * reach;

    ChallengeOutcome {
        kind,
        verified,
        confidence,
        details: ChallengeDetails::Turn {
            peak_displacement: peak,
            direction_matched,
        },
    }
}

pub fn verify_smile(buffers: &ChallengeBuffers, config: &ChallengeConfig) -> ChallengeOutcome {
    let happy: Vec<f32> = buffers.expressions.iter().map(|e| e.happy).collect();
    if happy.len() < MIN_SMILE_FRAMES {
        return ChallengeOutcome::insufficient(ChallengeKind::Smile, MIN_SMILE_FRAMES, happy.len());
    }
    let peak = happy.iter().copied().fold(0.0f32, f32::max);
    let mean = happy.iter().sum::<f32>() / happy.len() as f32;
    let verified = peak > config.smile_min_peak && mean > config.smile_min_mean;
    ChallengeOutcome {
        kind: ChallengeKind::Smile,
        verified,
        confidence: if verified { peak.clamp(0.0, 1.0) } else { 0.0 },
        details: ChallengeDetails::Smile { peak, mean },
    }
}

/// Count direction reversals of vertical nose movement, ignoring steps
/// smaller than `min_step`.
pub fn count_reversals(ys: &[f32], min_step: f32) -> usize {
    let mut reversals = 0;
    let mut last_direction: Option<bool> = None;
    for pair in ys.windows(2) {
        let dy = pair[1] - pair[0];
        if dy.abs() < min_step {
            continue;
        }
        let down = dy > 0.0;
        if let Some(prev) = last_direction {
            if prev != down {
                reversals += 1;
            }
        }
        last_direction = Some(down);
    }
    reversals
}

pub fn verify_nod(buffers: &ChallengeBuffers, config: &ChallengeConfig) -> ChallengeOutcome {
    let ys: Vec<f32> = buffers
        .detections
        .iter()
        .filter_map(|d| d.landmarks.as_ref()?.nose_tip().map(|p| p.1))
        .collect();
    if ys.len() < MIN_NOD_FRAMES {
        return ChallengeOutcome::insufficient(ChallengeKind::Nod, MIN_NOD_FRAMES, ys.len());
    }
    let reversals = count_reversals(&ys, config.nod_min_step);
    let lo = ys.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = ys.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let required = config.nod_min_reversals.max(1);
    let verified = reversals >= required;
    ChallengeOutcome {
        kind: ChallengeKind::Nod,
        verified,
        confidence: if verified {
            (0.5 + 0.25 * reversals as f32).min(1.0)
        } else {
            0.0
        },
        details: ChallengeDetails::Nod {
            reversals,
            vertical_range: hi - lo,
        },
    }
}

/// Score a completed challenge window.
pub fn verify_challenge(challenge: &Challenge, config: &ChallengeConfig) -> ChallengeOutcome {
    let buffers = &challenge.buffers;
    match challenge.kind {
        ChallengeKind::Blink => verify_blink(buffers, config),
        kind @ (ChallengeKind::TurnLeft | ChallengeKind::TurnRight) => verify_turn(buffers, kind, config),
        ChallengeKind::Smile => verify_smile(buffers, config),
        ChallengeKind::Nod => verify_nod(buffers, config),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierState {
    Idle,
    ChallengeIssued,
    Collecting,
    Verified,
    Failed,
}

/// Combined result of every challenge in one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeResult {
    pub verified: bool,
    /// Lowest confidence across the sequence.
    pub confidence: f32,
    pub outcomes: Vec<ChallengeOutcome>,
}

/// Drives one verification attempt through its challenge(s).
#[derive(Debug)]
pub struct LivenessVerifier {
    config: ChallengeConfig,
    plan: ChallengePlan,
    state: VerifierState,
    current: Option<Challenge>,
    queue: VecDeque<ChallengeKind>,
    outcomes: Vec<ChallengeOutcome>,
}

impl LivenessVerifier {
    pub fn new(config: ChallengeConfig, plan: ChallengePlan) -> Result<Self, LivenessError> {
        plan.validate()?;
        Ok(Self {
            config,
            plan,
            state: VerifierState::Idle,
            current: None,
            queue: VecDeque::new(),
            outcomes: Vec::new(),
        })
    }

    pub fn state(&self) -> VerifierState {
        self.state
    }

    pub fn current(&self) -> Option<&Challenge> {
        self.current.as_ref()
    }

    /// Start a verification attempt. `rng` picks the kind for random plans.
    pub fn issue_challenge<R: Rng>(
        &mut self,
        rng: &mut R,
        now: DateTime<FixedOffset>,
    ) -> Result<&Challenge, LivenessError> {
        if self.state != VerifierState::Idle {
            return Err(LivenessError::ChallengeInProgress);
        }

        self.queue = match &self.plan {
            ChallengePlan::Random => {
                let kind = ChallengeKind::ALL[rng.gen_range(0..ChallengeKind::ALL.len())];
                VecDeque::from([kind])
            }
            ChallengePlan::Sequence(kinds) => kinds.iter().copied().collect(),
        };
        self.outcomes.clear();
        self.start_next(now)
    }

    fn start_next(&mut self, now: DateTime<FixedOffset>) -> Result<&Challenge, LivenessError> {
        let kind = self.queue.pop_front().ok_or(LivenessError::NoActiveChallenge)?;
        let duration_ms = self.config.duration_ms(kind);
        tracing::debug!(?kind, duration_ms, "challenge issued");
        self.state = VerifierState::ChallengeIssued;
        Ok(self.current.insert(Challenge::new(kind, now, duration_ms)))
    }

    /// Buffer one frame of detector output for the running challenge.
    pub fn feed(&mut self, sample: ChallengeSample) -> Result<(), LivenessError> {
        match self.state {
            VerifierState::ChallengeIssued | VerifierState::Collecting => {}
            VerifierState::Idle => return Err(LivenessError::NoActiveChallenge),
            VerifierState::Verified | VerifierState::Failed => return Err(LivenessError::Concluded),
        }
        let challenge = self.current.as_mut().ok_or(LivenessError::NoActiveChallenge)?;
        challenge.record(sample);
        self.state = VerifierState::Collecting;
        Ok(())
    }

    /// Conclude the running challenge if its window has elapsed at `now`.
    ///
    /// Windows are not preemptible: before the deadline this only reports
    /// the current state.
    pub fn advance(&mut self, now: DateTime<FixedOffset>) -> VerifierState {
        let elapsed = match (&self.state, &self.current) {
            (VerifierState::ChallengeIssued | VerifierState::Collecting, Some(c)) => c.is_elapsed(now),
            _ => false,
        };
        if !elapsed {
            return self.state;
        }

        let Some(challenge) = self.current.take() else {
            return self.state;
        };
        let outcome = verify_challenge(&challenge, &self.config);
        tracing::debug!(
            kind = ?outcome.kind,
            verified = outcome.verified,
            confidence = outcome.confidence,
            "challenge window closed"
        );
        let passed = outcome.verified;
        self.outcomes.push(outcome);

        if !passed {
            self.queue.clear();
            self.state = VerifierState::Failed;
        } else if self.queue.is_empty() {
            self.state = VerifierState::Verified;
        } else if self.start_next(now).is_err() {
            self.state = VerifierState::Failed;
        }
        self.state
    }

    /// Final result once the verifier reached `Verified` or `Failed`.
    pub fn result(&self) -> Option<ChallengeResult> {
        match self.state {
            VerifierState::Verified | VerifierState::Failed => {
                let confidence = self
                    .outcomes
                    .iter()
                    .map(|o| o.confidence)
                    .fold(f32::INFINITY, f32::min);
                Some(ChallengeResult {
                    verified: self.state == VerifierState::Verified,
                    confidence: if confidence.is_finite() { confidence } else { 0.0 },
                    outcomes: self.outcomes.clone(),
                })
            }
            _ => None,
        }
    }

    /// Abandon any open challenge without producing a result.
    pub fn reset(&mut self) {
        self.state = VerifierState::Idle;
        self.current = None;
        self.queue.clear();
        self.outcomes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn t(ms: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_millis_opt(1_700_000_000_000 + ms)
            .unwrap()
    }

    /// 68 points with both eyes shaped for the given EAR and the nose at `nose`.
    fn face(ear: f32, nose: (f32, f32)) -> Landmarks {
        let mut points = vec![(0.0, 0.0); 68];
        for (start, cx) in [(36, 100.0), (42, 160.0)] {
            let half_h = ear * 20.0 / 2.0; // horizontal eye width 20
            points[start] = (cx - 10.0, 100.0);
            points[start + 1] = (cx - 5.0, 100.0 - half_h);
            points[start + 2] = (cx + 5.0, 100.0 - half_h);
            points[start + 3] = (cx + 10.0, 100.0);
            points[start + 4] = (cx + 5.0, 100.0 + half_h);
            points[start + 5] = (cx - 5.0, 100.0 + half_h);
        }
        points[30] = nose;
        Landmarks::new(points)
    }

    fn detection(ear: f32, nose: (f32, f32)) -> DetectionSample {
        DetectionSample {
            bounding_box: BoundingBox::new(50.0, 50.0, 200.0, 200.0),
            landmarks: Some(face(ear, nose)),
        }
    }

    fn sample(ms: i64, ear: f32, nose: (f32, f32), happy: f32) -> ChallengeSample {
        ChallengeSample {
            captured_at: t(ms),
            bounding_box: BoundingBox::new(50.0, 50.0, 200.0, 200.0),
            landmarks: Some(face(ear, nose)),
            expressions: Some(Expressions {
                happy,
                ..Expressions::default()
            }),
            crop: None,
        }
    }

    #[test]
    fn test_ear_computation() {
        let lm = face(0.3, (0.0, 0.0));
        let ear = landmarks_ear(&lm).unwrap();
        assert!((ear - 0.3).abs() < 1e-5);
    }

    #[test]
    fn test_ear_rejects_degenerate_eye() {
        assert_eq!(eye_aspect_ratio(&[(0.0, 0.0); 6]), None);
        assert_eq!(eye_aspect_ratio(&[(0.0, 0.0); 5]), None);
    }

    #[test]
    fn test_blink_sequence_two_blinks() {
        let ears = [0.30, 0.28, 0.15, 0.12, 0.27, 0.30, 0.14, 0.29];
        let outcome = verify_blink_sequence(&ears, &ChallengeConfig::default());
        assert!(outcome.verified);
        assert!(matches!(
            outcome.details,
            ChallengeDetails::Blink { blink_count: 2, .. }
        ));
        assert_eq!(outcome.confidence, 1.0);
    }

    #[test]
    fn test_blink_requires_recovery_above_open() {
        // Dips below 0.20 but never recovers above 0.25 in between.
        let ears = [0.30, 0.15, 0.22, 0.18, 0.24, 0.30];
        assert_eq!(count_blinks(&ears, 0.20, 0.25), 1);
        let outcome = verify_blink_sequence(&ears, &ChallengeConfig::default());
        assert!(!outcome.verified);
    }

    #[test]
    fn test_blink_insufficient_samples() {
        let outcome = verify_blink_sequence(&[0.3, 0.1], &ChallengeConfig::default());
        assert!(!outcome.verified);
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(
            outcome.details,
            ChallengeDetails::InsufficientSamples { required: 3, received: 2 }
        );
    }

    #[test]
    fn test_turn_direction() {
        let config = ChallengeConfig::default();
        // Nose moves 40px toward image-left on a 200px face: -0.2
        let buffers = ChallengeBuffers {
            detections: vec![
                detection(0.3, (150.0, 150.0)),
                detection(0.3, (130.0, 150.0)),
                detection(0.3, (110.0, 150.0)),
            ],
            ..ChallengeBuffers::default()
        };
        let left = verify_turn(&buffers, ChallengeKind::TurnLeft, &config);
        assert!(left.verified);
        let right = verify_turn(&buffers, ChallengeKind::TurnRight, &config);
        assert!(!right.verified);
        assert!(matches!(
            right.details,
            ChallengeDetails::Turn { direction_matched: false, .. }
        ));
    }

    #[test]
    fn test_turn_ignores_larger_swing_the_other_way() {
        // Right by 0.4 face widths first, then left to -0.2.
        let buffers = ChallengeBuffers {
            detections: vec![
                detection(0.3, (150.0, 150.0)),
                detection(0.3, (230.0, 150.0)),
                detection(0.3, (150.0, 150.0)),
                detection(0.3, (110.0, 150.0)),
            ],
            ..ChallengeBuffers::default()
        };
        let outcome = verify_turn(&buffers, ChallengeKind::TurnLeft, &ChallengeConfig::default());
        assert!(outcome.verified);
        match outcome.details {
            ChallengeDetails::Turn { peak_displacement, direction_matched } => {
                assert!(direction_matched);
                assert!((peak_displacement + 0.2).abs() < 1e-5);
            }
            other => panic!("unexpected details: {other:?}"),
        }
    }

    #[test]
    fn test_turn_too_small() {
        let buffers = ChallengeBuffers {
            detections: vec![detection(0.3, (150.0, 150.0)), detection(0.3, (170.0, 150.0))],
            ..ChallengeBuffers::default()
        };
        // 20/200 = 0.10 < 0.15
        let outcome = verify_turn(&buffers, ChallengeKind::TurnRight, &ChallengeConfig::default());
        assert!(!outcome.verified);
    }

    #[test]
    fn test_smile_peak_and_mean() {
        let config = ChallengeConfig::default();
        let smiling = ChallengeBuffers {
            expressions: [0.3, 0.6, 0.9, 0.8]
                .iter()
                .map(|&happy| Expressions { happy, ..Expressions::default() })
                .collect(),
            ..ChallengeBuffers::default()
        };
        assert!(verify_smile(&smiling, &config).verified);

        // Brief flash of a smile: peak high, mean low
        let flash = ChallengeBuffers {
            expressions: [0.0, 0.0, 0.9, 0.0]
                .iter()
                .map(|&happy| Expressions { happy, ..Expressions::default() })
                .collect(),
            ..ChallengeBuffers::default()
        };
        assert!(!verify_smile(&flash, &config).verified);
    }

    #[test]
    fn test_nod_reversal() {
        assert_eq!(count_reversals(&[100.0, 108.0, 116.0, 109.0, 101.0], 5.0), 1);
        // Jitter below the step threshold is ignored.
        assert_eq!(count_reversals(&[100.0, 103.0, 100.0, 103.0, 100.0], 5.0), 0);

        let buffers = ChallengeBuffers {
            detections: [100.0, 108.0, 116.0, 109.0, 101.0]
                .iter()
                .map(|&y| detection(0.3, (150.0, y)))
                .collect(),
            ..ChallengeBuffers::default()
        };
        assert!(verify_nod(&buffers, &ChallengeConfig::default()).verified);
    }

    #[test]
    fn test_plan_validation() {
        assert!(ChallengePlan::Sequence(vec![]).validate().is_err());
        assert!(ChallengePlan::Sequence(vec![ChallengeKind::Blink; 3]).validate().is_err());
        assert!(ChallengePlan::Sequence(vec![ChallengeKind::Blink, ChallengeKind::Nod])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_random_plan_is_reproducible_with_seeded_rng() {
        let pick = |seed| {
            let mut verifier =
                LivenessVerifier::new(ChallengeConfig::default(), ChallengePlan::Random).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            verifier.issue_challenge(&mut rng, t(0)).unwrap().kind
        };
        assert_eq!(pick(7), pick(7));
        assert!(ChallengeKind::ALL.contains(&pick(42)));
    }

    #[test]
    fn test_state_machine_blink_verified() {
        let mut verifier = LivenessVerifier::new(
            ChallengeConfig::default(),
            ChallengePlan::Sequence(vec![ChallengeKind::Blink]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(verifier.state(), VerifierState::Idle);
        assert!(verifier.feed(sample(0, 0.3, (0.0, 0.0), 0.0)).is_err());

        verifier.issue_challenge(&mut rng, t(0)).unwrap();
        assert_eq!(verifier.state(), VerifierState::ChallengeIssued);
        assert_eq!(
            verifier.issue_challenge(&mut rng, t(0)).unwrap_err(),
            LivenessError::ChallengeInProgress
        );

        let ears = [0.30, 0.28, 0.15, 0.12, 0.27, 0.30, 0.14, 0.29];
        for (i, ear) in ears.iter().enumerate() {
            verifier.feed(sample(i as i64 * 100, *ear, (0.0, 0.0), 0.0)).unwrap();
            assert_eq!(verifier.advance(t(i as i64 * 100)), VerifierState::Collecting);
        }
        assert_eq!(verifier.advance(t(3000)), VerifierState::Verified);

        let result = verifier.result().unwrap();
        assert!(result.verified);
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(
            verifier.feed(sample(3100, 0.3, (0.0, 0.0), 0.0)).unwrap_err(),
            LivenessError::Concluded
        );
    }

    #[test]
    fn test_state_machine_sequence_fails_fast() {
        let mut verifier = LivenessVerifier::new(
            ChallengeConfig::default(),
            ChallengePlan::Sequence(vec![ChallengeKind::Smile, ChallengeKind::Blink]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        verifier.issue_challenge(&mut rng, t(0)).unwrap();
        for i in 0..5 {
            verifier.feed(sample(i * 100, 0.3, (0.0, 0.0), 0.05)).unwrap();
        }
        assert_eq!(verifier.advance(t(2000)), VerifierState::Failed);
        let result = verifier.result().unwrap();
        assert!(!result.verified);
        assert_eq!(result.outcomes.len(), 1);
    }

    #[test]
    fn test_state_machine_sequence_advances() {
        let mut verifier = LivenessVerifier::new(
            ChallengeConfig::default(),
            ChallengePlan::Sequence(vec![ChallengeKind::Smile, ChallengeKind::Nod]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        verifier.issue_challenge(&mut rng, t(0)).unwrap();
        for i in 0..5 {
            verifier.feed(sample(i * 100, 0.3, (150.0, 100.0), 0.9)).unwrap();
        }
        assert_eq!(verifier.advance(t(2000)), VerifierState::ChallengeIssued);
        assert_eq!(verifier.current().unwrap().kind, ChallengeKind::Nod);

        for (i, y) in [100.0, 110.0, 120.0, 110.0, 100.0].iter().enumerate() {
            verifier
                .feed(sample(2000 + i as i64 * 100, 0.3, (150.0, *y), 0.0))
                .unwrap();
        }
        assert_eq!(verifier.advance(t(5000)), VerifierState::Verified);
        assert_eq!(verifier.result().unwrap().outcomes.len(), 2);
    }

    #[test]
    fn test_reset_abandons_challenge() {
        let mut verifier =
            LivenessVerifier::new(ChallengeConfig::default(), ChallengePlan::Random).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        verifier.issue_challenge(&mut rng, t(0)).unwrap();
        verifier.reset();
        assert_eq!(verifier.state(), VerifierState::Idle);
        assert!(verifier.current().is_none());
        assert!(verifier.result().is_none());
    }
}
