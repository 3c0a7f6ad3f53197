//! One capture session: tracking, recognition, liveness and decisions.
//!
//! The session is synchronous and single-threaded; the daemon's engine thread
//! owns it and feeds it one frame at a time. Each frame:
//!
//! 1. updates tracks and matches faces due for recognition against a single
//!    repository snapshot (taken only when something is due),
//! 2. feeds every unaccepted face into its track's liveness state,
//! 3. turns matched faces with a liveness verdict into decisions.
//!
//! Decisions are idempotent per session: an accepted track or identity is
//! never announced twice, and a rejection is announced once per track and
//! reason.

use chrono::{DateTime, FixedOffset};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::decision::{AttendanceDecision, DecisionConfig, DecisionOrchestrator, RejectionReason};
use crate::frame::{FaceCrop, Frame};
use crate::liveness::{ChallengeSample, LivenessConfig, TrackLiveness};
use crate::matcher::{EnsembleMatcher, MatchError, MatchResult, Matcher, MatcherConfig};
use crate::repository::{DescriptorRepository, DescriptorStore, RepositoryConfig};
use crate::tracker::{FaceTracker, TrackId, TrackedFace, TrackerConfig};
use crate::types::{BoundingBox, Descriptor, Detection, IdentityId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("session has been stopped")]
    Stopped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub repository: RepositoryConfig,
    pub matcher: MatcherConfig,
    pub tracker: TrackerConfig,
    pub liveness: LivenessConfig,
    pub decision: DecisionConfig,
}

/// Detector output for one captured frame.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameInput {
    pub index: u64,
    pub captured_at: DateTime<FixedOffset>,
    /// Grayscale pixels for motion/texture liveness; optional.
    #[serde(default)]
    pub frame: Option<Frame>,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// Per-face state for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceStatus {
    pub track_id: TrackId,
    pub bounding_box: BoundingBox,
    pub identity_id: Option<IdentityId>,
    pub confidence: f32,
    pub accepted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    pub index: u64,
    pub faces: Vec<FaceStatus>,
    pub decisions: Vec<AttendanceDecision>,
    pub expired: Vec<TrackId>,
    /// Frame was too dark for motion/texture analysis.
    pub dark: bool,
    /// The repository snapshot failed this frame; affected faces were rejected.
    pub repository_error: Option<String>,
}

/// A recognised identity waiting for its track's liveness verdict.
#[derive(Debug, Clone)]
struct PendingMatch {
    result: MatchResult,
    descriptor: Descriptor,
}

pub struct AttendanceSession<S: DescriptorStore, R: Rng> {
    repository: DescriptorRepository<S>,
    matcher: EnsembleMatcher,
    tracker: FaceTracker,
    orchestrator: DecisionOrchestrator,
    liveness_config: LivenessConfig,
    rng: R,
    liveness: HashMap<TrackId, TrackLiveness>,
    pending: HashMap<TrackId, PendingMatch>,
    rejected: HashSet<(TrackId, RejectionReason)>,
    accepted_identities: HashSet<IdentityId>,
    stopped: bool,
}

impl<S: DescriptorStore, R: Rng> AttendanceSession<S, R> {
    /// `repository` carries its own config; `config.repository` is not reapplied.
    pub fn new(repository: DescriptorRepository<S>, config: SessionConfig, rng: R) -> Self {
        Self {
            repository,
            matcher: EnsembleMatcher::new(config.matcher),
            tracker: FaceTracker::new(config.tracker),
            orchestrator: DecisionOrchestrator::new(config.decision),
            liveness_config: config.liveness,
            rng,
            liveness: HashMap::new(),
            pending: HashMap::new(),
            rejected: HashSet::new(),
            accepted_identities: HashSet::new(),
            stopped: false,
        }
    }

    pub fn repository(&self) -> &DescriptorRepository<S> {
        &self.repository
    }

    pub fn tracker(&self) -> &FaceTracker {
        &self.tracker
    }

    pub fn process(&mut self, input: FrameInput) -> Result<FrameOutcome, SessionError> {
        if self.stopped {
            return Err(SessionError::Stopped);
        }

        let now = input.captured_at;
        let dark = input.frame.as_ref().is_some_and(|f| f.is_dark());
        if dark {
            tracing::debug!(index = input.index, "dark frame; skipping passive liveness");
        }

        let mut repository_error = None;
        let repository = &self.repository;
        let matcher = &self.matcher;
        let update = self.tracker.update(input.detections, input.index, |probes| {
            match repository.snapshot() {
                Ok(gallery) => probes.iter().map(|p| matcher.identify(p, &gallery)).collect(),
                Err(e) => {
                    tracing::error!(error = %e, faces = probes.len(), "repository snapshot failed");
                    let message = e.to_string();
                    repository_error = Some(message.clone());
                    probes
                        .iter()
                        .map(|_| Err(MatchError::RepositoryUnavailable(message.clone())))
                        .collect()
                }
            }
        });

        for track_id in &update.expired {
            self.forget_track(*track_id);
        }

        let mut outcome = FrameOutcome {
            index: input.index,
            expired: update.expired,
            dark,
            repository_error,
            ..FrameOutcome::default()
        };

        for mut face in update.faces {
            let crop = match (&input.frame, dark) {
                (Some(f), false) => f.crop(&face.bounding_box, self.liveness_config.crop_size),
                _ => None,
            };

            if !face.accepted {
                if let Some(decision) = self.handle_recognition(&mut face, now) {
                    outcome.decisions.push(decision);
                }
            }
            if !face.accepted && !dark {
                self.observe_liveness(&face, crop.clone(), now);
                if let Some(decision) = self.try_decide(&mut face, crop.as_ref(), now) {
                    outcome.decisions.push(decision);
                }
            }

            let track = self.tracker.track(face.track_id);
            outcome.faces.push(FaceStatus {
                track_id: face.track_id,
                bounding_box: face.bounding_box,
                identity_id: track.and_then(|t| t.last_identity.clone()),
                confidence: track.map_or(0.0, |t| t.last_confidence),
                accepted: face.accepted,
            });
        }

        Ok(outcome)
    }

    /// Act on this frame's recognition result, if one ran.
    fn handle_recognition(&mut self, face: &mut TrackedFace, now: DateTime<FixedOffset>) -> Option<AttendanceDecision> {
        let result = face.match_result.take()?;
        let track_id = face.track_id;

        let m = match result {
            Ok(m) => m,
            Err(e) => {
                let reason = RejectionReason::from(&e);
                tracing::warn!(track_id, error = %e, "recognition failed; rejecting");
                self.pending.remove(&track_id);
                return self.reject_once(track_id, reason, now);
            }
        };

        let Some(identity) = m.identity_id.clone() else {
            self.pending.remove(&track_id);
            return self.reject_once(track_id, RejectionReason::NoMatch, now);
        };

        if self.accepted_identities.contains(&identity) {
            tracing::debug!(track_id, identity = %identity, "identity already recorded this session");
            self.tracker.mark_accepted(track_id);
            self.forget_liveness(track_id);
            face.accepted = true;
            return None;
        }

        self.pending.insert(
            track_id,
            PendingMatch {
                result: m,
                descriptor: face.detection.descriptor.clone(),
            },
        );
        None
    }

    fn observe_liveness(&mut self, face: &TrackedFace, crop: Option<FaceCrop>, now: DateTime<FixedOffset>) {
        let state = match self.liveness.entry(face.track_id) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => match TrackLiveness::new(&self.liveness_config) {
                Ok(state) => e.insert(state),
                Err(err) => {
                    tracing::error!(track_id = face.track_id, error = %err, "liveness state unavailable");
                    return;
                }
            },
        };
        let sample = ChallengeSample {
            captured_at: now,
            bounding_box: face.bounding_box,
            landmarks: face.detection.landmarks.clone(),
            expressions: face.detection.expressions,
            crop,
        };
        if let Err(err) = state.observe(sample, &mut self.rng) {
            tracing::warn!(track_id = face.track_id, error = %err, "liveness observation rejected");
        }
    }

    /// Decide for a matched track once its liveness verdict is in.
    fn try_decide(
        &mut self,
        face: &mut TrackedFace,
        crop: Option<&FaceCrop>,
        now: DateTime<FixedOffset>,
    ) -> Option<AttendanceDecision> {
        let track_id = face.track_id;
        if !self.pending.contains_key(&track_id) {
            return None;
        }
        let verdict = self.liveness.get(&track_id)?.verdict()?;
        let pending = self.pending.remove(&track_id)?;

        let decision = self
            .orchestrator
            .decide(&pending.result, Some(&verdict), now)
            .with_track(track_id);

        if decision.status.is_accepted() {
            if let Some(identity) = &decision.identity_id {
                self.accepted_identities.insert(identity.clone());
            }
            self.tracker.mark_accepted(track_id);
            self.forget_liveness(track_id);
            face.accepted = true;

            let image_ref = crop.map(FaceCrop::fingerprint);
            match self
                .orchestrator
                .reinforce(&mut self.repository, &decision, &pending.descriptor, image_ref)
            {
                Ok(learned) => tracing::debug!(track_id, learned, "reinforcement"),
                Err(e) => tracing::warn!(track_id, error = %e, "failed to learn from accepted face"),
            }
            tracing::info!(
                track_id,
                identity = ?decision.identity_id,
                status = %decision.status,
                confidence = decision.confidence,
                liveness = verdict.confidence,
                "attendance recorded"
            );
            return Some(decision);
        }

        // Collect fresh evidence before the next attempt.
        if let Some(state) = self.liveness.get_mut(&track_id) {
            state.reset();
        }
        let reason = decision.rejection.unwrap_or(RejectionReason::SpoofSuspected);
        if self.rejected.insert((track_id, reason)) {
            Some(decision)
        } else {
            None
        }
    }

    fn reject_once(
        &mut self,
        track_id: TrackId,
        reason: RejectionReason,
        now: DateTime<FixedOffset>,
    ) -> Option<AttendanceDecision> {
        if !self.rejected.insert((track_id, reason)) {
            return None;
        }
        tracing::info!(track_id, reason = reason.as_str(), "unauthorized face");
        Some(
            self.orchestrator
                .reject(reason, None, 0.0, None, now)
                .with_track(track_id),
        )
    }

    fn forget_liveness(&mut self, track_id: TrackId) {
        self.liveness.remove(&track_id);
        self.pending.remove(&track_id);
    }

    fn forget_track(&mut self, track_id: TrackId) {
        self.forget_liveness(track_id);
        self.rejected.retain(|(t, _)| *t != track_id);
    }

    /// Discard tracks, open challenges and dedup state. Nothing is written.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.liveness.clear();
        self.pending.clear();
        self.rejected.clear();
        self.accepted_identities.clear();
        tracing::info!("capture session reset");
    }

    /// Reset and refuse further frames.
    pub fn stop(&mut self) {
        self.reset();
        self.stopped = true;
        tracing::info!("capture session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::AttendanceStatus;
    use crate::liveness::{ChallengeKind, ChallengePlan, LivenessMode};
    use crate::repository::{MemoryStore, RepositoryError, DescriptorSample};
    use crate::types::Expressions;
    use std::cell::Cell;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    const DIM: usize = 4;

    fn t(ms: i64) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 9, 2, 8, 0, 0)
            .unwrap()
            + chrono::Duration::milliseconds(ms)
    }

    fn desc(v: f32) -> Descriptor {
        let mut values = vec![0.0; DIM];
        values[0] = v;
        Descriptor::new(values).unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig {
            repository: RepositoryConfig {
                descriptor_dim: DIM,
                ..RepositoryConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn session(config: SessionConfig) -> AttendanceSession<MemoryStore, StdRng> {
        let mut repo = DescriptorRepository::new(MemoryStore::new(), config.repository);
        for v in [0.0, 0.02, 0.04] {
            repo.enroll(&IdentityId::from("U1"), &desc(v), 0.9, None).unwrap();
        }
        AttendanceSession::new(repo, config, StdRng::seed_from_u64(9))
    }

    /// Per-frame brightness offsets: differences of 4, 8, 3, 7, ...
    const OFFSETS: [u8; 10] = [0, 4, 12, 9, 2, 6, 10, 3, 7, 1];

    /// A textured 32x32 frame brightened uniformly by `offset`.
    fn frame(offset: u8) -> Frame {
        let data = (0..32u32 * 32)
            .map(|i| ((i * 37) % 200) as u8 + 20 + offset)
            .collect();
        Frame::new(data, 32, 32).unwrap()
    }

    fn input(index: u64, frame: Option<Frame>, detections: Vec<Detection>) -> FrameInput {
        FrameInput {
            index,
            captured_at: t(index as i64 * 100),
            frame,
            detections,
        }
    }

    fn face(v: f32) -> Detection {
        Detection {
            bounding_box: BoundingBox::new(4.0, 4.0, 24.0, 24.0),
            descriptor: desc(v),
            landmarks: None,
            expressions: None,
        }
    }

    #[test]
    fn test_static_photo_is_rejected_once() {
        let mut s = session(config());
        let still = frame(0);
        let mut decisions = Vec::new();
        for i in 0..12 {
            let out = s.process(input(i, Some(still.clone()), vec![face(0.01)])).unwrap();
            decisions.extend(out.decisions);
        }
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].status, AttendanceStatus::Unauthorized);
        assert_eq!(decisions[0].rejection, Some(RejectionReason::SpoofSuspected));
        assert_eq!(decisions[0].identity_id, Some(IdentityId::from("U1")));
    }

    #[test]
    fn test_unknown_face_rejected_once_per_track() {
        let mut s = session(config());
        let mut decisions = Vec::new();
        for i in 0..5 {
            let out = s.process(input(i, None, vec![face(0.9)])).unwrap();
            decisions.extend(out.decisions);
        }
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].rejection, Some(RejectionReason::NoMatch));
        assert_eq!(decisions[0].track_id, Some(1));
    }

    #[test]
    fn test_live_face_accepted_once() {
        let mut s = session(config());
        let mut decisions = Vec::new();
        for i in 0..20 {
            let out = s.process(input(i, Some(frame(OFFSETS[i as usize % OFFSETS.len()])), vec![face(0.01)])).unwrap();
            decisions.extend(out.decisions);
        }
        assert_eq!(decisions.len(), 1, "{decisions:?}");
        assert_eq!(decisions[0].status, AttendanceStatus::Present);
        assert!(s.tracker().track(1).unwrap().is_accepted());
        // Reinforcement stored the probe alongside the three enrolled samples.
        assert_eq!(s.repository().descriptors(&IdentityId::from("U1")).unwrap().len(), 4);
    }

    #[test]
    fn test_identity_not_reannounced_on_new_track() {
        let mut s = session(config());
        for i in 0..20 {
            s.process(input(i, Some(frame(OFFSETS[i as usize % OFFSETS.len()])), vec![face(0.01)])).unwrap();
        }
        // Face leaves long enough for the track to expire, then returns.
        for i in 20..27 {
            s.process(input(i, None, vec![])).unwrap();
        }
        assert!(s.tracker().is_empty());
        let out = s.process(input(27, Some(frame(3)), vec![face(0.01)])).unwrap();
        assert!(out.decisions.is_empty());
        assert!(out.faces[0].accepted);
    }

    #[test]
    fn test_dark_frames_do_not_feed_liveness() {
        let mut s = session(config());
        let black = Frame::new(vec![0; 32 * 32], 32, 32).unwrap();
        for i in 0..10 {
            let out = s.process(input(i, Some(black.clone()), vec![face(0.01)])).unwrap();
            assert!(out.dark);
            assert!(out.decisions.is_empty());
        }
    }

    #[test]
    fn test_stop_refuses_frames() {
        let mut s = session(config());
        s.process(input(0, None, vec![face(0.01)])).unwrap();
        s.stop();
        assert!(s.tracker().is_empty());
        assert_eq!(s.process(input(1, None, vec![])).unwrap_err(), SessionError::Stopped);
    }

    #[test]
    fn test_challenge_mode_waits_for_window() {
        let mut cfg = config();
        cfg.liveness.mode = LivenessMode::Challenge;
        let mut s = session(cfg);
        // Nothing is decided while the challenge window is open.
        for i in 0..5 {
            let out = s.process(input(i, Some(frame(OFFSETS[i as usize])), vec![face(0.01)])).unwrap();
            assert!(out.decisions.is_empty());
        }
    }

    #[test]
    fn test_completed_smile_challenge_records_presence() {
        let mut cfg = config();
        cfg.liveness.mode = LivenessMode::Challenge;
        cfg.liveness.plan = ChallengePlan::Sequence(vec![ChallengeKind::Smile]);
        let mut s = session(cfg);
        let smiling = Detection {
            expressions: Some(Expressions {
                happy: 0.9,
                ..Expressions::default()
            }),
            ..face(0.01)
        };

        let mut decided_at = Vec::new();
        let mut decisions = Vec::new();
        for i in 0..25 {
            let f = frame(OFFSETS[i as usize % OFFSETS.len()]);
            let out = s.process(input(i, Some(f), vec![smiling.clone()])).unwrap();
            if !out.decisions.is_empty() {
                decided_at.push(i);
            }
            decisions.extend(out.decisions);
        }

        // The 2 s smile window opened at frame 0 closes at frame 20.
        assert_eq!(decided_at, vec![20]);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].status, AttendanceStatus::Present);
        assert_eq!(decisions[0].identity_id, Some(IdentityId::from("U1")));
        let challenge = decisions[0].liveness.as_ref().unwrap().challenge.as_ref().unwrap();
        assert!(challenge.verified);
        assert_eq!(challenge.outcomes[0].kind, ChallengeKind::Smile);
    }

    /// Counts gallery snapshots, one per frame in which recognition ran.
    struct CountingStore {
        inner: MemoryStore,
        snapshots: Cell<usize>,
    }

    impl DescriptorStore for CountingStore {
        fn samples_for(&self, identity: &IdentityId) -> Result<Vec<DescriptorSample>, RepositoryError> {
            self.inner.samples_for(identity)
        }
        fn all_samples(&self) -> Result<Vec<DescriptorSample>, RepositoryError> {
            self.snapshots.set(self.snapshots.get() + 1);
            self.inner.all_samples()
        }
        fn insert(&mut self, sample: &DescriptorSample) -> Result<(), RepositoryError> {
            self.inner.insert(sample)
        }
        fn delete(&mut self, ids: &[Uuid]) -> Result<usize, RepositoryError> {
            self.inner.delete(ids)
        }
        fn delete_identity(&mut self, identity: &IdentityId) -> Result<usize, RepositoryError> {
            self.inner.delete_identity(identity)
        }
    }

    /// Textured 96x32 frame with room for three faces side by side.
    fn wide_frame(offset: u8) -> Frame {
        let data = (0..96u32 * 32)
            .map(|i| ((i * 37) % 200) as u8 + 20 + offset)
            .collect();
        Frame::new(data, 96, 32).unwrap()
    }

    fn face_at(x: f32, v: f32) -> Detection {
        Detection {
            bounding_box: BoundingBox::new(x, 4.0, 24.0, 24.0),
            ..face(v)
        }
    }

    #[test]
    fn test_classroom_cadence_with_several_faces() {
        let mut cfg = config();
        cfg.tracker = TrackerConfig::classroom();
        let store = CountingStore {
            inner: MemoryStore::new(),
            snapshots: Cell::new(0),
        };
        let mut repo = DescriptorRepository::new(store, cfg.repository);
        for (identity, base) in [("U1", 0.0), ("U2", 1.0)] {
            for step in [0.0, 0.02, 0.04] {
                repo.enroll(&IdentityId::from(identity), &desc(base + step), 0.9, None)
                    .unwrap();
            }
        }
        let mut s = AttendanceSession::new(repo, cfg, StdRng::seed_from_u64(4));

        let mut decisions = Vec::new();
        for i in 0..12 {
            let f = wide_frame(OFFSETS[i as usize % OFFSETS.len()]);
            let faces = vec![face_at(4.0, 0.01), face_at(36.0, 1.01), face_at(68.0, -2.0)];
            let out = s.process(input(i, Some(f), faces)).unwrap();
            assert_eq!(out.faces.len(), 3);
            decisions.extend(out.decisions);
        }

        // Recognition ran on frames 0, 3, 6 and 9 only.
        assert_eq!(s.repository().store().snapshots.get(), 4);
        assert_eq!(s.tracker().len(), 3);

        assert_eq!(decisions.len(), 3, "{decisions:?}");
        for identity in ["U1", "U2"] {
            let mine: Vec<_> = decisions
                .iter()
                .filter(|d| d.identity_id == Some(IdentityId::from(identity)))
                .collect();
            assert_eq!(mine.len(), 1);
            assert_eq!(mine[0].status, AttendanceStatus::Present);
        }
        let stranger: Vec<_> = decisions.iter().filter(|d| d.identity_id.is_none()).collect();
        assert_eq!(stranger.len(), 1);
        assert_eq!(stranger[0].rejection, Some(RejectionReason::NoMatch));
        assert_eq!(stranger[0].track_id, Some(3));
    }

    struct BrokenStore;

    impl DescriptorStore for BrokenStore {
        fn samples_for(&self, _: &IdentityId) -> Result<Vec<DescriptorSample>, RepositoryError> {
            Err(RepositoryError::Unavailable("disk gone".into()))
        }
        fn all_samples(&self) -> Result<Vec<DescriptorSample>, RepositoryError> {
            Err(RepositoryError::Unavailable("disk gone".into()))
        }
        fn insert(&mut self, _: &DescriptorSample) -> Result<(), RepositoryError> {
            Err(RepositoryError::Unavailable("disk gone".into()))
        }
        fn delete(&mut self, _: &[Uuid]) -> Result<usize, RepositoryError> {
            Err(RepositoryError::Unavailable("disk gone".into()))
        }
        fn delete_identity(&mut self, _: &IdentityId) -> Result<usize, RepositoryError> {
            Err(RepositoryError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn test_repository_failure_fails_closed() {
        let cfg = config();
        let repo = DescriptorRepository::new(BrokenStore, cfg.repository);
        let mut s = AttendanceSession::new(repo, cfg, StdRng::seed_from_u64(1));
        let out = s.process(input(0, None, vec![face(0.01)])).unwrap();
        assert!(out.repository_error.is_some());
        assert_eq!(out.decisions.len(), 1);
        assert_eq!(out.decisions[0].status, AttendanceStatus::Unauthorized);
        assert_eq!(
            out.decisions[0].rejection,
            Some(RejectionReason::RepositoryUnavailable)
        );
    }
}
