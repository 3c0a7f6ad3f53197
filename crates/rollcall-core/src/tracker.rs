//! Multi-face tracking across frames.
//!
//! Detections are associated greedily to existing tracks (largest faces
//! first), preferring the highest IoU and falling back to the nearest centre
//! within `max_displacement`. Recognition is batched: every face due for
//! recognition in a frame is handed to the caller's recogniser in one call.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::matcher::{MatchError, MatchResult};
use crate::types::{BoundingBox, Descriptor, Detection, IdentityId};

pub const DEFAULT_MAX_FACES: usize = 5;
pub const CLASSROOM_MAX_FACES: usize = 60;
pub const DEFAULT_MAX_MISSES: u32 = 5;
pub const DEFAULT_MAX_DISPLACEMENT: f32 = 80.0;

pub type TrackId = u64;

/// Result of recognising one tracked face.
pub type Recognition = Result<MatchResult, MatchError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Detections beyond this many (smallest first) are ignored.
    pub max_faces: usize,
    /// Tracks unmatched for more than this many consecutive updates are dropped.
    pub max_misses: u32,
    /// Maximum centre movement (pixels) between frames for association.
    pub max_displacement: f32,
    /// Run recognition for a track at most once every N frames (1 = every frame).
    pub recognize_every: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_faces: DEFAULT_MAX_FACES,
            max_misses: DEFAULT_MAX_MISSES,
            max_displacement: DEFAULT_MAX_DISPLACEMENT,
            recognize_every: 1,
        }
    }
}

impl TrackerConfig {
    /// Many faces, recognition every third frame.
    pub fn classroom() -> Self {
        Self {
            max_faces: CLASSROOM_MAX_FACES,
            recognize_every: 3,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: TrackId,
    pub last_bounding_box: BoundingBox,
    pub last_seen_frame: u64,
    pub last_identity: Option<IdentityId>,
    pub last_confidence: f32,
    pub miss_count: u32,
    last_recognized_frame: Option<u64>,
    accepted: bool,
}

impl Track {
    fn new(track_id: TrackId, bbox: BoundingBox, frame_index: u64) -> Self {
        Self {
            track_id,
            last_bounding_box: bbox,
            last_seen_frame: frame_index,
            last_identity: None,
            last_confidence: 0.0,
            miss_count: 0,
            last_recognized_frame: None,
            accepted: false,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    fn recognition_due(&self, frame_index: u64, every: u64) -> bool {
        if self.accepted {
            return false;
        }
        match self.last_recognized_frame {
            None => true,
            Some(last) => frame_index.saturating_sub(last) >= every.max(1),
        }
    }
}

/// One face in the current frame, bound to a track.
#[derive(Debug, Clone)]
pub struct TrackedFace {
    pub track_id: TrackId,
    pub bounding_box: BoundingBox,
    pub detection: Detection,
    /// Set only on frames where recognition ran for this track.
    pub match_result: Option<Recognition>,
    /// The track already produced an accepted decision this session.
    pub accepted: bool,
    pub is_new: bool,
}

/// Faces for this frame plus tracks that expired during the update.
#[derive(Debug, Clone, Default)]
pub struct TrackerUpdate {
    pub faces: Vec<TrackedFace>,
    pub expired: Vec<TrackId>,
}

#[derive(Debug)]
pub struct FaceTracker {
    config: TrackerConfig,
    tracks: BTreeMap<TrackId, Track>,
    next_track_id: TrackId,
}

impl FaceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_track_id: 1,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Associate detections to tracks and recognise the faces that are due.
    ///
    /// `recognize` is called at most once, with the descriptors of every face
    /// due this frame, and must return one result per descriptor in order.
    pub fn update<F>(&mut self, detections: Vec<Detection>, frame_index: u64, recognize: F) -> TrackerUpdate
    where
        F: FnOnce(&[&Descriptor]) -> Vec<Recognition>,
    {
        let mut detections = detections;
        detections.sort_by(|a, b| b.bounding_box.area().total_cmp(&a.bounding_box.area()));
        if detections.len() > self.config.max_faces {
            tracing::debug!(
                detected = detections.len(),
                max_faces = self.config.max_faces,
                "dropping smallest faces over capacity"
            );
            detections.truncate(self.config.max_faces);
        }

        let mut unassigned: Vec<TrackId> = self.tracks.keys().copied().collect();
        let mut faces = Vec::with_capacity(detections.len());

        for detection in detections {
            let bbox = detection.bounding_box;
            let (track_id, is_new) = match self.associate(&bbox, &unassigned) {
                Some(id) => {
                    unassigned.retain(|&t| t != id);
                    (id, false)
                }
                None => {
                    let id = self.next_track_id;
                    self.next_track_id += 1;
                    self.tracks.insert(id, Track::new(id, bbox, frame_index));
                    tracing::debug!(track_id = id, frame_index, "track created");
                    (id, true)
                }
            };

            let Some(track) = self.tracks.get_mut(&track_id) else {
                continue;
            };
            track.last_bounding_box = bbox;
            track.last_seen_frame = frame_index;
            track.miss_count = 0;

            faces.push(TrackedFace {
                track_id,
                bounding_box: bbox,
                detection,
                match_result: None,
                accepted: track.accepted,
                is_new,
            });
        }

        let mut expired = Vec::new();
        for id in unassigned {
            if let Some(track) = self.tracks.get_mut(&id) {
                track.miss_count += 1;
                if track.miss_count > self.config.max_misses {
                    expired.push(id);
                }
            }
        }
        for id in &expired {
            self.tracks.remove(id);
            tracing::debug!(track_id = id, "track expired");
        }

        self.recognize_due(&mut faces, frame_index, recognize);

        TrackerUpdate { faces, expired }
    }

    fn associate(&self, bbox: &BoundingBox, candidates: &[TrackId]) -> Option<TrackId> {
        let mut best: Option<(TrackId, f32, f32)> = None;
        for id in candidates {
            let Some(track) = self.tracks.get(id) else {
                continue;
            };
            let displacement = bbox.center_distance(&track.last_bounding_box);
            if displacement > self.config.max_displacement {
                continue;
            }
            let iou = bbox.iou(&track.last_bounding_box);
            let better = match best {
                None => true,
                Some((_, best_iou, best_disp)) => {
                    iou > best_iou || (iou == best_iou && displacement < best_disp)
                }
            };
            if better {
                best = Some((*id, iou, displacement));
            }
        }
        best.map(|(id, _, _)| id)
    }

    fn recognize_due<F>(&mut self, faces: &mut [TrackedFace], frame_index: u64, recognize: F)
    where
        F: FnOnce(&[&Descriptor]) -> Vec<Recognition>,
    {
        let every = self.config.recognize_every;
        let due: Vec<usize> = faces
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                self.tracks
                    .get(&f.track_id)
                    .is_some_and(|t| t.recognition_due(frame_index, every))
            })
            .map(|(i, _)| i)
            .collect();
        if due.is_empty() {
            return;
        }

        let batch: Vec<&Descriptor> = due.iter().map(|&i| &faces[i].detection.descriptor).collect();
        let results = recognize(&batch);
        if results.len() != due.len() {
            tracing::warn!(
                expected = due.len(),
                got = results.len(),
                "recogniser returned wrong number of results; skipping frame"
            );
            return;
        }

        for (idx, result) in due.into_iter().zip(results) {
            let face = &mut faces[idx];
            if let Some(track) = self.tracks.get_mut(&face.track_id) {
                track.last_recognized_frame = Some(frame_index);
                if let Ok(m) = &result {
                    track.last_identity = m.identity_id.clone();
                    track.last_confidence = m.confidence;
                }
            }
            face.match_result = Some(result);
        }
    }

    /// Record that a track produced an accepted decision; it will not be
    /// recognised again this session but keeps updating its box.
    pub fn mark_accepted(&mut self, track_id: TrackId) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            track.accepted = true;
        }
    }

    pub fn track(&self, track_id: TrackId) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Discard all tracks (session stop/reset).
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_track_id = 1;
    }
}
