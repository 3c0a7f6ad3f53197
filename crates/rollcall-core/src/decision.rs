//! Attendance decisions from a match result and a liveness verdict.

use chrono::{DateTime, FixedOffset, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::liveness::LivenessVerdict;
use crate::matcher::{MatchError, MatchResult};
use crate::repository::{DescriptorRepository, DescriptorStore, RepositoryError};
use crate::tracker::TrackId;
use crate::types::{Descriptor, IdentityId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Unauthorized,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Unauthorized => "unauthorized",
        }
    }

    pub fn is_accepted(&self) -> bool {
        !matches!(self, AttendanceStatus::Unauthorized)
    }
}

impl fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "unauthorized" => Ok(AttendanceStatus::Unauthorized),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// Why an `unauthorized` decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoMatch,
    SpoofSuspected,
    RepositoryUnavailable,
    InvalidDescriptor,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::NoMatch => "no_match",
            RejectionReason::SpoofSuspected => "spoof_suspected",
            RejectionReason::RepositoryUnavailable => "repository_unavailable",
            RejectionReason::InvalidDescriptor => "invalid_descriptor",
        }
    }
}

impl From<&MatchError> for RejectionReason {
    fn from(e: &MatchError) -> Self {
        match e {
            MatchError::DimensionMismatch { .. } => RejectionReason::InvalidDescriptor,
            MatchError::RepositoryUnavailable(_) => RejectionReason::RepositoryUnavailable,
        }
    }
}

impl FromStr for RejectionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_match" => Ok(RejectionReason::NoMatch),
            "spoof_suspected" => Ok(RejectionReason::SpoofSuspected),
            "repository_unavailable" => Ok(RejectionReason::RepositoryUnavailable),
            "invalid_descriptor" => Ok(RejectionReason::InvalidDescriptor),
            other => Err(format!("unknown rejection reason: {other}")),
        }
    }
}

/// Time of day after which arrivals are late. Compared at minute granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cutoff(NaiveTime);

impl Cutoff {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn time(&self) -> NaiveTime {
        self.0
    }

    /// `now`'s wall-clock (hour, minute) in its own offset is after the cutoff.
    pub fn is_late(&self, now: &DateTime<FixedOffset>) -> bool {
        (now.hour(), now.minute()) > (self.0.hour(), self.0.minute())
    }
}

impl Default for Cutoff {
    fn default() -> Self {
        Self(NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default())
    }
}

impl FromStr for Cutoff {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map(Self)
    }
}

impl TryFrom<String> for Cutoff {
    type Error = chrono::ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Cutoff> for String {
    fn from(c: Cutoff) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Cutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub cutoff: Cutoff,
    /// Reject live-looking faces whose crop texture looks like a print or screen.
    pub reject_on_texture_spoof: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cutoff: Cutoff::default(),
            reject_on_texture_spoof: true,
        }
    }
}

/// The `(identity, status, confidence)` tuple handed to notification sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub identity_id: Option<IdentityId>,
    pub status: AttendanceStatus,
    pub confidence: f32,
}

/// Immutable record of one recognition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceDecision {
    pub id: Uuid,
    pub identity_id: Option<IdentityId>,
    pub status: AttendanceStatus,
    pub confidence: f32,
    /// `None` when the decision was made without assessing liveness.
    pub liveness: Option<LivenessVerdict>,
    /// Set on every `unauthorized` decision.
    pub rejection: Option<RejectionReason>,
    pub track_id: Option<TrackId>,
    pub timestamp: DateTime<FixedOffset>,
}

impl AttendanceDecision {
    pub fn notification(&self) -> Notification {
        Notification {
            identity_id: self.identity_id.clone(),
            status: self.status,
            confidence: self.confidence,
        }
    }

    pub fn with_track(mut self, track_id: TrackId) -> Self {
        self.track_id = Some(track_id);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecisionOrchestrator {
    config: DecisionConfig,
}

impl DecisionOrchestrator {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Decide with the configured cutoff.
    pub fn decide(
        &self,
        match_result: &MatchResult,
        liveness: Option<&LivenessVerdict>,
        now: DateTime<FixedOffset>,
    ) -> AttendanceDecision {
        self.decide_with_cutoff(match_result, liveness, now, self.config.cutoff)
    }

    /// No match is always `unauthorized`. A match without a live verdict
    /// (missing, not live, or texture-flagged under the reject policy) is
    /// `unauthorized` with [`RejectionReason::SpoofSuspected`]. Otherwise
    /// `late` after `cutoff`, else `present`.
    pub fn decide_with_cutoff(
        &self,
        match_result: &MatchResult,
        liveness: Option<&LivenessVerdict>,
        now: DateTime<FixedOffset>,
        cutoff: Cutoff,
    ) -> AttendanceDecision {
        let Some(identity) = match_result.identity_id.clone() else {
            return self.reject(RejectionReason::NoMatch, None, 0.0, liveness.cloned(), now);
        };

        let live = liveness.is_some_and(|v| {
            v.is_live && !(self.config.reject_on_texture_spoof && v.texture_spoof_suspected())
        });
        if !live {
            tracing::warn!(
                identity = %identity,
                confidence = match_result.confidence,
                liveness = ?liveness.map(|v| v.confidence),
                "recognised face failed liveness"
            );
            return self.reject(
                RejectionReason::SpoofSuspected,
                Some(identity),
                match_result.confidence,
                liveness.cloned(),
                now,
            );
        }

        let status = if cutoff.is_late(&now) {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        };
        AttendanceDecision {
            id: Uuid::new_v4(),
            identity_id: Some(identity),
            status,
            confidence: match_result.confidence,
            liveness: liveness.cloned(),
            rejection: None,
            track_id: None,
            timestamp: now,
        }
    }

    /// An `unauthorized` decision for `reason`.
    pub fn reject(
        &self,
        reason: RejectionReason,
        identity: Option<IdentityId>,
        confidence: f32,
        liveness: Option<LivenessVerdict>,
        now: DateTime<FixedOffset>,
    ) -> AttendanceDecision {
        AttendanceDecision {
            id: Uuid::new_v4(),
            identity_id: identity,
            status: AttendanceStatus::Unauthorized,
            confidence,
            liveness,
            rejection: Some(reason),
            track_id: None,
            timestamp: now,
        }
    }

    /// Feed an accepted decision's descriptor back into the repository.
    ///
    /// Returns `Ok(false)` for rejected decisions and for confidences below
    /// the repository's learning threshold.
    pub fn reinforce<S: DescriptorStore>(
        &self,
        repository: &mut DescriptorRepository<S>,
        decision: &AttendanceDecision,
        descriptor: &Descriptor,
        image_ref: Option<String>,
    ) -> Result<bool, RepositoryError> {
        if !decision.status.is_accepted() {
            return Ok(false);
        }
        let Some(identity) = decision.identity_id.as_ref() else {
            return Ok(false);
        };
        repository.learn(identity, descriptor, decision.confidence, image_ref)
    }
}
