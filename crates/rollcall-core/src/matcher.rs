//! Ensemble descriptor matching against a repository snapshot.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::{DescriptorRepository, DescriptorStore, Gallery};
use crate::types::{Descriptor, IdentityId};
use crate::vector::VectorError;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.45;
pub const DEFAULT_ACCEPT_THRESHOLD: f32 = 0.40;
pub const DEFAULT_ENSEMBLE_SIZE: usize = 3;
pub const DEFAULT_TIE_MARGIN: f32 = 0.02;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor dimension mismatch for identity {identity}: probe {probe}, stored {stored}")]
    DimensionMismatch {
        identity: IdentityId,
        probe: usize,
        stored: usize,
    },
    #[error("descriptor repository unavailable: {0}")]
    RepositoryUnavailable(String),
}

/// Outcome of matching one probe descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Accepted identity, `None` when nothing was within the accept threshold.
    pub identity_id: Option<IdentityId>,
    /// `1 - avg_distance` when accepted, otherwise 0.
    pub confidence: f32,
    /// Winner's descriptors closer than the match threshold.
    pub match_count: usize,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            identity_id: None,
            confidence: 0.0,
            match_count: 0,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Per-descriptor distance counted toward `match_count`.
    pub match_threshold: f32,
    /// Ensemble average distance must be strictly below this to accept.
    pub accept_threshold: f32,
    /// Number of nearest samples averaged per identity.
    pub ensemble_size: usize,
    /// Average distances this close are considered tied.
    pub tie_margin: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            ensemble_size: DEFAULT_ENSEMBLE_SIZE,
            tie_margin: DEFAULT_TIE_MARGIN,
        }
    }
}

/// Strategy for resolving a probe descriptor against a gallery snapshot.
pub trait Matcher {
    fn identify(&self, probe: &Descriptor, gallery: &Gallery) -> Result<MatchResult, MatchError>;
}

/// Scores each identity by the mean of its `ensemble_size` nearest samples.
#[derive(Debug, Clone, Default)]
pub struct EnsembleMatcher {
    config: MatcherConfig,
}

/// Per-identity score during a matching pass.
#[derive(Debug, Clone)]
struct Candidate<'a> {
    identity: &'a IdentityId,
    avg_distance: f32,
    match_count: usize,
}

impl EnsembleMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Pull a fresh snapshot and match against it.
    ///
    /// Fails closed: a snapshot error is reported as
    /// [`MatchError::RepositoryUnavailable`], never as a match.
    pub fn match_descriptor<S: DescriptorStore>(
        &self,
        repository: &DescriptorRepository<S>,
        probe: &Descriptor,
    ) -> Result<MatchResult, MatchError> {
        let gallery = repository
            .snapshot()
            .map_err(|e| MatchError::RepositoryUnavailable(e.to_string()))?;
        self.identify(probe, &gallery)
    }

    fn score<'a>(
        &self,
        probe: &Descriptor,
        identity: &'a IdentityId,
        stored: &[Descriptor],
    ) -> Result<Candidate<'a>, MatchError> {
        let mut distances = Vec::with_capacity(stored.len());
        for descriptor in stored {
            let d = probe.distance(descriptor).map_err(|e| match e {
                VectorError::DimensionMismatch { left, right } => MatchError::DimensionMismatch {
                    identity: identity.clone(),
                    probe: left,
                    stored: right,
                },
                // Descriptor construction already rules these out.
                other => MatchError::RepositoryUnavailable(other.to_string()),
            })?;
            distances.push(d);
        }
        distances.sort_by(|a, b| a.total_cmp(b));

        let take = self.config.ensemble_size.max(1).min(distances.len());
        let avg_distance = distances[..take].iter().sum::<f32>() / take as f32;
        let match_count = distances
            .iter()
            .filter(|&&d| d < self.config.match_threshold)
            .count();

        Ok(Candidate {
            identity,
            avg_distance,
            match_count,
        })
    }

    /// Whether `challenger` should replace the current best.
    fn beats(&self, challenger: &Candidate<'_>, best: &Candidate<'_>) -> bool {
        let gap = challenger.avg_distance - best.avg_distance;
        if gap.abs() <= self.config.tie_margin {
            match challenger.match_count.cmp(&best.match_count) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => gap < 0.0,
            }
        } else {
            gap < 0.0
        }
    }
}

impl Matcher for EnsembleMatcher {
    fn identify(&self, probe: &Descriptor, gallery: &Gallery) -> Result<MatchResult, MatchError> {
        let mut best: Option<Candidate<'_>> = None;

        for (identity, stored) in gallery.iter() {
            if stored.is_empty() {
                continue;
            }
            let candidate = self.score(probe, identity, stored)?;
            let replace = match &best {
                None => true,
                Some(current) => self.beats(&candidate, current),
            };
            if replace {
                best = Some(candidate);
            }
        }

        let Some(winner) = best else {
            return Ok(MatchResult::no_match());
        };

        if winner.avg_distance < self.config.accept_threshold {
            tracing::debug!(
                identity = %winner.identity,
                avg_distance = winner.avg_distance,
                match_count = winner.match_count,
                "match accepted"
            );
            Ok(MatchResult {
                identity_id: Some(winner.identity.clone()),
                confidence: 1.0 - winner.avg_distance,
                match_count: winner.match_count,
            })
        } else {
            tracing::debug!(
                nearest = %winner.identity,
                avg_distance = winner.avg_distance,
                threshold = self.config.accept_threshold,
                "no identity within accept threshold"
            );
            Ok(MatchResult::no_match())
        }
    }
}
