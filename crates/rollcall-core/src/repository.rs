//! Per-identity descriptor repository with bounded, ranked retention.
//!
//! The repository owns the lifecycle of [`DescriptorSample`]s: samples are
//! appended by `learn`/`enroll` and deleted only by eviction or explicit
//! identity removal. Persistence is delegated to a [`DescriptorStore`], so the
//! same policy runs over the in-memory store used in tests and the SQLite
//! store used by the daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Descriptor, IdentityId, DESCRIPTOR_DIM};

pub const DEFAULT_MAX_DESCRIPTORS_PER_IDENTITY: usize = 20;
pub const DEFAULT_MIN_CONFIDENCE_TO_LEARN: f32 = 0.65;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("descriptor store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid descriptor: expected {expected} dimensions, got {actual}")]
    InvalidDescriptor { expected: usize, actual: usize },
    #[error("invalid confidence value: {0}")]
    InvalidConfidence(f32),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A stored descriptor with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSample {
    pub id: Uuid,
    pub identity_id: IdentityId,
    pub descriptor: Descriptor,
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
    pub source_image_ref: Option<String>,
}

/// Order by `(confidence desc, captured_at desc)`; best sample first.
pub fn rank_order(a: &DescriptorSample, b: &DescriptorSample) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.captured_at.cmp(&a.captured_at))
}

/// Backing storage for descriptor samples.
///
/// Implementations only persist what they are told; ranking and eviction
/// live in [`DescriptorRepository`].
pub trait DescriptorStore {
    fn samples_for(&self, identity: &IdentityId) -> Result<Vec<DescriptorSample>, RepositoryError>;
    fn all_samples(&self) -> Result<Vec<DescriptorSample>, RepositoryError>;
    fn insert(&mut self, sample: &DescriptorSample) -> Result<(), RepositoryError>;
    fn delete(&mut self, ids: &[Uuid]) -> Result<usize, RepositoryError>;
    fn delete_identity(&mut self, identity: &IdentityId) -> Result<usize, RepositoryError>;
}

/// Chooses which samples of one identity to drop when it exceeds capacity.
pub trait EvictionPolicy: Send + Sync {
    /// Sort `samples` best-first according to this policy.
    fn rank(&self, samples: &mut [DescriptorSample]);

    /// IDs of the samples that fall outside the top `capacity`.
    fn select_evictions(&self, samples: &[DescriptorSample], capacity: usize) -> Vec<Uuid> {
        let mut ranked = samples.to_vec();
        self.rank(&mut ranked);
        ranked.iter().skip(capacity).map(|s| s.id).collect()
    }
}

/// Keep the highest-confidence samples, newest first on ties.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfidenceRanked;

impl EvictionPolicy for ConfidenceRanked {
    fn rank(&self, samples: &mut [DescriptorSample]) {
        samples.sort_by(rank_order);
    }
}

/// Keep the most recently captured samples regardless of confidence.
#[derive(Debug, Default, Clone, Copy)]
pub struct MostRecent;

impl EvictionPolicy for MostRecent {
    fn rank(&self, samples: &mut [DescriptorSample]) {
        samples.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Hard cap on samples retained per identity.
    pub max_descriptors_per_identity: usize,
    /// `learn` ignores recognitions below this confidence.
    pub min_confidence_to_learn: f32,
    /// Required descriptor length.
    pub descriptor_dim: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_descriptors_per_identity: DEFAULT_MAX_DESCRIPTORS_PER_IDENTITY,
            min_confidence_to_learn: DEFAULT_MIN_CONFIDENCE_TO_LEARN,
            descriptor_dim: DESCRIPTOR_DIM,
        }
    }
}

/// Point-in-time copy of every identity's descriptors, best-ranked first.
///
/// Identities are kept in a `BTreeMap` so matching visits them in a stable
/// order.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: BTreeMap<IdentityId, Vec<Descriptor>>,
}

impl Gallery {
    pub fn new(entries: BTreeMap<IdentityId, Vec<Descriptor>>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityId, &[Descriptor])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn get(&self, identity: &IdentityId) -> Option<&[Descriptor]> {
        self.entries.get(identity).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct DescriptorRepository<S> {
    store: S,
    config: RepositoryConfig,
    policy: Box<dyn EvictionPolicy>,
}

impl<S: DescriptorStore> DescriptorRepository<S> {
    pub fn new(store: S, config: RepositoryConfig) -> Self {
        Self::with_policy(store, config, Box::new(ConfidenceRanked))
    }

    pub fn with_policy(store: S, config: RepositoryConfig, policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            store,
            config,
            policy,
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reinforce an identity with a recognised descriptor.
    ///
    /// Returns `Ok(false)` without touching the store when `confidence` is
    /// below the learning threshold.
    pub fn learn(
        &mut self,
        identity: &IdentityId,
        descriptor: &Descriptor,
        confidence: f32,
        image_ref: Option<String>,
    ) -> Result<bool, RepositoryError> {
        self.learn_at(identity, descriptor, confidence, image_ref, Utc::now())
    }

    pub fn learn_at(
        &mut self,
        identity: &IdentityId,
        descriptor: &Descriptor,
        confidence: f32,
        image_ref: Option<String>,
        captured_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        if !confidence.is_finite() || confidence < self.config.min_confidence_to_learn {
            tracing::debug!(
                identity = %identity,
                confidence,
                min = self.config.min_confidence_to_learn,
                "learn: below confidence threshold, ignored"
            );
            return Ok(false);
        }
        self.append(identity, descriptor, confidence, image_ref, captured_at)?;
        Ok(true)
    }

    /// Explicit enrollment: stores the sample regardless of the learning
    /// threshold, still subject to the per-identity cap.
    pub fn enroll(
        &mut self,
        identity: &IdentityId,
        descriptor: &Descriptor,
        confidence: f32,
        image_ref: Option<String>,
    ) -> Result<Uuid, RepositoryError> {
        if !confidence.is_finite() {
            return Err(RepositoryError::InvalidConfidence(confidence));
        }
        self.append(identity, descriptor, confidence, image_ref, Utc::now())
    }

    fn append(
        &mut self,
        identity: &IdentityId,
        descriptor: &Descriptor,
        confidence: f32,
        image_ref: Option<String>,
        captured_at: DateTime<Utc>,
    ) -> Result<Uuid, RepositoryError> {
        if descriptor.dim() != self.config.descriptor_dim {
            return Err(RepositoryError::InvalidDescriptor {
                expected: self.config.descriptor_dim,
                actual: descriptor.dim(),
            });
        }

        let sample = DescriptorSample {
            id: Uuid::new_v4(),
            identity_id: identity.clone(),
            descriptor: descriptor.clone(),
            confidence: confidence.clamp(0.0, 1.0),
            captured_at,
            source_image_ref: image_ref,
        };
        self.store.insert(&sample)?;
        let evicted = self.evict(identity)?;

        tracing::debug!(
            identity = %identity,
            sample_id = %sample.id,
            confidence = sample.confidence,
            evicted,
            "descriptor sample stored"
        );
        Ok(sample.id)
    }

    /// Enforce the per-identity cap. Evicted samples are deleted, not archived.
    pub fn evict(&mut self, identity: &IdentityId) -> Result<usize, RepositoryError> {
        let samples = self.store.samples_for(identity)?;
        let doomed = self
            .policy
            .select_evictions(&samples, self.config.max_descriptors_per_identity);
        if doomed.is_empty() {
            return Ok(0);
        }
        self.store.delete(&doomed)
    }

    /// All samples for one identity, best-ranked first.
    pub fn samples(&self, identity: &IdentityId) -> Result<Vec<DescriptorSample>, RepositoryError> {
        let mut samples = self.store.samples_for(identity)?;
        self.policy.rank(&mut samples);
        Ok(samples)
    }

    /// Descriptors for one identity, best-ranked first; empty if unknown.
    pub fn descriptors(&self, identity: &IdentityId) -> Result<Vec<Descriptor>, RepositoryError> {
        Ok(self
            .samples(identity)?
            .into_iter()
            .map(|s| s.descriptor)
            .collect())
    }

    /// Fresh snapshot of every identity's descriptors for one matching pass.
    pub fn snapshot(&self) -> Result<Gallery, RepositoryError> {
        let mut grouped: BTreeMap<IdentityId, Vec<DescriptorSample>> = BTreeMap::new();
        for sample in self.store.all_samples()? {
            grouped
                .entry(sample.identity_id.clone())
                .or_default()
                .push(sample);
        }

        let entries = grouped
            .into_iter()
            .map(|(id, mut samples)| {
                self.policy.rank(&mut samples);
                (id, samples.into_iter().map(|s| s.descriptor).collect())
            })
            .collect();
        Ok(Gallery::new(entries))
    }

    /// Identities with their sample counts, sorted by identity.
    pub fn identities(&self) -> Result<Vec<(IdentityId, usize)>, RepositoryError> {
        let mut counts: BTreeMap<IdentityId, usize> = BTreeMap::new();
        for sample in self.store.all_samples()? {
            *counts.entry(sample.identity_id).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    pub fn remove_identity(&mut self, identity: &IdentityId) -> Result<usize, RepositoryError> {
        let removed = self.store.delete_identity(identity)?;
        tracing::info!(identity = %identity, removed, "identity removed");
        Ok(removed)
    }
}

/// Process-local store. Contents vanish with the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    samples: HashMap<IdentityId, Vec<DescriptorSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DescriptorStore for MemoryStore {
    fn samples_for(&self, identity: &IdentityId) -> Result<Vec<DescriptorSample>, RepositoryError> {
        Ok(self.samples.get(identity).cloned().unwrap_or_default())
    }

    fn all_samples(&self) -> Result<Vec<DescriptorSample>, RepositoryError> {
        Ok(self.samples.values().flatten().cloned().collect())
    }

    fn insert(&mut self, sample: &DescriptorSample) -> Result<(), RepositoryError> {
        self.samples
            .entry(sample.identity_id.clone())
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    fn delete(&mut self, ids: &[Uuid]) -> Result<usize, RepositoryError> {
        let mut removed = 0;
        for samples in self.samples.values_mut() {
            let before = samples.len();
            samples.retain(|s| !ids.contains(&s.id));
            removed += before - samples.len();
        }
        self.samples.retain(|_, v| !v.is_empty());
        Ok(removed)
    }

    fn delete_identity(&mut self, identity: &IdentityId) -> Result<usize, RepositoryError> {
        Ok(self.samples.remove(identity).map_or(0, |v| v.len()))
    }
}
