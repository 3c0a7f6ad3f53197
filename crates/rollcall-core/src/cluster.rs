//! Batch grouping of unlabelled descriptors, e.g. for bulk registration.
//!
//! This is greedy single-pass clustering, not k-means. Each unassigned sample
//! seeds a cluster and absorbs every later unassigned sample whose similarity
//! (`1 - distance`) to the seed reaches the threshold. The result depends on
//! input order and is not globally optimal. Clusters are never written into
//! the live repository.

use serde::{Deserialize, Serialize};

use crate::types::Descriptor;
use crate::vector::{self, VectorError};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;
pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 2;
pub const DEFAULT_MERGE_THRESHOLD: f32 = 0.8;

/// An unlabelled descriptor with caller-defined metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSample<M> {
    pub descriptor: Descriptor,
    pub metadata: M,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember<M> {
    pub descriptor: Descriptor,
    pub metadata: M,
    /// Similarity to the cluster centroid.
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster<M> {
    pub id: usize,
    pub centroid: Vec<f32>,
    pub members: Vec<ClusterMember<M>>,
    pub size: usize,
    /// Mean member similarity to the centroid.
    pub avg_confidence: f32,
}

impl<M> Cluster<M> {
    fn from_members(id: usize, members: Vec<ClusterMember<M>>) -> Result<Self, VectorError> {
        let mut cluster = Self {
            id,
            centroid: Vec::new(),
            members,
            size: 0,
            avg_confidence: 0.0,
        };
        cluster.recompute()?;
        Ok(cluster)
    }

    /// Refresh centroid, member similarities and summary fields.
    fn recompute(&mut self) -> Result<(), VectorError> {
        let vectors: Vec<&[f32]> = self.members.iter().map(|m| m.descriptor.values()).collect();
        self.centroid = vector::mean(&vectors)?;
        for member in &mut self.members {
            member.similarity = vector::similarity(member.descriptor.values(), &self.centroid)?;
        }
        self.size = self.members.len();
        let sims: Vec<f32> = self.members.iter().map(|m| m.similarity).collect();
        self.avg_confidence = vector::mean_scalar(&sims).unwrap_or(0.0);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Defaults to `ceil(sqrt(n))` when unset.
    pub max_clusters: Option<usize>,
    pub similarity_threshold: f32,
    pub min_cluster_size: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            max_clusters: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            min_cluster_size: DEFAULT_MIN_CLUSTER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReport<M> {
    pub clusters: Vec<Cluster<M>>,
    /// Samples that did not end up in a kept cluster.
    pub unclustered: Vec<ClusterSample<M>>,
    pub total_faces: usize,
    pub avg_cluster_size: f32,
}

impl<M> ClusterReport<M> {
    pub fn clustered_faces(&self) -> usize {
        self.clusters.iter().map(|c| c.size).sum()
    }

    pub fn unclustered_faces(&self) -> usize {
        self.unclustered.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterEngine;

impl ClusterEngine {
    /// Greedy single-pass clustering of `samples` in input order.
    ///
    /// Clusters smaller than `min_cluster_size` are dissolved; after sorting
    /// by size the list is truncated to `max_clusters`, and members of dropped
    /// clusters are reported as unclustered.
    pub fn cluster<M: Clone>(
        &self,
        samples: Vec<ClusterSample<M>>,
        options: &ClusterOptions,
    ) -> Result<ClusterReport<M>, VectorError> {
        let total_faces = samples.len();
        let max_clusters = options
            .max_clusters
            .unwrap_or_else(|| (total_faces as f64).sqrt().ceil() as usize);

        let mut assigned = vec![false; total_faces];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut leftover: Vec<usize> = Vec::new();

        for seed in 0..total_faces {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut group = vec![seed];

            for other in seed + 1..total_faces {
                if assigned[other] {
                    continue;
                }
                let sim = samples[seed].descriptor.similarity(&samples[other].descriptor)?;
                if sim >= options.similarity_threshold {
                    assigned[other] = true;
                    group.push(other);
                }
            }

            if group.len() >= options.min_cluster_size.max(1) {
                groups.push(group);
            } else {
                leftover.extend(group);
            }
        }

        // Stable sort keeps input order among equal sizes.
        groups.sort_by(|a, b| b.len().cmp(&a.len()));
        if groups.len() > max_clusters {
            for dropped in groups.drain(max_clusters..) {
                leftover.extend(dropped);
            }
        }
        leftover.sort_unstable();

        let mut clusters = Vec::with_capacity(groups.len());
        for (id, group) in groups.into_iter().enumerate() {
            let members = group
                .into_iter()
                .map(|i| ClusterMember {
                    descriptor: samples[i].descriptor.clone(),
                    metadata: samples[i].metadata.clone(),
                    similarity: 0.0,
                })
                .collect();
            clusters.push(Cluster::from_members(id, members)?);
        }
        let unclustered = leftover.into_iter().map(|i| samples[i].clone()).collect();

        let avg_cluster_size = if clusters.is_empty() {
            0.0
        } else {
            clusters.iter().map(|c| c.size).sum::<usize>() as f32 / clusters.len() as f32
        };

        tracing::info!(
            total_faces,
            clusters = clusters.len(),
            avg_cluster_size,
            "clustering complete"
        );

        Ok(ClusterReport {
            clusters,
            unclustered,
            total_faces,
            avg_cluster_size,
        })
    }

    /// Cluster whose centroid is most similar to `descriptor`, if any reaches
    /// `threshold`. Returns the index into `clusters` and the similarity.
    pub fn find_best_cluster<M>(
        &self,
        descriptor: &Descriptor,
        clusters: &[Cluster<M>],
        threshold: f32,
    ) -> Result<Option<(usize, f32)>, VectorError> {
        let mut best: Option<(usize, f32)> = None;
        for (i, cluster) in clusters.iter().enumerate() {
            let sim = vector::similarity(descriptor.values(), &cluster.centroid)?;
            if sim >= threshold && best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }
        Ok(best)
    }

    /// Add a sample to an existing cluster and refresh its centroid.
    pub fn assign<M>(&self, cluster: &mut Cluster<M>, sample: ClusterSample<M>) -> Result<(), VectorError> {
        cluster.members.push(ClusterMember {
            descriptor: sample.descriptor,
            metadata: sample.metadata,
            similarity: 0.0,
        });
        cluster.recompute()
    }

    /// Merge clusters whose centroids have similarity ≥ `merge_threshold`
    /// until no pair qualifies. Each merge removes one cluster, so this
    /// terminates. Result is re-sorted by size and re-numbered.
    pub fn merge_similar_clusters<M>(
        &self,
        clusters: Vec<Cluster<M>>,
        merge_threshold: f32,
    ) -> Result<Vec<Cluster<M>>, VectorError> {
        let mut clusters = clusters;

        'outer: loop {
            for i in 0..clusters.len() {
                for j in i + 1..clusters.len() {
                    let sim = vector::similarity(&clusters[i].centroid, &clusters[j].centroid)?;
                    if sim >= merge_threshold {
                        let absorbed = clusters.remove(j);
                        clusters[i].members.extend(absorbed.members);
                        clusters[i].recompute()?;
                        tracing::debug!(into = clusters[i].id, from = absorbed.id, sim, "clusters merged");
                        continue 'outer;
                    }
                }
            }
            break;
        }

        clusters.sort_by(|a, b| b.size.cmp(&a.size));
        for (id, cluster) in clusters.iter_mut().enumerate() {
            cluster.id = id;
        }
        Ok(clusters)
    }
}
