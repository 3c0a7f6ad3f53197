use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::cluster::{ClusterEngine, ClusterOptions, ClusterReport, ClusterSample};
use rollcall_core::matcher::MatcherConfig;
use rollcall_core::repository::RepositoryConfig;
use rollcall_core::{Descriptor, DescriptorRepository, EnsembleMatcher, IdentityId};
use rollcall_store::SqliteStore;
use serde::Deserialize;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance operator CLI")]
struct Cli {
    /// SQLite database (default: $ROLLCALL_DB_PATH or $XDG_DATA_HOME/rollcall/rollcall.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one or more descriptors for an identity
    Enroll {
        /// Identity to enroll under
        identity: String,
        /// JSON file holding one descriptor or an array of descriptors
        #[arg(short, long)]
        descriptors: PathBuf,
        #[arg(long, default_value_t = 1.0)]
        confidence: f32,
        /// Reference to the source image, stored with each sample
        #[arg(long)]
        image_ref: Option<String>,
    },
    /// Cluster an unlabelled batch of descriptors for review
    Import {
        /// JSON array of {"descriptor": [...], "metadata": ...}
        input: PathBuf,
        /// Write the cluster report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = 0.6)]
        similarity_threshold: f32,
        #[arg(long, default_value_t = 2)]
        min_cluster_size: usize,
        #[arg(long)]
        max_clusters: Option<usize>,
        /// Merge clusters whose centroids are at least this similar
        #[arg(long)]
        merge_threshold: Option<f32>,
    },
    /// List enrolled identities and their sample counts
    List,
    /// Remove an identity and all of its samples
    Remove {
        identity: String,
    },
    /// Match a descriptor against the enrolled identities
    Match {
        /// JSON file holding one descriptor
        descriptor: PathBuf,
        #[arg(long)]
        accept_threshold: Option<f32>,
    },
    /// Show the attendance log, newest first
    Decisions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Only decisions for this identity, oldest first
        #[arg(long)]
        identity: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);

    match cli.command {
        Commands::Enroll {
            identity,
            descriptors,
            confidence,
            image_ref,
        } => {
            let descriptors = read_descriptors(&descriptors)?;
            let mut repo = open_repository(&db_path)?;
            let identity = IdentityId::new(identity);
            for descriptor in &descriptors {
                repo.enroll(&identity, descriptor, confidence, image_ref.clone())
                    .with_context(|| format!("failed to enroll {identity}"))?;
            }
            let stored = repo.descriptors(&identity)?.len();
            println!(
                "Enrolled {} descriptor(s) for {identity} ({stored} stored)",
                descriptors.len()
            );
        }
        Commands::Import {
            input,
            output,
            similarity_threshold,
            min_cluster_size,
            max_clusters,
            merge_threshold,
        } => {
            let samples = read_cluster_samples(&input)?;
            let options = ClusterOptions {
                max_clusters,
                similarity_threshold,
                min_cluster_size,
            };
            let report = cluster_batch(samples, &options, merge_threshold)?;
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!(
                        "{} cluster(s), {} of {} faces clustered; report written to {}",
                        report.clusters.len(),
                        report.clustered_faces(),
                        report.total_faces,
                        path.display()
                    );
                }
                None => println!("{json}"),
            }
        }
        Commands::List => {
            let repo = open_repository(&db_path)?;
            let identities = repo.identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for (identity, count) in identities {
                println!("{identity}\t{count}");
            }
        }
        Commands::Remove { identity } => {
            let mut repo = open_repository(&db_path)?;
            let removed = repo.remove_identity(&IdentityId::new(identity.as_str()))?;
            if removed == 0 {
                bail!("no samples stored for {identity}");
            }
            println!("Removed {identity} ({removed} samples)");
        }
        Commands::Match {
            descriptor,
            accept_threshold,
        } => {
            let probe = read_single_descriptor(&descriptor)?;
            let repo = open_repository(&db_path)?;
            let mut config = MatcherConfig::default();
            if let Some(t) = accept_threshold {
                config.accept_threshold = t;
            }
            let result = EnsembleMatcher::new(config)
                .match_descriptor(&repo, &probe)
                .context("matching failed")?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Decisions { limit, identity } => {
            let store = SqliteStore::open(&db_path)
                .with_context(|| format!("failed to open store at {}", db_path.display()))?;
            let decisions = match identity {
                Some(id) => store.decisions_for(&IdentityId::new(id))?,
                None => store.recent_decisions(limit)?,
            };
            for d in decisions {
                println!(
                    "{}\t{}\t{}\t{:.3}\t{}",
                    d.timestamp.to_rfc3339(),
                    d.identity_id.as_ref().map(IdentityId::as_str).unwrap_or("-"),
                    d.status,
                    d.confidence,
                    d.rejection.map(|r| r.as_str()).unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/rollcall.db")
}

fn open_repository(db_path: &Path) -> Result<DescriptorRepository<SqliteStore>> {
    let store = SqliteStore::open(db_path)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    Ok(DescriptorRepository::new(store, RepositoryConfig::default()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    One(Descriptor),
    Many(Vec<Descriptor>),
}

fn parse_descriptors(json: &str) -> Result<Vec<Descriptor>> {
    let parsed: DescriptorFile =
        serde_json::from_str(json).context("expected a descriptor or an array of descriptors")?;
    let descriptors = match parsed {
        DescriptorFile::One(d) => vec![d],
        DescriptorFile::Many(ds) => ds,
    };
    if descriptors.is_empty() {
        bail!("no descriptors given");
    }
    Ok(descriptors)
}

fn read_descriptors(path: &Path) -> Result<Vec<Descriptor>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_descriptors(&json).with_context(|| format!("invalid descriptor file {}", path.display()))
}

fn read_single_descriptor(path: &Path) -> Result<Descriptor> {
    let mut descriptors = read_descriptors(path)?;
    if descriptors.len() != 1 {
        bail!("{} holds {} descriptors, expected one", path.display(), descriptors.len());
    }
    Ok(descriptors.remove(0))
}

fn read_cluster_samples(path: &Path) -> Result<Vec<ClusterSample<Value>>> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid sample file {}", path.display()))
}

/// Cluster a batch, optionally merging near-duplicate clusters.
/// The result is a report only; nothing is written to the repository.
fn cluster_batch(
    samples: Vec<ClusterSample<Value>>,
    options: &ClusterOptions,
    merge_threshold: Option<f32>,
) -> Result<ClusterReport<Value>> {
    let engine = ClusterEngine;
    let mut report = engine.cluster(samples, options)?;
    if let Some(threshold) = merge_threshold {
        report.clusters = engine.merge_similar_clusters(report.clusters, threshold)?;
        if !report.clusters.is_empty() {
            report.avg_cluster_size =
                report.clustered_faces() as f32 / report.clusters.len() as f32;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_and_many() {
        assert_eq!(parse_descriptors("[0.1, 0.2, 0.3]").unwrap().len(), 1);
        assert_eq!(parse_descriptors("[[0.1, 0.2], [0.3, 0.4]]").unwrap().len(), 2);
        assert!(parse_descriptors("[]").is_err());
        assert!(parse_descriptors("{\"x\": 1}").is_err());
    }

    #[test]
    fn test_cluster_batch_with_merge() {
        let point = |x: f32, y: f32, tag: &str| ClusterSample {
            descriptor: Descriptor::new(vec![x, y, 0.0]).unwrap(),
            metadata: Value::String(tag.to_string()),
        };
        let samples = vec![
            point(1.0, 0.0, "a1"),
            point(1.05, 0.0, "a2"),
            point(0.0, 1.0, "b1"),
            point(0.0, 1.05, "b2"),
        ];
        let options = ClusterOptions {
            max_clusters: Some(4),
            similarity_threshold: 0.9,
            min_cluster_size: 2,
        };

        let separate = cluster_batch(samples.clone(), &options, None).unwrap();
        assert_eq!(separate.clusters.len(), 2);

        // A permissive merge threshold collapses the two groups.
        let merged = cluster_batch(samples, &options, Some(-1.0)).unwrap();
        assert_eq!(merged.clusters.len(), 1);
        assert_eq!(merged.clusters[0].size, 4);
        assert_eq!(merged.total_faces, 4);
    }
}
