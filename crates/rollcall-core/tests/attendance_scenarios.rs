//! End-to-end attendance scenarios over the public API.
//!
//! Enrollment → matching → liveness verdict → decision → reinforcement.

use chrono::{DateTime, FixedOffset, TimeZone};
use rand::rngs::StdRng;
use rand::SeedableRng;

use rollcall_core::cluster::{ClusterEngine, ClusterOptions, ClusterSample};
use rollcall_core::frame::Frame;
use rollcall_core::liveness::challenge::{verify_blink_sequence, ChallengeConfig, ChallengeDetails};
use rollcall_core::liveness::LivenessVerdict;
use rollcall_core::repository::RepositoryConfig;
use rollcall_core::{
    AttendanceSession, AttendanceStatus, BoundingBox, DecisionOrchestrator, Descriptor, DescriptorRepository,
    Detection, EnsembleMatcher, FrameInput, IdentityId, MemoryStore, RejectionReason, SessionConfig,
    DESCRIPTOR_DIM,
};

fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
    FixedOffset::east_opt(0)
        .unwrap()
        .with_ymd_and_hms(2024, 9, 2, h, m, 0)
        .unwrap()
}

fn base() -> Vec<f32> {
    (0..DESCRIPTOR_DIM).map(|i| ((i % 7) as f32 - 3.0) * 0.02).collect()
}

fn offset(values: &[f32], axis: usize, by: f32) -> Descriptor {
    let mut v = values.to_vec();
    v[axis] += by;
    Descriptor::new(v).unwrap()
}

/// Five descriptors 0.03 from a common base along distinct axes
/// (pairwise ≈ 0.042), plus a probe 0.05 from their centroid.
fn enrolled_u1() -> (DescriptorRepository<MemoryStore>, Descriptor) {
    let mut repo = DescriptorRepository::new(MemoryStore::new(), RepositoryConfig::default());
    let base = base();
    let u1 = IdentityId::from("U1");
    for axis in 0..5 {
        repo.enroll(&u1, &offset(&base, axis, 0.03), 0.85, None).unwrap();
    }

    let mut centroid = base.clone();
    for value in centroid.iter_mut().take(5) {
        *value += 0.006;
    }
    let probe = offset(&centroid, DESCRIPTOR_DIM - 1, 0.05);
    (repo, probe)
}

#[test]
fn test_enrolled_identity_present_before_cutoff() {
    let (mut repo, probe) = enrolled_u1();
    let matcher = EnsembleMatcher::default();
    let orchestrator = DecisionOrchestrator::default();

    let result = matcher.match_descriptor(&repo, &probe).unwrap();
    assert_eq!(result.identity_id, Some(IdentityId::from("U1")));

    let verdict = LivenessVerdict::from_confidence(0.75, 0.6);
    let decision = orchestrator.decide(&result, Some(&verdict), at(8, 30));
    assert_eq!(decision.status, AttendanceStatus::Present);
    assert_eq!(decision.identity_id, Some(IdentityId::from("U1")));
    assert!((decision.confidence - 0.95).abs() < 0.02, "confidence {}", decision.confidence);

    let learned = orchestrator.reinforce(&mut repo, &decision, &probe, None).unwrap();
    assert!(learned);
    assert_eq!(repo.descriptors(&IdentityId::from("U1")).unwrap().len(), 6);
}

#[test]
fn test_same_match_after_cutoff_is_late() {
    let (repo, probe) = enrolled_u1();
    let result = EnsembleMatcher::default().match_descriptor(&repo, &probe).unwrap();
    let verdict = LivenessVerdict::from_confidence(0.75, 0.6);
    let decision = DecisionOrchestrator::default().decide(&result, Some(&verdict), at(9, 15));
    assert_eq!(decision.status, AttendanceStatus::Late);
}

#[test]
fn test_recognised_but_not_live_is_unauthorized() {
    let (mut repo, probe) = enrolled_u1();
    let orchestrator = DecisionOrchestrator::default();
    let result = EnsembleMatcher::default().match_descriptor(&repo, &probe).unwrap();

    let verdict = LivenessVerdict::from_confidence(0.2, 0.6);
    let decision = orchestrator.decide(&result, Some(&verdict), at(8, 30));
    assert_eq!(decision.status, AttendanceStatus::Unauthorized);
    assert_eq!(decision.identity_id, Some(IdentityId::from("U1")));
    assert_eq!(decision.rejection, Some(RejectionReason::SpoofSuspected));

    // Spoofed captures never reach the repository.
    assert!(!orchestrator.reinforce(&mut repo, &decision, &probe, None).unwrap());
    assert_eq!(repo.descriptors(&IdentityId::from("U1")).unwrap().len(), 5);
}

#[test]
fn test_blink_challenge_sequence() {
    let ears = [0.30, 0.28, 0.15, 0.12, 0.27, 0.30, 0.14, 0.29];
    let outcome = verify_blink_sequence(&ears, &ChallengeConfig::default());
    assert!(outcome.verified);
    assert!(matches!(outcome.details, ChallengeDetails::Blink { blink_count: 2, .. }));
}

#[test]
fn test_session_emits_one_decision_per_track() {
    let (repo, probe) = enrolled_u1();
    let mut session = AttendanceSession::new(repo, SessionConfig::default(), StdRng::seed_from_u64(3));

    let offsets = [0u8, 4, 12, 9, 2, 6, 10, 3, 7, 1];
    let mut decisions = Vec::new();
    for i in 0..30u64 {
        let data = (0..48u32 * 48)
            .map(|p| ((p * 37) % 200) as u8 + 20 + offsets[i as usize % offsets.len()])
            .collect();
        let input = FrameInput {
            index: i,
            captured_at: at(8, 30) + chrono::Duration::milliseconds(i as i64 * 100),
            frame: Some(Frame::new(data, 48, 48).unwrap()),
            detections: vec![Detection {
                bounding_box: BoundingBox::new(8.0, 8.0, 32.0, 32.0),
                descriptor: probe.clone(),
                landmarks: None,
                expressions: None,
            }],
        };
        let outcome = session.process(input).unwrap();
        assert_eq!(outcome.faces.len(), 1);
        assert_eq!(outcome.faces[0].track_id, 1);
        decisions.extend(outcome.decisions);
    }

    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].status, AttendanceStatus::Present);
    assert_eq!(decisions[0].track_id, Some(1));
}

#[test]
fn test_bulk_clustering_containment() {
    let base = base();
    let mut samples = Vec::new();
    for (person, shift) in [("a", 0.0f32), ("b", 1.5)] {
        for axis in 0..4 {
            let mut v = base.clone();
            v[10] += shift;
            v[axis] += 0.02;
            samples.push(ClusterSample {
                descriptor: Descriptor::new(v).unwrap(),
                metadata: format!("{person}-{axis}"),
            });
        }
    }
    let mut outlier = base.clone();
    outlier[20] += 5.0;
    samples.push(ClusterSample {
        descriptor: Descriptor::new(outlier).unwrap(),
        metadata: "stranger".to_string(),
    });

    let report = ClusterEngine::default().cluster(samples, &ClusterOptions::default()).unwrap();
    assert_eq!(report.clusters.len(), 2);
    assert!(report.clusters.iter().all(|c| c.size >= 2));
    assert_eq!(report.total_faces, report.clustered_faces() + report.unclustered_faces());
    assert_eq!(report.unclustered_faces(), 1);
}
