//! rollcall-core: attendance check-in engine.
//!
//! Matches detector-supplied face descriptors against an adaptive per-identity
//! repository, tracks faces across frames, gates acceptance on liveness and
//! produces attendance decisions. Face detection and descriptor extraction
//! happen outside this crate.

pub mod cluster;
pub mod decision;
pub mod frame;
pub mod liveness;
pub mod matcher;
pub mod repository;
pub mod session;
pub mod tracker;
pub mod types;
pub mod vector;

pub use decision::{AttendanceDecision, AttendanceStatus, DecisionOrchestrator, RejectionReason};
pub use matcher::{EnsembleMatcher, MatchResult, Matcher};
pub use repository::{DescriptorRepository, DescriptorStore, MemoryStore};
pub use session::{AttendanceSession, FrameInput, FrameOutcome, SessionConfig};
pub use types::{BoundingBox, Descriptor, Detection, IdentityId, DESCRIPTOR_DIM};
