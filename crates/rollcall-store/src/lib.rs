//! rollcall-store: encrypted SQLite persistence for rollcall.
//!
//! Implements [`rollcall_core::DescriptorStore`] over SQLite with AES-256-GCM
//! encrypted descriptor blobs, plus the attendance decision log.

mod decisions;
pub mod store;

pub use store::{SqliteStore, StoreError};
