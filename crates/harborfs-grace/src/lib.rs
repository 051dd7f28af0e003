#![warn(missing_docs)]

//! HarborFS grace subsystem: cluster-wide recovery-window coordination.
//!
//! Replicas share a single grace object in a replicated key-value store. The
//! object carries two epoch counters (the epoch new recovery records are
//! written under, and the epoch clients may reclaim from) plus one flag byte
//! per cluster member. All mutation goes through optimistic
//! read-modify-write transactions keyed on the store's version token, so the
//! coordinator itself holds no locks.

/// Configuration for the grace subsystem.
pub mod config;
/// Grace object mutation and query operations.
pub mod coordinator;
/// Error types for the grace subsystem.
pub mod error;
/// Per-member flag byte model.
pub mod member;
/// Backing-store abstraction and the in-memory implementation.
pub mod store;

pub use config::GraceConfig;
pub use coordinator::{GraceCoordinator, GraceEpochs};
pub use error::{GraceError, Result};
pub use member::MemberFlags;
pub use store::{GraceStore, MemoryGraceStore, StoreError, Version};
