//! tierscale-stateful — stable identity for the stateful tier.
//!
//! An `IdentityAllocator` owns one stateful service. It keeps exactly N
//! replicas with ordinals `0..N`, each bound to its own storage volume, and
//! moves them one ordinal at a time under a per-service sequencer:
//!
//! ```text
//! startup   0 ─Ready─> 1 ─Ready─> 2 ...      (k starts once k-1 is Ready)
//! teardown  ... 2 ─Gone─> 1 ─Gone─> 0        (k stops once k+1 is Gone)
//! ```
//!
//! Bindings are persisted in the state store and outlive both the replica
//! and the control plane; a later scale-up to the same ordinal reattaches
//! the same volume.

pub mod allocator;
pub mod error;
pub mod storage;

pub use allocator::{IdentityAllocator, Transition};
pub use error::{AllocatorError, AllocatorResult};
pub use storage::StorageProvider;
