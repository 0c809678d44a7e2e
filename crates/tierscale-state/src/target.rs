//! The seam between the autoscaler and whatever owns a tier's instances.

use async_trait::async_trait;

use crate::error::ScaleError;

/// A tier whose replica count can be observed and commanded.
///
/// Implemented by the lifecycle manager for stateless tiers and by the
/// identity allocator for stateful services.
#[async_trait]
pub trait ScaleTarget: Send + Sync {
    /// Instances of `tier` that are currently Ready.
    async fn ready_count(&self, tier: &str) -> u32;

    /// Converge `tier` towards `replicas`. Idempotent.
    async fn set_desired_count(&self, tier: &str, replicas: u32) -> Result<(), ScaleError>;
}
