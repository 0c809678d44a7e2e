//! The external compute collaborator.

use async_trait::async_trait;

use tierscale_state::Tier;

/// Allocates and releases compute for instances.
///
/// Calls may take arbitrarily long; the caller never holds a lock across
/// them.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Allocate compute for `instance_id` and return the address it listens on.
    async fn create(
        &self,
        service: &str,
        tier: Tier,
        instance_id: &str,
        ordinal: Option<u32>,
    ) -> anyhow::Result<String>;

    /// Release the compute behind `instance_id`.
    async fn terminate(&self, instance_id: &str) -> anyhow::Result<()>;
}
