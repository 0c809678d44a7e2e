//! The external storage collaborator.

use async_trait::async_trait;

use tierscale_state::BindingId;

/// Creates and detaches persistent volumes, keyed by `(service, ordinal)`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Create a volume for a fresh ordinal and return its binding id.
    async fn bind(&self, service: &str, ordinal: u32) -> anyhow::Result<BindingId>;

    /// Detach `binding` from the ordinal's instance. The volume is kept.
    async fn release(&self, service: &str, ordinal: u32, binding: &str) -> anyhow::Result<()>;
}
