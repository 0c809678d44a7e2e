//! Lifecycle error types.

use thiserror::Error;

/// Errors surfaced by the lifecycle manager.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("tier not registered: {0}")]
    UnknownTier(String),

    #[error("tier {tier} halted: instance {instance} did not become ready in time")]
    CreationTimedOut { tier: String, instance: String },

    #[error("provisioner error: {0}")]
    Provision(#[from] anyhow::Error),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
