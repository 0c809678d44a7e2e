//! Allocator error types.

use thiserror::Error;

use tierscale_state::StateError;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("service {service} has no replica at ordinal {ordinal}")]
    OrdinalNotFound { service: String, ordinal: u32 },

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("cannot terminate ordinal {ordinal} while ordinal {blocking} is not gone")]
    OutOfOrder { ordinal: u32, blocking: u32 },

    #[error("binding {binding} for ordinal {ordinal} is already held by ordinal {held_by}")]
    BindingConflict {
        binding: String,
        ordinal: u32,
        held_by: u32,
    },

    #[error("service {service} stalled: ordinal {ordinal} did not become ready")]
    StartupStalled { service: String, ordinal: u32 },

    #[error("service {service} halted: ordinal {ordinal} could not be torn down")]
    TeardownFailed { service: String, ordinal: u32 },

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("provisioner error: {0}")]
    Provision(#[source] anyhow::Error),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

pub type AllocatorResult<T> = Result<T, AllocatorError>;
