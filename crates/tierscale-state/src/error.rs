//! Error types for the tierscale state crate.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// A `ScalingPolicy` that breaks its own invariants.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("min_replicas ({min}) exceeds max_replicas ({max})")]
    MinAboveMax { min: u32, max: u32 },

    #[error("target utilization must be a positive finite ratio, got {0}")]
    InvalidTarget(f64),
}

/// Errors found while validating a `tierscale.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("service {service}: {source}")]
    Policy {
        service: String,
        #[source]
        source: PolicyError,
    },

    #[error("controller tick period must be at least one second")]
    ZeroTick,

    #[error("reconcile period must be non-zero")]
    ZeroReconcile,
}

/// Why a scale target refused or failed a replica-count command.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// Automated action on the tier is suspended until an operator clears it.
    #[error("tier {tier} is halted: {reason}")]
    Halted { tier: String, reason: String },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}
