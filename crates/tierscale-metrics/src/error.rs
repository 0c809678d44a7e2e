//! Metrics collector error types.

use thiserror::Error;

/// Errors surfaced by the metrics collector.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    /// The sample was rejected; nothing was recorded.
    #[error("invalid sample for {instance}: {reason}")]
    InvalidSample { instance: String, reason: String },

    /// No Ready instance of the tier has a sample inside the window.
    #[error("no utilization data for tier {0}")]
    NoData(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;
