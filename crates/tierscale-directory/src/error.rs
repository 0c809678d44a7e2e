//! Directory error types.

use thiserror::Error;

/// An endpoint that references an instance neither the lifecycle manager
/// nor any identity allocator knows about.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("endpoint {instance_id} of service {service} references an unknown instance")]
pub struct DirectoryInconsistency {
    pub service: String,
    pub instance_id: String,
}
