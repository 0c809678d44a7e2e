//! Domain types for the tierscale control plane.
//!
//! Instances, utilization samples, scaling policies, directory endpoints and
//! stateful replicas. Types that are persisted or cross the HTTP surface are
//! serde-serializable.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PolicyError;

/// Unique identifier for an instance.
pub type InstanceId = String;

/// Logical service (or scaling tier) name.
pub type ServiceName = String;

/// Identifier handed out by the storage collaborator for a volume.
pub type BindingId = String;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

// ── Instance ──────────────────────────────────────────────────────

/// Role of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Stateless,
    Stateful,
}

/// Lifecycle of an instance, driven by its owning manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Running,
    Terminating,
    Gone,
}

impl LifecycleState {
    /// Anything short of `Gone` still occupies a slot.
    pub fn is_live(self) -> bool {
        self != LifecycleState::Gone
    }
}

/// Readiness as reported by the external health feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    NotReady,
    Ready,
}

/// A single compute instance of either tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub service: ServiceName,
    pub tier: Tier,
    pub lifecycle: LifecycleState,
    pub readiness: Readiness,
    /// Address reported by the provisioner once the instance is running.
    pub address: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Instance {
    /// A freshly requested instance: `Pending`, `NotReady`, no address.
    pub fn pending(id: &str, service: &str, tier: Tier, now: Timestamp) -> Self {
        Self {
            id: id.to_string(),
            service: service.to_string(),
            tier,
            lifecycle: LifecycleState::Pending,
            readiness: Readiness::NotReady,
            address: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Running and passing health checks.
    pub fn is_ready(&self) -> bool {
        self.lifecycle == LifecycleState::Running && self.readiness == Readiness::Ready
    }
}

// ── Metrics ───────────────────────────────────────────────────────

/// One utilization observation: observed / requested resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub instance_id: InstanceId,
    pub timestamp: Timestamp,
    pub utilization: f64,
}

// ── Scaling policy ────────────────────────────────────────────────

/// Per-service autoscaling parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    /// Target utilization ratio (0.5 = 50% of the requested resource).
    pub target_utilization: f64,
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Largest increase over the previous commanded count in one tick.
    #[serde(default = "default_scale_up_step_limit")]
    pub scale_up_step_limit: u32,
    /// Largest decrease below the previous commanded count in one tick.
    #[serde(default = "default_scale_down_step_limit")]
    pub scale_down_step_limit: u32,
    /// Number of trailing controller ticks a scale-down must persist for.
    #[serde(default = "default_stabilization_window")]
    pub stabilization_window: u32,
}

fn default_scale_up_step_limit() -> u32 {
    4
}

fn default_scale_down_step_limit() -> u32 {
    1
}

fn default_stabilization_window() -> u32 {
    20
}

impl ScalingPolicy {
    /// Check `0 <= min <= max` and a usable target.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.target_utilization.is_finite() || self.target_utilization <= 0.0 {
            return Err(PolicyError::InvalidTarget(self.target_utilization));
        }
        if self.min_replicas > self.max_replicas {
            return Err(PolicyError::MinAboveMax {
                min: self.min_replicas,
                max: self.max_replicas,
            });
        }
        Ok(())
    }

    /// Clamp a replica count into `[min_replicas, max_replicas]`.
    pub fn clamp(&self, replicas: u32) -> u32 {
        replicas.clamp(self.min_replicas, self.max_replicas)
    }
}

// ── Directory ─────────────────────────────────────────────────────

/// An addressable backend of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    pub service: ServiceName,
    pub instance_id: InstanceId,
    /// `ip:port` the instance listens on.
    pub address: String,
    /// Stable identity of a stateful replica; `None` for stateless instances.
    pub ordinal: Option<u32>,
    pub ready: bool,
}

// ── Stateful tier ─────────────────────────────────────────────────

/// An instance of the stateful tier together with its stable identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatefulReplica {
    pub instance: Instance,
    pub ordinal: u32,
    pub storage_binding: BindingId,
}

/// The persisted association between an ordinal and its volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageBinding {
    pub service: ServiceName,
    pub ordinal: u32,
    pub binding_id: BindingId,
    pub bound_at: Timestamp,
}

impl StorageBinding {
    /// Build the composite key for the bindings table.
    pub fn table_key(&self) -> String {
        binding_key(&self.service, self.ordinal)
    }
}

/// Zero-padded so that a prefix scan returns ordinals in order.
pub(crate) fn binding_key(service: &str, ordinal: u32) -> String {
    format!("{service}:{ordinal:08}")
}

// ── Autoscaler ────────────────────────────────────────────────────

/// Last replica count the autoscaler commanded for a tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerCheckpoint {
    pub tier: ServiceName,
    pub last_commanded: u32,
    pub updated_at: Timestamp,
}

/// Current wall-clock time as a unix timestamp in seconds.
pub fn epoch_secs() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
