//! Instance event bus.
//!
//! Lifecycle and readiness transitions are published once by the owning
//! manager (the lifecycle manager for the stateless tier, the identity
//! allocator for the stateful tier) and fanned out over a
//! `tokio::sync::broadcast` channel to every subscriber: the metrics
//! collector uses it to track which instances are Ready, the directory sync
//! uses it to add and remove endpoints.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Instance, InstanceId, ServiceName, Tier, Timestamp};

/// What happened to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Creation requested; the instance is `Pending`.
    Created,
    /// The provisioner allocated the instance; it is `Running` but not yet Ready.
    Running { address: String },
    Ready { address: String },
    NotReady,
    Terminating,
    Gone,
    /// The instance did not become Ready within the creation timeout.
    CreationTimedOut,
    /// A stateful ordinal did not become Ready within the startup timeout.
    StartupStalled,
    /// The provisioner refused to release a stateful ordinal.
    TeardownFailed,
}

/// A single transition, stamped with a bus-wide sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub seq: u64,
    pub instance_id: InstanceId,
    pub service: ServiceName,
    pub tier: Tier,
    pub ordinal: Option<u32>,
    pub kind: EventKind,
    pub timestamp: Timestamp,
}

/// Cloneable publisher handle over a broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<InstanceEvent>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.tx.subscribe()
    }

    /// Publish a transition for `instance`.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(
        &self,
        instance: &Instance,
        ordinal: Option<u32>,
        kind: EventKind,
        timestamp: Timestamp,
    ) -> InstanceEvent {
        let event = InstanceEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            instance_id: instance.id.clone(),
            service: instance.service.clone(),
            tier: instance.tier,
            ordinal,
            kind,
            timestamp,
        };
        trace!(seq = event.seq, instance = %event.instance_id, kind = ?event.kind, "instance event");
        let _ = self.tx.send(event.clone());
        event
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
