//! Directory synchronization — bridges instance events to the directory.
//!
//! `DirectorySync` subscribes to the instance event bus and keeps the
//! directory in step with readiness: an endpoint is added on Ready, removed
//! on NotReady or Terminating, and retired on Gone.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use tierscale_state::{EventKind, InstanceEvent, ServiceEndpoint};

use crate::directory::{ServiceDirectory, UpsertOutcome};

/// Applies instance events to a [`ServiceDirectory`].
pub struct DirectorySync {
    directory: Arc<ServiceDirectory>,
}

impl DirectorySync {
    pub fn new(directory: Arc<ServiceDirectory>) -> Self {
        Self { directory }
    }

    /// Apply a single event.
    pub fn apply(&self, event: &InstanceEvent) {
        match &event.kind {
            EventKind::Ready { address } => {
                let outcome = self.directory.upsert(ServiceEndpoint {
                    service: event.service.clone(),
                    instance_id: event.instance_id.clone(),
                    address: address.clone(),
                    ordinal: event.ordinal,
                    ready: true,
                });
                if outcome != UpsertOutcome::Applied {
                    debug!(instance = %event.instance_id, ?outcome, "ready event not applied");
                }
            }
            EventKind::NotReady | EventKind::Terminating => {
                self.directory.remove(&event.service, &event.instance_id);
            }
            EventKind::Gone => {
                self.directory.retire(&event.service, &event.instance_id);
            }
            EventKind::Created
            | EventKind::Running { .. }
            | EventKind::CreationTimedOut
            | EventKind::StartupStalled
            | EventKind::TeardownFailed => {}
        }
    }

    /// Consume instance events until shutdown.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<InstanceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("directory sync started");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.apply(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "directory sync lagged; reconciliation will repair missed transitions");
                    }
                    Err(RecvError::Closed) => {
                        info!("instance event bus closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("directory sync shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InstanceStatus, OrdinalSlot, Resolution, ResolveMode};
    use tierscale_state::{EventBus, Instance, Tier};

    fn ready(address: &str) -> EventKind {
        EventKind::Ready {
            address: address.to_string(),
        }
    }

    #[test]
    fn ready_adds_and_not_ready_removes() {
        let dir = Arc::new(ServiceDirectory::default());
        let sync = DirectorySync::new(dir.clone());
        let bus = EventBus::new(8);
        let inst = Instance::pending("web-1", "web", Tier::Stateless, 0);

        sync.apply(&bus.publish(&inst, None, ready("10.0.0.1:8080"), 1));
        assert_eq!(
            dir.resolve("web", ResolveMode::Pooled).ready_endpoints().len(),
            1
        );

        sync.apply(&bus.publish(&inst, None, EventKind::NotReady, 2));
        assert!(dir.resolve("web", ResolveMode::Pooled).ready_endpoints().is_empty());

        // Flapping back to Ready is allowed.
        sync.apply(&bus.publish(&inst, None, ready("10.0.0.1:8080"), 3));
        assert_eq!(
            dir.resolve("web", ResolveMode::Pooled).ready_endpoints().len(),
            1
        );
    }

    #[test]
    fn gone_is_final() {
        let dir = Arc::new(ServiceDirectory::default());
        let sync = DirectorySync::new(dir.clone());
        let bus = EventBus::new(8);
        let inst = Instance::pending("web-1", "web", Tier::Stateless, 0);

        sync.apply(&bus.publish(&inst, None, ready("10.0.0.1:8080"), 1));
        sync.apply(&bus.publish(&inst, None, EventKind::Gone, 2));
        sync.apply(&bus.publish(&inst, None, ready("10.0.0.1:8080"), 3));

        assert!(dir.resolve("web", ResolveMode::Pooled).ready_endpoints().is_empty());
    }

    #[test]
    fn stateful_ready_carries_ordinal() {
        let dir = Arc::new(ServiceDirectory::default());
        let sync = DirectorySync::new(dir.clone());
        let bus = EventBus::new(8);
        let inst = Instance::pending("db-1", "db", Tier::Stateful, 0);

        sync.apply(&bus.publish(&inst, Some(1), ready("10.1.0.2:5432"), 1));

        let Resolution::Ordered(slots) = dir.resolve("db", ResolveMode::Ordered) else {
            panic!("expected ordered resolution");
        };
        assert_eq!(slots[0], OrdinalSlot::Hole { ordinal: 0 });
        assert!(matches!(&slots[1], OrdinalSlot::Ready { endpoint } if endpoint.address == "10.1.0.2:5432"));
    }

    #[tokio::test]
    async fn missed_not_ready_is_repaired_by_reconcile() {
        let dir = Arc::new(ServiceDirectory::default());
        let sync = DirectorySync::new(dir.clone());
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();
        let inst = Instance::pending("web-1", "web", Tier::Stateless, 0);
        let other = Instance::pending("web-2", "web", Tier::Stateless, 0);

        bus.publish(&inst, None, ready("10.0.0.1:8080"), 1);
        sync.apply(&rx.recv().await.unwrap());

        // NotReady is overwritten before the subscriber reads it.
        bus.publish(&inst, None, EventKind::NotReady, 2);
        bus.publish(&other, None, EventKind::Created, 3);
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(1))));
        sync.apply(&rx.recv().await.unwrap());
        assert!(dir.pick("web").is_some());

        let report = dir.reconcile(dir.stamp(), |_, _| InstanceStatus::NotReady);
        assert_eq!(report.hidden, vec!["web-1".to_string()]);
        assert!(report.purged.is_empty());
        assert!(dir.pick("web").is_none());
    }

    #[tokio::test]
    async fn run_applies_events_until_shutdown() {
        let dir = Arc::new(ServiceDirectory::default());
        let sync = Arc::new(DirectorySync::new(dir.clone()));
        let bus = EventBus::new(8);
        let (tx, rx) = watch::channel(false);

        let runner = {
            let sync = sync.clone();
            let events = bus.subscribe();
            tokio::spawn(async move { sync.run(events, rx).await })
        };

        let inst = Instance::pending("web-1", "web", Tier::Stateless, 0);
        bus.publish(&inst, None, ready("10.0.0.1:8080"), 1);

        for _ in 0..50 {
            if dir.pick("web").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(dir.pick("web").is_some());

        tx.send(true).unwrap();
        runner.await.unwrap();
    }
}
