//! IdentityAllocator — ordered lifecycle of one stateful service.
//!
//! `reconcile` performs at most one ordinal transition per call while
//! holding the service's sequencer, so only one ordinal is ever starting or
//! stopping at a time. A start registers the Pending replica and hands the
//! creation to a background task; the next ordinal waits until this one is
//! Ready. Teardown holds the sequencer until the provisioner has released
//! the instance. The replica table lock is never held across a collaborator
//! call.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

use tierscale_lifecycle::Provisioner;
use tierscale_state::{
    BindingId, EventBus, EventKind, Instance, InstanceId, LifecycleState, Readiness, ScaleError,
    ScaleTarget, StateStore, StatefulReplica, StorageBinding, Tier, Timestamp, epoch_secs,
};

use crate::error::{AllocatorError, AllocatorResult};
use crate::storage::StorageProvider;

/// Outcome of one `reconcile` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Ordinal created and handed to the provisioner.
    Started { ordinal: u32, instance_id: InstanceId },
    /// Highest ordinal torn down; its binding is retained.
    Stopped(u32),
    /// Ordinal is live but not yet Ready; nothing above it may start.
    Waiting(u32),
    /// Creation is halted on this ordinal until it becomes Ready or is overridden.
    Stalled(u32),
    /// Teardown of this ordinal failed; nothing moves until overridden.
    TeardownHalted(u32),
    /// All ordinals `0..N` are Ready and nothing is above N.
    Steady,
}

struct Replica {
    instance: Instance,
    binding: BindingId,
    ever_ready: bool,
}

enum Plan {
    Start(u32),
    Stop(u32),
    Wait(u32),
    Stalled(u32),
    TeardownHalted(u32),
    Steady,
}

#[derive(Default)]
struct AllocatorState {
    desired: u32,
    replicas: BTreeMap<u32, Replica>,
    stalled: Option<u32>,
    /// Ordinal the provisioner failed to release.
    teardown_failed: Option<u32>,
    incarnation: u64,
}

impl AllocatorState {
    fn plan(&self) -> Plan {
        if let Some(ordinal) = self.teardown_failed {
            return Plan::TeardownHalted(ordinal);
        }
        if let Some((&highest, _)) = self.replicas.last_key_value() {
            if highest >= self.desired {
                return Plan::Stop(highest);
            }
        }
        for ordinal in 0..self.desired {
            match self.replicas.get(&ordinal) {
                Some(replica) if replica.instance.is_ready() => continue,
                Some(_) if self.stalled == Some(ordinal) => return Plan::Stalled(ordinal),
                Some(_) => return Plan::Wait(ordinal),
                None => {
                    return match self.stalled {
                        Some(stalled) => Plan::Stalled(stalled),
                        None => Plan::Start(ordinal),
                    };
                }
            }
        }
        Plan::Steady
    }

    fn find_instance(&mut self, instance_id: &str) -> Option<(u32, &mut Replica)> {
        self.replicas
            .iter_mut()
            .find(|(_, r)| r.instance.id == instance_id)
            .map(|(ordinal, r)| (*ordinal, r))
    }
}

/// Owns the ordinal replicas of a single stateful service.
#[derive(Clone)]
pub struct IdentityAllocator {
    service: String,
    provisioner: Arc<dyn Provisioner>,
    storage: Arc<dyn StorageProvider>,
    store: StateStore,
    events: EventBus,
    startup_timeout: u64,
    sequencer: Arc<Mutex<()>>,
    state: Arc<RwLock<AllocatorState>>,
}

impl IdentityAllocator {
    pub fn new(
        service: &str,
        provisioner: Arc<dyn Provisioner>,
        storage: Arc<dyn StorageProvider>,
        store: StateStore,
        events: EventBus,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            service: service.to_string(),
            provisioner,
            storage,
            store,
            events,
            startup_timeout: startup_timeout.as_secs(),
            sequencer: Arc::new(Mutex::new(())),
            state: Arc::new(RwLock::new(AllocatorState::default())),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Record the desired replica count. Returns the previous count.
    pub async fn set_replicas(&self, replicas: u32) -> u32 {
        let mut state = self.state.write().await;
        let previous = std::mem::replace(&mut state.desired, replicas);
        if previous != replicas {
            info!(service = %self.service, from = previous, to = replicas, "replica count changed");
        }
        previous
    }

    pub async fn desired(&self) -> u32 {
        self.state.read().await.desired
    }

    /// Perform at most one ordered transition towards the desired count.
    pub async fn reconcile(&self, now: Timestamp) -> AllocatorResult<Transition> {
        let _turn = self.sequencer.lock().await;
        self.check_startup(now).await;

        let plan = self.state.read().await.plan();
        match plan {
            Plan::Stop(ordinal) => {
                self.stop(ordinal).await?;
                Ok(Transition::Stopped(ordinal))
            }
            Plan::Start(ordinal) => {
                let instance_id = self.start(ordinal, now).await?;
                Ok(Transition::Started {
                    ordinal,
                    instance_id,
                })
            }
            Plan::Wait(ordinal) => Ok(Transition::Waiting(ordinal)),
            Plan::Stalled(ordinal) => Ok(Transition::Stalled(ordinal)),
            Plan::TeardownHalted(ordinal) => Ok(Transition::TeardownHalted(ordinal)),
            Plan::Steady => Ok(Transition::Steady),
        }
    }

    /// Terminate ordinal `ordinal` and lower the desired count to it.
    ///
    /// Rejected with `OutOfOrder` while any higher ordinal is not Gone. A
    /// caller racing an in-flight transition waits for it on the sequencer.
    pub async fn terminate_ordinal(&self, ordinal: u32) -> AllocatorResult<()> {
        let _turn = self.sequencer.lock().await;
        {
            let mut state = self.state.write().await;
            if !state.replicas.contains_key(&ordinal) {
                return Err(AllocatorError::OrdinalNotFound {
                    service: self.service.clone(),
                    ordinal,
                });
            }
            if let Some((&blocking, _)) = state.replicas.range(ordinal + 1..).next_back() {
                return Err(AllocatorError::OutOfOrder { ordinal, blocking });
            }
            if state.desired > ordinal {
                info!(service = %self.service, from = state.desired, to = ordinal, "replica count lowered by termination");
                state.desired = ordinal;
            }
        }
        self.stop(ordinal).await
    }

    /// Bind storage, register the Pending replica and start its creation.
    ///
    /// Returns as soon as the replica is registered; the provisioner is
    /// awaited by a background task.
    async fn start(&self, ordinal: u32, now: Timestamp) -> AllocatorResult<InstanceId> {
        let binding = self.attach_binding(ordinal, now).await?;

        let instance = {
            let mut state = self.state.write().await;
            state.incarnation += 1;
            let id = format!("{}-{}-{}", self.service, ordinal, state.incarnation);
            let instance = Instance::pending(&id, &self.service, Tier::Stateful, now);
            self.events
                .publish(&instance, Some(ordinal), EventKind::Created, now);
            state.replicas.insert(
                ordinal,
                Replica {
                    instance: instance.clone(),
                    binding: binding.clone(),
                    ever_ready: false,
                },
            );
            instance
        };
        info!(service = %self.service, ordinal, instance = %instance.id, %binding, "starting ordinal");

        let id = instance.id.clone();
        let this = self.clone();
        tokio::spawn(async move { this.provision(ordinal, instance).await });
        Ok(id)
    }

    /// Background half of a start: ask the provisioner, then go Running.
    async fn provision(&self, ordinal: u32, instance: Instance) {
        let created = self
            .provisioner
            .create(&self.service, Tier::Stateful, &instance.id, Some(ordinal))
            .await;
        let now = epoch_secs();

        let address = match created {
            Ok(address) => address,
            Err(e) => {
                error!(service = %self.service, ordinal, error = %e, "ordinal creation failed");
                let mut state = self.state.write().await;
                let still_pending = state.replicas.get(&ordinal).is_some_and(|r| {
                    r.instance.id == instance.id && r.instance.lifecycle == LifecycleState::Pending
                });
                if !still_pending {
                    return;
                }
                if let Some(mut replica) = state.replicas.remove(&ordinal) {
                    replica.instance.lifecycle = LifecycleState::Gone;
                    self.events
                        .publish(&replica.instance, Some(ordinal), EventKind::Gone, now);
                }
                if state.stalled.is_none() {
                    state.stalled = Some(ordinal);
                    self.events
                        .publish(&instance, Some(ordinal), EventKind::StartupStalled, now);
                }
                return;
            }
        };

        let orphaned = {
            let mut state = self.state.write().await;
            let stalled = state.stalled;
            match state.replicas.get_mut(&ordinal) {
                Some(replica)
                    if replica.instance.id == instance.id
                        && replica.instance.lifecycle == LifecycleState::Pending =>
                {
                    replica.instance.lifecycle = LifecycleState::Running;
                    replica.instance.address = Some(address.clone());
                    replica.instance.updated_at = now;
                    self.events.publish(
                        &replica.instance,
                        Some(ordinal),
                        EventKind::Running {
                            address: address.clone(),
                        },
                        now,
                    );
                    let ready = replica.instance.readiness == Readiness::Ready;
                    if ready {
                        replica.ever_ready = true;
                        self.events.publish(
                            &replica.instance,
                            Some(ordinal),
                            EventKind::Ready {
                                address: address.clone(),
                            },
                            now,
                        );
                    }
                    if ready && stalled == Some(ordinal) {
                        state.stalled = None;
                    }
                    false
                }
                _ => true,
            }
        };

        if orphaned {
            warn!(service = %self.service, ordinal, instance = %instance.id, "ordinal stopped during creation, releasing compute");
            if let Err(e) = self.provisioner.terminate(&instance.id).await {
                warn!(instance = %instance.id, error = %e, "failed to release preempted instance");
            }
        } else {
            info!(service = %self.service, ordinal, instance = %instance.id, %address, "ordinal running");
        }
    }

    /// Reuse the persisted binding of `ordinal`, or bind a fresh volume.
    async fn attach_binding(&self, ordinal: u32, now: Timestamp) -> AllocatorResult<BindingId> {
        if let Some(existing) = self.store.get_binding(&self.service, ordinal)? {
            debug!(service = %self.service, ordinal, binding = %existing.binding_id, "reattaching binding");
            return Ok(existing.binding_id);
        }

        let binding_id = self
            .storage
            .bind(&self.service, ordinal)
            .await
            .map_err(AllocatorError::Storage)?;

        if let Some(holder) = self
            .store
            .list_bindings_for_service(&self.service)?
            .into_iter()
            .find(|b| b.binding_id == binding_id && b.ordinal != ordinal)
        {
            return Err(AllocatorError::BindingConflict {
                binding: binding_id,
                ordinal,
                held_by: holder.ordinal,
            });
        }

        self.store.put_binding(&StorageBinding {
            service: self.service.clone(),
            ordinal,
            binding_id: binding_id.clone(),
            bound_at: now,
        })?;
        info!(service = %self.service, ordinal, binding = %binding_id, "storage bound");
        Ok(binding_id)
    }

    /// Tear down `ordinal`: instance released, binding kept.
    ///
    /// A Pending replica is dropped without calling the provisioner; its
    /// creation releases the compute when it answers. A provisioner failure
    /// halts the service until `override_stall`.
    async fn stop(&self, ordinal: u32) -> AllocatorResult<()> {
        let (instance_id, binding, pending) = {
            let mut state = self.state.write().await;
            let replica = state.replicas.get_mut(&ordinal).ok_or_else(|| {
                AllocatorError::OrdinalNotFound {
                    service: self.service.clone(),
                    ordinal,
                }
            })?;
            let pending = replica.instance.lifecycle == LifecycleState::Pending;
            if replica.instance.lifecycle != LifecycleState::Terminating {
                replica.instance.lifecycle = LifecycleState::Terminating;
                self.events.publish(
                    &replica.instance,
                    Some(ordinal),
                    EventKind::Terminating,
                    epoch_secs(),
                );
            }
            (replica.instance.id.clone(), replica.binding.clone(), pending)
        };
        info!(service = %self.service, ordinal, instance = %instance_id, "stopping ordinal");

        if !pending {
            if let Err(e) = self.provisioner.terminate(&instance_id).await {
                error!(service = %self.service, ordinal, error = %e, "ordinal teardown failed, halting");
                let mut state = self.state.write().await;
                if state.teardown_failed.is_none() {
                    state.teardown_failed = Some(ordinal);
                    if let Some(replica) = state.replicas.get(&ordinal) {
                        self.events.publish(
                            &replica.instance,
                            Some(ordinal),
                            EventKind::TeardownFailed,
                            epoch_secs(),
                        );
                    }
                }
                return Err(AllocatorError::Provision(e));
            }
        }

        if let Err(e) = self.storage.release(&self.service, ordinal, &binding).await {
            warn!(service = %self.service, ordinal, %binding, error = %e, "storage release failed");
        }

        let mut state = self.state.write().await;
        if let Some(mut replica) = state.replicas.remove(&ordinal) {
            replica.instance.lifecycle = LifecycleState::Gone;
            self.events
                .publish(&replica.instance, Some(ordinal), EventKind::Gone, epoch_secs());
        }
        if state.stalled == Some(ordinal) {
            state.stalled = None;
        }
        if state.teardown_failed == Some(ordinal) {
            state.teardown_failed = None;
        }
        info!(service = %self.service, ordinal, "ordinal gone, binding retained");
        Ok(())
    }

    /// Stall creation if the ordinal being started is overdue.
    async fn check_startup(&self, now: Timestamp) {
        let mut state = self.state.write().await;
        if state.stalled.is_some() {
            return;
        }
        let overdue = state.replicas.iter().find(|(_, r)| {
            matches!(
                r.instance.lifecycle,
                LifecycleState::Pending | LifecycleState::Running
            ) && !r.ever_ready
                && now.saturating_sub(r.instance.created_at) > self.startup_timeout
        });
        if let Some((&ordinal, replica)) = overdue {
            self.events
                .publish(&replica.instance, Some(ordinal), EventKind::StartupStalled, now);
            warn!(service = %self.service, ordinal, "startup stalled, halting ordinal creation");
            state.stalled = Some(ordinal);
        }
    }

    /// Manually clear a halt and return the ordinal it was on.
    ///
    /// A failed teardown is cleared first and retried on the next reconcile.
    /// A startup stall gives the stalled ordinal a fresh startup window.
    pub async fn override_stall(&self, now: Timestamp) -> Option<u32> {
        let mut state = self.state.write().await;
        if let Some(ordinal) = state.teardown_failed.take() {
            info!(service = %self.service, ordinal, "teardown halt overridden");
            return Some(ordinal);
        }
        let ordinal = state.stalled.take()?;
        if let Some(replica) = state.replicas.get_mut(&ordinal) {
            replica.instance.created_at = now;
        }
        info!(service = %self.service, ordinal, "startup stall overridden");
        Some(ordinal)
    }

    pub async fn stalled(&self) -> Option<u32> {
        self.state.read().await.stalled
    }

    pub async fn teardown_failed(&self) -> Option<u32> {
        self.state.read().await.teardown_failed
    }

    /// Whether automated transitions are halted for any reason.
    pub async fn is_halted(&self) -> bool {
        let state = self.state.read().await;
        state.stalled.is_some() || state.teardown_failed.is_some()
    }

    /// Apply a readiness report for one of this service's instances.
    pub async fn report_readiness(
        &self,
        instance_id: &str,
        ready: bool,
        timestamp: Timestamp,
    ) -> AllocatorResult<()> {
        let mut state = self.state.write().await;
        let stalled = state.stalled;
        let (ordinal, replica) = state
            .find_instance(instance_id)
            .ok_or_else(|| AllocatorError::InstanceNotFound(instance_id.to_string()))?;

        let readiness = if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        if replica.instance.readiness == readiness {
            return Ok(());
        }
        replica.instance.readiness = readiness;
        replica.instance.updated_at = timestamp;

        if replica.instance.lifecycle != LifecycleState::Running {
            debug!(service = %self.service, ordinal, ?readiness, "readiness recorded, not published");
            return Ok(());
        }

        let kind = if ready {
            replica.ever_ready = true;
            EventKind::Ready {
                address: replica.instance.address.clone().unwrap_or_default(),
            }
        } else {
            EventKind::NotReady
        };
        self.events
            .publish(&replica.instance, Some(ordinal), kind, timestamp);
        debug!(service = %self.service, ordinal, ?readiness, "readiness changed");

        if ready && stalled == Some(ordinal) {
            state.stalled = None;
            info!(service = %self.service, ordinal, "stalled ordinal became ready, resuming");
        }
        Ok(())
    }

    /// Persisted bindings of this service, ordered by ordinal.
    pub async fn bindings(&self) -> AllocatorResult<Vec<StorageBinding>> {
        Ok(self.store.list_bindings_for_service(&self.service)?)
    }

    /// Ids of the instances currently Ready.
    pub async fn ready_ids(&self) -> HashSet<InstanceId> {
        let state = self.state.read().await;
        state
            .replicas
            .values()
            .filter(|r| r.instance.is_ready())
            .map(|r| r.instance.id.clone())
            .collect()
    }

    /// Ordinals whose instance is currently Ready.
    pub async fn ready_ordinals(&self) -> Vec<u32> {
        let state = self.state.read().await;
        state
            .replicas
            .iter()
            .filter(|(_, r)| r.instance.is_ready())
            .map(|(ordinal, _)| *ordinal)
            .collect()
    }

    /// Snapshot of the live replicas, ordered by ordinal.
    pub async fn replicas(&self) -> Vec<StatefulReplica> {
        let state = self.state.read().await;
        state
            .replicas
            .iter()
            .map(|(ordinal, r)| StatefulReplica {
                instance: r.instance.clone(),
                ordinal: *ordinal,
                storage_binding: r.binding.clone(),
            })
            .collect()
    }

    pub async fn is_known(&self, instance_id: &str) -> bool {
        let state = self.state.read().await;
        state.replicas.values().any(|r| r.instance.id == instance_id)
    }

    pub async fn known_ids(&self) -> HashSet<InstanceId> {
        let state = self.state.read().await;
        state
            .replicas
            .values()
            .map(|r| r.instance.id.clone())
            .collect()
    }

    /// Reconcile on a fixed period until shutdown.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(service = %self.service, ?period, "identity allocator started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile(epoch_secs()).await {
                        Ok(Transition::Steady) | Ok(Transition::Waiting(_)) => {}
                        Ok(Transition::Stalled(ordinal)) => {
                            debug!(service = %self.service, ordinal, "creation halted");
                        }
                        Ok(Transition::TeardownHalted(ordinal)) => {
                            debug!(service = %self.service, ordinal, "teardown halted");
                        }
                        Ok(transition) => debug!(service = %self.service, ?transition, "reconciled"),
                        Err(e) => warn!(service = %self.service, error = %e, "reconcile failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(service = %self.service, "identity allocator shutting down");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ScaleTarget for IdentityAllocator {
    async fn ready_count(&self, tier: &str) -> u32 {
        if tier != self.service {
            return 0;
        }
        self.ready_ordinals().await.len() as u32
    }

    async fn set_desired_count(&self, tier: &str, replicas: u32) -> Result<(), ScaleError> {
        if tier != self.service {
            return Err(ScaleError::Failed(anyhow::anyhow!(
                "allocator for {} cannot scale {tier}",
                self.service
            )));
        }
        let halt = {
            let state = self.state.read().await;
            match (state.teardown_failed, state.stalled) {
                (Some(ordinal), _) => Some(AllocatorError::TeardownFailed {
                    service: self.service.clone(),
                    ordinal,
                }),
                (None, Some(ordinal)) => Some(AllocatorError::StartupStalled {
                    service: self.service.clone(),
                    ordinal,
                }),
                (None, None) => None,
            }
        };
        if let Some(reason) = halt {
            return Err(ScaleError::Halted {
                tier: tier.to_string(),
                reason: reason.to_string(),
            });
        }
        self.set_replicas(replicas).await;
        Ok(())
    }
}
