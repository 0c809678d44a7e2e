//! LifecycleManager — desired-count convergence for stateless tiers.
//!
//! Each registered tier holds its desired count and the instances the
//! manager owns. `set_desired_count` converges the tier one instance at a
//! time; creations return as soon as the Pending instance is registered,
//! terminations wait for the provisioner. `converge` repeats the pass on the
//! current count so a failed creation is replaced on the next housekeeping
//! tick. No lock is held across a provisioner call.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use tierscale_state::{
    EventBus, EventKind, Instance, InstanceId, LifecycleState, Readiness, ScaleError, ScaleTarget,
    Tier, Timestamp, epoch_secs,
};

use crate::error::{LifecycleError, LifecycleResult};
use crate::provisioner::Provisioner;

/// An owned instance plus the bookkeeping the manager needs about it.
struct Tracked {
    instance: Instance,
    /// Creation order within the manager; newer instances have larger values.
    seq: u64,
    ever_ready: bool,
    timed_out: bool,
}

/// Per-tier convergence state.
#[derive(Default)]
struct TierSlot {
    desired: u32,
    instances: HashMap<InstanceId, Tracked>,
    /// Instance whose creation timeout halted the tier.
    halted: Option<InstanceId>,
}

impl TierSlot {
    /// Instances that count towards the desired total.
    fn live_count(&self) -> u32 {
        self.instances
            .values()
            .filter(|t| {
                matches!(
                    t.instance.lifecycle,
                    LifecycleState::Pending | LifecycleState::Running
                )
            })
            .count() as u32
    }

    /// Scale-down victim: Pending first, then NotReady, then the newest Ready.
    fn pick_victim(&self) -> Option<InstanceId> {
        self.instances
            .values()
            .filter_map(|t| {
                let rank = match (t.instance.lifecycle, t.instance.readiness) {
                    (LifecycleState::Pending, _) => 0,
                    (LifecycleState::Running, Readiness::NotReady) => 1,
                    (LifecycleState::Running, Readiness::Ready) => 2,
                    _ => return None,
                };
                Some((rank, Reverse(t.seq), &t.instance.id))
            })
            .min()
            .map(|(_, _, id)| id.clone())
    }
}

enum Step {
    Create(Instance),
    Terminate(InstanceId),
    Done,
}

/// What one convergence pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    /// Instances registered as Pending, in creation order.
    pub created: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
}

/// Owns the instances of every stateless tier.
#[derive(Clone)]
pub struct LifecycleManager {
    provisioner: Arc<dyn Provisioner>,
    events: EventBus,
    tiers: Arc<RwLock<HashMap<String, TierSlot>>>,
    creation_timeout: u64,
    next_seq: Arc<AtomicU64>,
}

impl LifecycleManager {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        events: EventBus,
        creation_timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            events,
            tiers: Arc::new(RwLock::new(HashMap::new())),
            creation_timeout: creation_timeout.as_secs(),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start managing `tier` with a desired count of zero. No-op if known.
    pub async fn register_tier(&self, tier: &str) {
        let mut tiers = self.tiers.write().await;
        if !tiers.contains_key(tier) {
            tiers.insert(tier.to_string(), TierSlot::default());
            info!(%tier, "tier registered");
        }
    }

    /// Converge `tier` towards `replicas` instances.
    ///
    /// Idempotent: calling again with the same count after convergence does
    /// nothing. Fails with `CreationTimedOut` while the tier is halted.
    pub async fn set_desired_count(
        &self,
        tier: &str,
        replicas: u32,
    ) -> LifecycleResult<ConvergeReport> {
        {
            let mut tiers = self.tiers.write().await;
            let slot = tiers
                .get_mut(tier)
                .ok_or_else(|| LifecycleError::UnknownTier(tier.to_string()))?;
            if let Some(instance) = &slot.halted {
                return Err(LifecycleError::CreationTimedOut {
                    tier: tier.to_string(),
                    instance: instance.clone(),
                });
            }
            if slot.desired != replicas {
                info!(%tier, from = slot.desired, to = replicas, "desired count changed");
            }
            slot.desired = replicas;
        }
        self.step_until_converged(tier).await
    }

    /// Re-converge `tier` on its current desired count.
    ///
    /// Replaces instances whose creation failed since the last command.
    /// Halted tiers are left alone.
    pub async fn converge(&self, tier: &str) -> LifecycleResult<ConvergeReport> {
        {
            let tiers = self.tiers.read().await;
            let slot = tiers
                .get(tier)
                .ok_or_else(|| LifecycleError::UnknownTier(tier.to_string()))?;
            if slot.halted.is_some() {
                return Ok(ConvergeReport::default());
            }
        }
        self.step_until_converged(tier).await
    }

    async fn step_until_converged(&self, tier: &str) -> LifecycleResult<ConvergeReport> {
        let mut report = ConvergeReport::default();
        loop {
            match self.next_step(tier).await? {
                Step::Create(instance) => {
                    report.created.push(instance.id.clone());
                    let this = self.clone();
                    tokio::spawn(async move { this.provision(instance).await });
                }
                Step::Terminate(id) => match self.terminate(&id).await {
                    Ok(()) => report.terminated.push(id),
                    // Raced with an explicit terminate; already on its way out.
                    Err(LifecycleError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                },
                Step::Done => break,
            }
        }

        debug!(
            %tier,
            created = report.created.len(),
            terminated = report.terminated.len(),
            "tier converged"
        );
        Ok(report)
    }

    /// Decide and, for creations, register the next convergence step.
    async fn next_step(&self, tier: &str) -> LifecycleResult<Step> {
        let mut tiers = self.tiers.write().await;
        let slot = tiers
            .get_mut(tier)
            .ok_or_else(|| LifecycleError::UnknownTier(tier.to_string()))?;

        let live = slot.live_count();
        if live < slot.desired && slot.halted.is_none() {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let now = epoch_secs();
            let instance = Instance::pending(&format!("{tier}-{seq}"), tier, Tier::Stateless, now);
            self.events
                .publish(&instance, None, EventKind::Created, now);
            debug!(%tier, instance = %instance.id, "instance pending");
            slot.instances.insert(
                instance.id.clone(),
                Tracked {
                    instance: instance.clone(),
                    seq,
                    ever_ready: false,
                    timed_out: false,
                },
            );
            return Ok(Step::Create(instance));
        }
        if live > slot.desired {
            if let Some(victim) = slot.pick_victim() {
                return Ok(Step::Terminate(victim));
            }
        }
        Ok(Step::Done)
    }

    /// Background half of a creation: ask the provisioner, then go Running.
    async fn provision(&self, instance: Instance) {
        let tier = instance.service.clone();
        let result = self
            .provisioner
            .create(&tier, Tier::Stateless, &instance.id, None)
            .await;

        let address = match result {
            Ok(address) => address,
            Err(e) => {
                error!(%tier, instance = %instance.id, error = %e, "instance creation failed");
                let mut tiers = self.tiers.write().await;
                if let Some(mut tracked) = tiers
                    .get_mut(&tier)
                    .and_then(|slot| slot.instances.remove(&instance.id))
                {
                    tracked.instance.lifecycle = LifecycleState::Gone;
                    self.events
                        .publish(&tracked.instance, None, EventKind::Gone, epoch_secs());
                }
                return;
            }
        };

        let orphaned = {
            let mut tiers = self.tiers.write().await;
            match tiers
                .get_mut(&tier)
                .and_then(|slot| slot.instances.get_mut(&instance.id))
            {
                Some(tracked) if tracked.instance.lifecycle == LifecycleState::Pending => {
                    let now = epoch_secs();
                    tracked.instance.lifecycle = LifecycleState::Running;
                    tracked.instance.address = Some(address.clone());
                    tracked.instance.updated_at = now;
                    self.events.publish(
                        &tracked.instance,
                        None,
                        EventKind::Running {
                            address: address.clone(),
                        },
                        now,
                    );
                    // Readiness reported before the provisioner answered.
                    if tracked.instance.readiness == Readiness::Ready {
                        tracked.ever_ready = true;
                        self.events.publish(
                            &tracked.instance,
                            None,
                            EventKind::Ready {
                                address: address.clone(),
                            },
                            now,
                        );
                    }
                    false
                }
                _ => true,
            }
        };

        if orphaned {
            info!(%tier, instance = %instance.id, "instance terminated while pending, releasing compute");
            if let Err(e) = self.provisioner.terminate(&instance.id).await {
                warn!(%tier, instance = %instance.id, error = %e, "failed to release preempted instance");
            }
        } else {
            info!(%tier, instance = %instance.id, %address, "instance running");
        }
    }

    /// Terminate an instance.
    ///
    /// A Pending instance goes straight to Gone; its in-flight creation is
    /// cleaned up when it completes. A Running instance passes through
    /// Terminating while the provisioner releases it.
    pub async fn terminate(&self, instance_id: &str) -> LifecycleResult<()> {
        let tier = {
            let mut tiers = self.tiers.write().await;
            let Some((tier, slot)) = tiers
                .iter_mut()
                .find(|(_, slot)| slot.instances.contains_key(instance_id))
            else {
                return Err(LifecycleError::NotFound(instance_id.to_string()));
            };
            let now = epoch_secs();
            let lifecycle = slot.instances[instance_id].instance.lifecycle;
            match lifecycle {
                LifecycleState::Pending => {
                    if let Some(mut tracked) = slot.instances.remove(instance_id) {
                        tracked.instance.lifecycle = LifecycleState::Gone;
                        tracked.instance.updated_at = now;
                        self.events
                            .publish(&tracked.instance, None, EventKind::Gone, now);
                    }
                    info!(%tier, instance = %instance_id, "pending instance preempted");
                    return Ok(());
                }
                LifecycleState::Running => {
                    if let Some(tracked) = slot.instances.get_mut(instance_id) {
                        tracked.instance.lifecycle = LifecycleState::Terminating;
                        tracked.instance.updated_at = now;
                        self.events
                            .publish(&tracked.instance, None, EventKind::Terminating, now);
                    }
                }
                LifecycleState::Terminating => {
                    debug!(%tier, instance = %instance_id, "retrying termination");
                }
                LifecycleState::Gone => {
                    return Err(LifecycleError::NotFound(instance_id.to_string()));
                }
            }
            tier.clone()
        };

        self.provisioner.terminate(instance_id).await?;

        let mut tiers = self.tiers.write().await;
        if let Some(mut tracked) = tiers
            .get_mut(&tier)
            .and_then(|slot| slot.instances.remove(instance_id))
        {
            tracked.instance.lifecycle = LifecycleState::Gone;
            tracked.instance.updated_at = epoch_secs();
            self.events
                .publish(&tracked.instance, None, EventKind::Gone, tracked.instance.updated_at);
        }
        info!(%tier, instance = %instance_id, "instance gone");
        Ok(())
    }

    /// Apply a readiness report from the health feed.
    ///
    /// Reports for Pending instances are held until the instance is Running;
    /// reports for instances on their way out are ignored.
    pub async fn report_readiness(
        &self,
        instance_id: &str,
        ready: bool,
        timestamp: Timestamp,
    ) -> LifecycleResult<()> {
        let mut tiers = self.tiers.write().await;
        let tracked = tiers
            .values_mut()
            .find_map(|slot| slot.instances.get_mut(instance_id))
            .ok_or_else(|| LifecycleError::NotFound(instance_id.to_string()))?;

        let readiness = if ready {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        if tracked.instance.readiness == readiness {
            return Ok(());
        }

        match tracked.instance.lifecycle {
            LifecycleState::Pending => {
                tracked.instance.readiness = readiness;
                debug!(instance = %instance_id, ?readiness, "readiness held until running");
            }
            LifecycleState::Running => {
                tracked.instance.readiness = readiness;
                tracked.instance.updated_at = timestamp;
                let kind = if ready {
                    tracked.ever_ready = true;
                    EventKind::Ready {
                        address: tracked.instance.address.clone().unwrap_or_default(),
                    }
                } else {
                    EventKind::NotReady
                };
                self.events.publish(&tracked.instance, None, kind, timestamp);
                debug!(instance = %instance_id, ?readiness, "readiness changed");
            }
            LifecycleState::Terminating | LifecycleState::Gone => {
                debug!(instance = %instance_id, "ignoring readiness of terminating instance");
            }
        }
        Ok(())
    }

    /// Flag instances that have not become Ready within the creation timeout.
    ///
    /// Each offending instance is reported once; the first one halts its tier.
    /// Nothing is retried or terminated automatically.
    pub async fn check_timeouts(&self, now: Timestamp) -> Vec<InstanceId> {
        let mut flagged = Vec::new();
        let mut tiers = self.tiers.write().await;
        for (tier, slot) in tiers.iter_mut() {
            let mut first = None;
            for tracked in slot.instances.values_mut() {
                let waiting = matches!(
                    tracked.instance.lifecycle,
                    LifecycleState::Pending | LifecycleState::Running
                );
                if !waiting || tracked.ever_ready || tracked.timed_out {
                    continue;
                }
                if now.saturating_sub(tracked.instance.created_at) <= self.creation_timeout {
                    continue;
                }
                tracked.timed_out = true;
                self.events
                    .publish(&tracked.instance, None, EventKind::CreationTimedOut, now);
                warn!(%tier, instance = %tracked.instance.id, "instance creation timed out");
                flagged.push(tracked.instance.id.clone());
                first.get_or_insert_with(|| tracked.instance.id.clone());
            }
            if slot.halted.is_none() {
                if let Some(instance) = first {
                    warn!(%tier, %instance, "tier halted");
                    slot.halted = Some(instance);
                }
            }
        }
        flagged
    }

    /// Resume automated convergence of a halted tier.
    pub async fn clear_halt(&self, tier: &str) -> LifecycleResult<()> {
        let mut tiers = self.tiers.write().await;
        let slot = tiers
            .get_mut(tier)
            .ok_or_else(|| LifecycleError::UnknownTier(tier.to_string()))?;
        if slot.halted.take().is_some() {
            info!(%tier, "tier halt cleared");
        }
        Ok(())
    }

    pub async fn is_halted(&self, tier: &str) -> bool {
        let tiers = self.tiers.read().await;
        tiers.get(tier).is_some_and(|slot| slot.halted.is_some())
    }

    /// Number of Ready instances in `tier`; zero for unknown tiers.
    pub async fn ready_count(&self, tier: &str) -> u32 {
        let tiers = self.tiers.read().await;
        tiers.get(tier).map_or(0, |slot| {
            slot.instances
                .values()
                .filter(|t| t.instance.is_ready())
                .count() as u32
        })
    }

    pub async fn desired_count(&self, tier: &str) -> Option<u32> {
        let tiers = self.tiers.read().await;
        tiers.get(tier).map(|slot| slot.desired)
    }

    /// Snapshot of the instances of `tier`, oldest first.
    pub async fn instances(&self, tier: &str) -> LifecycleResult<Vec<Instance>> {
        let tiers = self.tiers.read().await;
        let slot = tiers
            .get(tier)
            .ok_or_else(|| LifecycleError::UnknownTier(tier.to_string()))?;
        let mut tracked: Vec<&Tracked> = slot.instances.values().collect();
        tracked.sort_by_key(|t| t.seq);
        Ok(tracked.into_iter().map(|t| t.instance.clone()).collect())
    }

    /// Whether `instance_id` is owned by this manager and not yet Gone.
    pub async fn is_known(&self, instance_id: &str) -> bool {
        let tiers = self.tiers.read().await;
        tiers
            .values()
            .any(|slot| slot.instances.contains_key(instance_id))
    }

    /// Ids of every instance not yet Gone, across all tiers.
    pub async fn known_ids(&self) -> HashSet<InstanceId> {
        let tiers = self.tiers.read().await;
        tiers
            .values()
            .flat_map(|slot| slot.instances.keys().cloned())
            .collect()
    }

    /// Ids of the instances currently Ready, across all tiers.
    pub async fn ready_ids(&self) -> HashSet<InstanceId> {
        let tiers = self.tiers.read().await;
        tiers
            .values()
            .flat_map(|slot| slot.instances.values())
            .filter(|t| t.instance.is_ready())
            .map(|t| t.instance.id.clone())
            .collect()
    }

    pub async fn tiers(&self) -> Vec<String> {
        let tiers = self.tiers.read().await;
        let mut names: Vec<String> = tiers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ScaleTarget for LifecycleManager {
    async fn ready_count(&self, tier: &str) -> u32 {
        LifecycleManager::ready_count(self, tier).await
    }

    async fn set_desired_count(&self, tier: &str, replicas: u32) -> Result<(), ScaleError> {
        match LifecycleManager::set_desired_count(self, tier, replicas).await {
            Ok(_) => Ok(()),
            Err(LifecycleError::CreationTimedOut { tier, instance }) => Err(ScaleError::Halted {
                tier,
                reason: format!("instance {instance} did not become ready in time"),
            }),
            Err(e) => Err(ScaleError::Failed(anyhow::Error::new(e))),
        }
    }
}
