//! Standalone control plane — every component in one process.
//!
//! `ControlPlane::assemble` builds the components from a validated config;
//! `start` subscribes the event consumers, spawns the periodic loops and
//! applies the initial replica counts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tierscale_api::{ApiState, build_router};
use tierscale_autoscale::TierController;
use tierscale_directory::{DirectorySync, InstanceStatus, ReconcileReport, ServiceDirectory};
use tierscale_lifecycle::{LifecycleManager, Provisioner};
use tierscale_metrics::MetricsCollector;
use tierscale_state::{
    EventBus, EventKind, InstanceEvent, InstanceId, ScaleTarget, StateStore, Tier,
    TierscaleConfig, Timestamp, epoch_secs,
};
use tierscale_stateful::{IdentityAllocator, StorageProvider};

/// The assembled control plane.
#[derive(Clone)]
pub struct ControlPlane {
    pub config: Arc<TierscaleConfig>,
    pub store: StateStore,
    pub events: EventBus,
    pub metrics: Arc<MetricsCollector>,
    pub directory: Arc<ServiceDirectory>,
    pub lifecycle: LifecycleManager,
    pub allocators: Arc<HashMap<String, Arc<IdentityAllocator>>>,
}

impl ControlPlane {
    /// Build all components. Policies from the config are persisted to `store`.
    pub async fn assemble(
        config: TierscaleConfig,
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        storage: Arc<dyn StorageProvider>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let controller = &config.controller;

        let events = EventBus::new(controller.event_capacity);
        let metrics = Arc::new(MetricsCollector::new(Duration::from_secs(
            controller.metrics_window_secs,
        )));
        let directory = Arc::new(
            ServiceDirectory::new(Duration::from_millis(controller.directory_propagation_ms))
                .with_tombstone_retention(Duration::from_secs(controller.tombstone_retention_secs)),
        );
        let lifecycle = LifecycleManager::new(
            provisioner.clone(),
            events.clone(),
            Duration::from_secs(controller.creation_timeout_secs),
        );

        let mut allocators = HashMap::new();
        for service in &config.services {
            if let Some(policy) = &service.policy {
                store.put_policy(&service.name, policy)?;
            }
            match service.tier {
                Tier::Stateless => lifecycle.register_tier(&service.name).await,
                Tier::Stateful => {
                    let allocator = IdentityAllocator::new(
                        &service.name,
                        provisioner.clone(),
                        storage.clone(),
                        store.clone(),
                        events.clone(),
                        Duration::from_secs(controller.startup_timeout_secs),
                    );
                    allocators.insert(service.name.clone(), Arc::new(allocator));
                }
            }
            info!(service = %service.name, tier = ?service.tier, "service registered");
        }

        Ok(Self {
            config: Arc::new(config),
            store,
            events,
            metrics,
            directory,
            lifecycle,
            allocators: Arc::new(allocators),
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            directory: self.directory.clone(),
            lifecycle: self.lifecycle.clone(),
            allocators: self.allocators.clone(),
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.api_state())
    }

    /// Spawn every background loop and apply the initial replica counts.
    ///
    /// With `auto_ready`, instances are reported Ready as soon as they are
    /// Running, standing in for an external health feed.
    pub async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
        auto_ready: bool,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let controller = &self.config.controller;
        let reconcile_period = Duration::from_millis(controller.reconcile_ms);
        let mut handles = Vec::new();

        // Subscribe before anything can publish.
        let metrics_events = self.events.subscribe();
        let sync_events = self.events.subscribe();
        let ready_events = auto_ready.then(|| self.events.subscribe());

        {
            let metrics = self.metrics.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                metrics.run(metrics_events, shutdown).await;
            }));
        }
        {
            let sync = DirectorySync::new(self.directory.clone());
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                sync.run(sync_events, shutdown).await;
            }));
        }
        if let Some(events) = ready_events {
            let plane = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                plane.auto_ready(events, shutdown).await;
            }));
        }

        for service in &self.config.services {
            let Some(policy) = &service.policy else {
                continue;
            };
            let target: Arc<dyn ScaleTarget> = match self.allocators.get(&service.name) {
                Some(allocator) => allocator.clone(),
                None => Arc::new(self.lifecycle.clone()),
            };
            let mut tier_controller = TierController::new(
                &service.name,
                policy.clone(),
                self.metrics.clone(),
                target,
            )
            .with_state(self.store.clone());
            let period = Duration::from_secs(controller.tick_secs);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tier_controller.run(period, shutdown).await;
            }));
        }

        for allocator in self.allocators.values() {
            let allocator = allocator.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                allocator.run(reconcile_period, shutdown).await;
            }));
        }

        {
            let plane = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(reconcile_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            plane.housekeeping(epoch_secs()).await;
                        }
                        _ = shutdown.changed() => {
                            info!("housekeeping shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        self.apply_initial_counts().await?;
        info!(tasks = handles.len(), "control plane started");
        Ok(handles)
    }

    /// Commanded counts survive a restart through the controller checkpoint;
    /// otherwise the configured replica count applies, clamped to the policy.
    async fn apply_initial_counts(&self) -> anyhow::Result<()> {
        for service in &self.config.services {
            let checkpoint = self.store.get_checkpoint(&service.name)?;
            let replicas = match (&checkpoint, &service.policy) {
                (Some(checkpoint), _) => checkpoint.last_commanded,
                (None, Some(policy)) => policy.clamp(service.replicas),
                (None, None) => service.replicas,
            };

            match self.allocators.get(&service.name) {
                Some(allocator) => {
                    allocator.set_replicas(replicas).await;
                }
                None => {
                    if let Err(e) = self
                        .lifecycle
                        .set_desired_count(&service.name, replicas)
                        .await
                    {
                        warn!(service = %service.name, replicas, error = %e, "initial scale failed");
                    }
                }
            }
            info!(
                service = %service.name,
                replicas,
                restored = checkpoint.is_some(),
                "initial replica count applied"
            );
        }
        Ok(())
    }

    /// One housekeeping pass: creation timeouts, stateless re-convergence,
    /// ordinal declarations and directory repair.
    pub async fn housekeeping(&self, now: Timestamp) -> ReconcileReport {
        let timed_out = self.lifecycle.check_timeouts(now).await;
        if !timed_out.is_empty() {
            warn!(count = timed_out.len(), "instances exceeded the creation timeout");
        }

        for tier in self.lifecycle.tiers().await {
            match self.lifecycle.converge(&tier).await {
                Ok(report) if !report.created.is_empty() || !report.terminated.is_empty() => {
                    info!(
                        %tier,
                        created = report.created.len(),
                        terminated = report.terminated.len(),
                        "tier re-converged"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(%tier, error = %e, "re-convergence failed"),
            }
        }

        // Stamp before asking the owners: endpoints written after the
        // snapshot are left for the next pass.
        let watermark = self.directory.stamp();
        let mut known: HashSet<InstanceId> = self.lifecycle.known_ids().await;
        let mut ready: HashSet<InstanceId> = self.lifecycle.ready_ids().await;
        for (name, allocator) in self.allocators.iter() {
            self.directory
                .declare_ordinals(name, allocator.desired().await);
            known.extend(allocator.known_ids().await);
            ready.extend(allocator.ready_ids().await);
        }

        self.directory.reconcile(watermark, |_, instance_id| {
            if ready.contains(instance_id) {
                InstanceStatus::Ready
            } else if known.contains(instance_id) {
                InstanceStatus::NotReady
            } else {
                InstanceStatus::Unknown
            }
        })
    }

    async fn auto_ready(
        &self,
        mut events: broadcast::Receiver<InstanceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("auto-ready enabled");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        if let EventKind::Running { .. } = event.kind {
                            self.mark_ready(&event).await;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "auto-ready lagged behind instance events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn mark_ready(&self, event: &InstanceEvent) {
        let now = epoch_secs();
        let result = match self.allocators.get(&event.service) {
            Some(allocator) => allocator
                .report_readiness(&event.instance_id, true, now)
                .await
                .map_err(anyhow::Error::from),
            None => self
                .lifecycle
                .report_readiness(&event.instance_id, true, now)
                .await
                .map_err(anyhow::Error::from),
        };
        match result {
            Ok(()) => debug!(instance = %event.instance_id, "auto-ready"),
            Err(e) => debug!(instance = %event.instance_id, error = %e, "auto-ready skipped"),
        }
    }
}
