//! Metrics collector — windowed per-instance utilization samples.
//!
//! Samples are keyed by instance id. The outer map lock is only taken for
//! writing when an instance is seen for the first time; appending a sample
//! locks that instance's series alone.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, info, warn};

use tierscale_state::{EventKind, InstanceEvent, InstanceId, MetricSample, Timestamp};

use crate::error::{MetricsError, MetricsResult};

/// Mean utilization of a tier over its Ready instances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierUtilization {
    pub mean: f64,
    /// Ready instances that contributed at least one sample.
    pub instances: usize,
}

/// What the event stream has told us about an instance.
#[derive(Debug, Clone)]
struct Membership {
    tier: String,
    ready: bool,
}

/// Collects utilization samples and aggregates them per tier.
pub struct MetricsCollector {
    /// instance_id → samples inside the retention window.
    series: Arc<RwLock<HashMap<InstanceId, Arc<Mutex<VecDeque<MetricSample>>>>>>,
    /// instance_id → tier membership and readiness.
    members: Arc<RwLock<HashMap<InstanceId, Membership>>>,
    /// Retention window in seconds.
    window: u64,
    /// Newest timestamp accepted so far.
    high_water: AtomicU64,
}

impl MetricsCollector {
    /// Create a collector retaining `window` worth of samples.
    pub fn new(window: Duration) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            members: Arc::new(RwLock::new(HashMap::new())),
            window: window.as_secs().max(1),
            high_water: AtomicU64::new(0),
        }
    }

    /// Oldest timestamp still inside the window.
    pub fn floor(&self) -> Timestamp {
        self.high_water
            .load(Ordering::Relaxed)
            .saturating_sub(self.window)
    }

    /// Record one utilization sample.
    ///
    /// Rejects negative or non-finite ratios and samples older than the
    /// window floor. A rejected sample changes nothing.
    pub async fn record(
        &self,
        instance_id: &str,
        utilization: f64,
        timestamp: Timestamp,
    ) -> MetricsResult<()> {
        if !utilization.is_finite() || utilization < 0.0 {
            return Err(MetricsError::InvalidSample {
                instance: instance_id.to_string(),
                reason: format!("utilization {utilization} is not a non-negative ratio"),
            });
        }
        let floor = self.floor();
        if timestamp < floor {
            return Err(MetricsError::InvalidSample {
                instance: instance_id.to_string(),
                reason: format!("timestamp {timestamp} is older than window floor {floor}"),
            });
        }
        self.high_water.fetch_max(timestamp, Ordering::Relaxed);
        let floor = self.floor();

        let series = self.series_for(instance_id).await;
        let mut samples = series.lock().await;
        samples.push_back(MetricSample {
            instance_id: instance_id.to_string(),
            timestamp,
            utilization,
        });
        samples.retain(|s| s.timestamp >= floor);
        Ok(())
    }

    async fn series_for(&self, instance_id: &str) -> Arc<Mutex<VecDeque<MetricSample>>> {
        if let Some(s) = self.series.read().await.get(instance_id) {
            return s.clone();
        }
        let mut series = self.series.write().await;
        series
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    /// Apply an instance event to tier membership.
    pub async fn observe(&self, event: &InstanceEvent) {
        match &event.kind {
            EventKind::Created | EventKind::Running { .. } => {
                self.set_membership(event, false).await;
            }
            EventKind::Ready { .. } => {
                self.set_membership(event, true).await;
            }
            EventKind::NotReady | EventKind::Terminating => {
                self.set_membership(event, false).await;
            }
            EventKind::Gone => {
                self.members.write().await.remove(&event.instance_id);
                self.series.write().await.remove(&event.instance_id);
                debug!(instance = %event.instance_id, "dropped samples of gone instance");
            }
            EventKind::CreationTimedOut
            | EventKind::StartupStalled
            | EventKind::TeardownFailed => {}
        }
    }

    async fn set_membership(&self, event: &InstanceEvent, ready: bool) {
        let mut members = self.members.write().await;
        members.insert(
            event.instance_id.clone(),
            Membership {
                tier: event.service.clone(),
                ready,
            },
        );
    }

    /// Mean utilization of `tier`, windowed on the newest sample seen.
    pub async fn aggregate(&self, tier: &str) -> MetricsResult<TierUtilization> {
        self.aggregate_at(tier, self.high_water.load(Ordering::Relaxed))
            .await
    }

    /// Mean utilization of `tier` over samples no older than `now - window`.
    ///
    /// Each Ready instance contributes the mean of its windowed samples; the
    /// tier value is the unweighted mean across instances. Returns `NoData`
    /// when no Ready instance has a sample in the window.
    pub async fn aggregate_at(
        &self,
        tier: &str,
        now: Timestamp,
    ) -> MetricsResult<TierUtilization> {
        let high_water = self.high_water.load(Ordering::Relaxed);
        let floor = now.max(high_water).saturating_sub(self.window);

        let ready: Vec<InstanceId> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|(_, m)| m.ready && m.tier == tier)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let series = self.series.read().await;
        let mut total = 0.0;
        let mut instances = 0usize;
        for id in &ready {
            let Some(samples) = series.get(id) else {
                continue;
            };
            let samples = samples.lock().await;
            let windowed: Vec<f64> = samples
                .iter()
                .filter(|s| s.timestamp >= floor)
                .map(|s| s.utilization)
                .collect();
            if windowed.is_empty() {
                continue;
            }
            total += windowed.iter().sum::<f64>() / windowed.len() as f64;
            instances += 1;
        }

        if instances == 0 {
            return Err(MetricsError::NoData(tier.to_string()));
        }
        Ok(TierUtilization {
            mean: total / instances as f64,
            instances,
        })
    }

    /// Drop samples that fell out of the window and empty series.
    pub async fn prune(&self) -> usize {
        let floor = self.floor();
        let mut series = self.series.write().await;
        let mut dropped = 0;
        for samples in series.values() {
            let mut samples = samples.lock().await;
            let before = samples.len();
            samples.retain(|s| s.timestamp >= floor);
            dropped += before - samples.len();
        }
        let mut empty = Vec::new();
        for (id, samples) in series.iter() {
            if samples.lock().await.is_empty() {
                empty.push(id.clone());
            }
        }
        for id in empty {
            series.remove(&id);
        }
        dropped
    }

    /// Number of retained samples for an instance.
    pub async fn sample_count(&self, instance_id: &str) -> usize {
        match self.series.read().await.get(instance_id) {
            Some(s) => s.lock().await.len(),
            None => 0,
        }
    }

    /// Ready instances currently counted toward `tier`.
    pub async fn ready_members(&self, tier: &str) -> usize {
        let members = self.members.read().await;
        members.values().filter(|m| m.ready && m.tier == tier).count()
    }

    /// Consume instance events until shutdown, pruning once per window.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<InstanceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(window_secs = self.window, "metrics collector started");
        let mut prune = tokio::time::interval(Duration::from_secs(self.window));
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        prune.tick().await;

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.observe(&event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "metrics collector lagged behind instance events");
                    }
                    Err(RecvError::Closed) => {
                        info!("instance event bus closed");
                        break;
                    }
                },
                _ = prune.tick() => {
                    let dropped = self.prune().await;
                    debug!(dropped, "pruned expired samples");
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}
