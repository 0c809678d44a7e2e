//! TierController — the per-tier autoscaling state machine.
//!
//! Each tick:
//! 1. aggregate the tier's utilization (`NoData` skips the tick untouched)
//! 2. `desired = ceil(ready × observed / target)`, clamped to the policy
//! 3. bound the move by the step limits around the previous commanded count
//! 4. commit scale-up at once; commit scale-down only once every computed
//!    value in the trailing stabilization window is below the previous count
//! 5. command the target if the committed count differs from the last one

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tierscale_metrics::{MetricsCollector, MetricsError};
use tierscale_state::{
    ControllerCheckpoint, ScaleError, ScaleTarget, ScalingPolicy, StateStore, Timestamp,
    epoch_secs,
};

/// Result of evaluating one utilization reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Command the tier to this many replicas.
    ScaleTo(u32),
    /// A lower count was computed but has not yet held for the whole window.
    Hold { computed: u32, previous: u32 },
    /// Committed count equals the last commanded one.
    NoChange(u32),
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No Ready instance had samples in the window; nothing changed.
    NoData,
    Unchanged(u32),
    Held { computed: u32, commanded: u32 },
    Scaled { from: Option<u32>, to: u32 },
    /// The target refused the command because the tier is halted.
    Halted(String),
    CommandFailed(String),
}

/// Control loop for a single tier.
pub struct TierController {
    tier: String,
    policy: ScalingPolicy,
    metrics: Arc<MetricsCollector>,
    target: Arc<dyn ScaleTarget>,
    last_commanded: Option<u32>,
    /// Computed counts of the most recent ticks, oldest first.
    history: VecDeque<u32>,
    state: Option<StateStore>,
}

impl TierController {
    pub fn new(
        tier: &str,
        policy: ScalingPolicy,
        metrics: Arc<MetricsCollector>,
        target: Arc<dyn ScaleTarget>,
    ) -> Self {
        Self {
            tier: tier.to_string(),
            policy,
            metrics,
            target,
            last_commanded: None,
            history: VecDeque::new(),
            state: None,
        }
    }

    /// Checkpoint commanded counts to `state`, resuming from any saved one.
    pub fn with_state(mut self, state: StateStore) -> Self {
        match state.get_checkpoint(&self.tier) {
            Ok(Some(checkpoint)) => {
                info!(tier = %self.tier, last_commanded = checkpoint.last_commanded, "resuming from checkpoint");
                self.last_commanded = Some(checkpoint.last_commanded);
            }
            Ok(None) => {}
            Err(e) => warn!(tier = %self.tier, error = %e, "failed to load controller checkpoint"),
        }
        self.state = Some(state);
        self
    }

    pub fn last_commanded(&self) -> Option<u32> {
        self.last_commanded
    }

    /// Decide what to do given the current ready count and mean utilization.
    ///
    /// Records the computed count in the stabilization history; does not
    /// update the last commanded count.
    pub fn evaluate(&mut self, ready: u32, observed: f64) -> ScaleDecision {
        let policy = &self.policy;

        let raw = (f64::from(ready) * observed / policy.target_utilization).ceil();
        let raw = if raw.is_finite() && raw > 0.0 {
            raw.min(f64::from(u32::MAX)) as u32
        } else {
            0
        };
        let desired = policy.clamp(raw);

        let previous = self.last_commanded.unwrap_or(ready);
        let lower = previous.saturating_sub(policy.scale_down_step_limit);
        let upper = previous.saturating_add(policy.scale_up_step_limit);
        let computed = policy.clamp(desired.clamp(lower, upper));

        let window = policy.stabilization_window.max(1) as usize;
        self.history.push_back(computed);
        while self.history.len() > window {
            self.history.pop_front();
        }

        let committed = if computed > previous {
            computed
        } else if computed < previous {
            let stable =
                self.history.len() == window && self.history.iter().all(|&v| v < previous);
            if !stable {
                return ScaleDecision::Hold { computed, previous };
            }
            self.history.iter().copied().max().unwrap_or(computed)
        } else {
            previous
        };

        if Some(committed) == self.last_commanded {
            ScaleDecision::NoChange(committed)
        } else {
            ScaleDecision::ScaleTo(committed)
        }
    }

    /// Run one tick using the collector's newest data.
    pub async fn tick(&mut self) -> TickOutcome {
        self.tick_at(epoch_secs()).await
    }

    /// Run one tick; `now` stamps the checkpoint.
    pub async fn tick_at(&mut self, now: Timestamp) -> TickOutcome {
        let utilization = match self.metrics.aggregate(&self.tier).await {
            Ok(u) => u,
            Err(MetricsError::NoData(_)) => {
                debug!(tier = %self.tier, "no utilization data, skipping tick");
                return TickOutcome::NoData;
            }
            Err(e) => {
                warn!(tier = %self.tier, error = %e, "aggregation failed, skipping tick");
                return TickOutcome::NoData;
            }
        };
        let ready = self.target.ready_count(&self.tier).await;

        let replicas = match self.evaluate(ready, utilization.mean) {
            ScaleDecision::NoChange(n) => return TickOutcome::Unchanged(n),
            ScaleDecision::Hold { computed, previous } => {
                debug!(tier = %self.tier, computed, previous, "scale-down held for stabilization");
                return TickOutcome::Held {
                    computed,
                    commanded: previous,
                };
            }
            ScaleDecision::ScaleTo(n) => n,
        };

        match self.target.set_desired_count(&self.tier, replicas).await {
            Ok(()) => {
                let from = self.last_commanded.replace(replicas);
                info!(
                    tier = %self.tier,
                    from = ?from,
                    to = replicas,
                    ready,
                    utilization = utilization.mean,
                    target = self.policy.target_utilization,
                    "replica count commanded"
                );
                self.checkpoint(replicas, now);
                TickOutcome::Scaled { from, to: replicas }
            }
            Err(ScaleError::Halted { reason, .. }) => {
                warn!(tier = %self.tier, %reason, "tier halted, command not applied");
                TickOutcome::Halted(reason)
            }
            Err(e) => {
                error!(tier = %self.tier, replicas, error = %e, "scale command failed");
                TickOutcome::CommandFailed(e.to_string())
            }
        }
    }

    fn checkpoint(&self, replicas: u32, now: Timestamp) {
        if let Some(state) = &self.state
            && let Err(e) = state.put_checkpoint(&ControllerCheckpoint {
                tier: self.tier.clone(),
                last_commanded: replicas,
                updated_at: now,
            })
        {
            warn!(tier = %self.tier, error = %e, "failed to checkpoint commanded count");
        }
    }

    /// Tick on a fixed period until shutdown. A tick in flight completes first.
    pub async fn run(&mut self, period: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(tier = %self.tier, period_secs = period.as_secs(), "tier controller started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    debug!(tier = %self.tier, ?outcome, "tick");
                }
                _ = shutdown.changed() => {
                    info!(tier = %self.tier, "tier controller shutting down");
                    break;
                }
            }
        }
    }
}
