//! tierscale-autoscale — utilization-driven replica control.
//!
//! One `TierController` per tier ticks on a fixed period: it reads the
//! tier's mean utilization from the metrics collector, derives a desired
//! replica count from the scaling policy, and commands the tier's
//! `ScaleTarget` when the committed count changes. Scale-up is immediate;
//! scale-down must persist across the stabilization window.

pub mod controller;

pub use controller::{ScaleDecision, TickOutcome, TierController};
