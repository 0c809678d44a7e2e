//! tierscale-metrics — utilization intake for the autoscaler.
//!
//! Accepts per-instance utilization samples (observed / requested CPU),
//! keeps them inside a sliding window, and aggregates them per tier over
//! the instances that are currently Ready. Readiness and tier membership are
//! learned from the instance event bus.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── record()     ← metrics feed (instance, utilization, timestamp)
//!   ├── observe()    ← instance events (Ready / NotReady / Gone)
//!   ├── aggregate()  → TierUtilization | NoData
//!   └── run()        → event consumption + periodic pruning
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod error;
pub mod prometheus;

pub use collector::{MetricsCollector, TierUtilization};
pub use error::{MetricsError, MetricsResult};
pub use prometheus::{TierReport, render_prometheus};
