//! tierscale-state — shared state for the tierscale control plane.
//!
//! Holds the domain types every component speaks (instances, samples,
//! policies, endpoints, stateful replicas), the instance event bus that
//! carries lifecycle and readiness transitions between components, the
//! `tierscale.toml` schema, and a [redb](https://docs.rs/redb)-backed store
//! for the little state that must outlive the process: scaling policies,
//! storage bindings and controller checkpoints.
//!
//! # Architecture
//!
//! ```text
//! LifecycleManager ─┐                  ┌─> MetricsCollector (tier membership)
//!                   ├─> EventBus ──────┤
//! IdentityAllocator ┘                  └─> DirectorySync (endpoint visibility)
//!
//! StateStore (redb)
//!   ├── policies     {service}
//!   ├── bindings     {service}:{ordinal}
//!   └── checkpoints  {tier}
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod store;
pub mod tables;
pub mod target;
pub mod types;

pub use config::{ControllerConfig, ServiceConfig, TierscaleConfig};
pub use error::{ConfigError, PolicyError, ScaleError, StateError, StateResult};
pub use events::{EventBus, EventKind, InstanceEvent};
pub use store::StateStore;
pub use target::ScaleTarget;
pub use types::*;
