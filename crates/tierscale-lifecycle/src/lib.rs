//! tierscale-lifecycle — instance lifecycle for the stateless tier.
//!
//! The `LifecycleManager` converges each registered tier towards a desired
//! instance count, one instance at a time. Creation is two-phase: the
//! instance is registered as Pending and its id handed back immediately,
//! while the external `Provisioner` allocates it in the background. Every
//! transition is published on the instance event bus.
//!
//! ```text
//! set_desired_count ──> Pending ──(provisioner)──> Running ──(health feed)──> Ready
//!                          │                          │                        │
//! terminate ───────────────┴──> Gone      Terminating <┴────────────────────────┘
//!                                              └──(provisioner)──> Gone
//! ```

pub mod error;
pub mod manager;
pub mod provisioner;

pub use error::{LifecycleError, LifecycleResult};
pub use manager::{ConvergeReport, LifecycleManager};
pub use provisioner::Provisioner;
