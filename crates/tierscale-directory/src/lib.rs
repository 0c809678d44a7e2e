//! tierscale-directory — service discovery for both tiers.
//!
//! Maps service names to the endpoints of their Ready instances. Stateless
//! services are resolved as a pool the caller load-balances across; stateful
//! services are resolved per ordinal, with ordinals that are not Ready shown
//! as explicit holes so a caller can wait for a specific replica.
//!
//! # Consistency
//!
//! ```text
//! stamp()   → monotonically increasing version
//! upsert    → accepted only if newer than the slot and any tombstone;
//!             visible after the propagation delay
//! remove    → synchronous; tombstones the instance at a fresh stamp
//! retire    → synchronous; tombstones the instance as Gone
//! reconcile → purges unknown instances, hides endpoints of instances
//!             that are not Ready, prunes tombstones past retention
//! ```
//!
//! An upsert stamped before a racing remove never resurrects the endpoint,
//! even after the tombstone is pruned: pruning raises a floor that older
//! stamps cannot pass. Reconciliation repairs whatever a lagging event
//! subscriber missed.

pub mod directory;
pub mod error;
pub mod sync;

pub use directory::{
    DEFAULT_TOMBSTONE_RETENTION, InstanceStatus, OrdinalSlot, ReconcileReport, Resolution,
    ResolveMode, ServiceDirectory, UpsertOutcome,
};
pub use error::DirectoryInconsistency;
pub use sync::DirectorySync;
