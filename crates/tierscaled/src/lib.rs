//! tierscaled — assembly of the tierscale control plane.
//!
//! Wires the metrics collector, service directory, lifecycle manager,
//! identity allocators and tier controllers around one instance event bus,
//! and runs their loops until shutdown. The binary in `main.rs` adds the
//! CLI, logging and the HTTP listener.

pub mod simulated;
pub mod standalone;

pub use simulated::{SimulatedProvisioner, SimulatedStorage};
pub use standalone::ControlPlane;
