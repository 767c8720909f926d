//! Desired-state model for the fleet.
//!
//! A [`FleetSpec`] is the immutable input to a reconciliation run. From it
//! the builder derives a [`DesiredState`] — the complete, recomputable
//! target configuration: one [`WorkerDesc`] per index plus the exact
//! firewall rule set. Recomputing with the same spec yields byte-identical
//! results; nothing in this module performs I/O.

pub mod desired;
pub mod ports;

use std::collections::BTreeSet;

pub use desired::{BindMode, DesiredState, Direction, FirewallRule, Protocol, VolumeBinding, WorkerDesc};
pub use ports::{PortPair, allocate, validate_ports};

/// Stable container name prefix. Teardown and status queries are scoped to
/// this prefix so unrelated host containers are never touched.
pub const CONTAINER_PREFIX: &str = "deskfleet-worker-";

/// Immutable input to a reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FleetSpec {
    /// Number of workers. Zero is a valid (empty) fleet.
    pub size: u32,
    /// Base for the remote-desktop port namespace; worker i gets base + i.
    pub desktop_base_port: u16,
    /// Base for the shell-access port namespace; worker i gets base + i.
    pub shell_base_port: u16,
    /// Administrative ports no worker may be allocated onto.
    pub reserved_ports: BTreeSet<u16>,
    /// DNS name the fleet is registered under.
    pub domain: String,
}

/// Derive the stable container name for a worker index.
pub fn worker_name(index: u32) -> String {
    format!("{CONTAINER_PREFIX}{index}")
}
