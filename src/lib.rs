//! deskfleet - fleet reconciliation engine for isolated remote-desktop
//! worker containers.
//!
//! A declarative fleet size plus base configuration is turned into a
//! desired state (workers, ports, volumes, firewall rules), and external
//! systems — the container runtime, the host firewall, and a dynamic DNS
//! record — are converged to match it. Every run recomputes desired state
//! from scratch and is safe to repeat after partial failure.

pub mod bootstrap;
pub mod config;
pub mod ddns;
pub mod error;
pub mod firewall;
pub mod fleet;
pub mod lifecycle;
pub mod monitor;
pub mod orchestrator;
pub mod runtime;
pub mod verify;
