//! Container runtime contract.
//!
//! The core depends only on this trait, never on a specific runtime. The
//! production implementation is [`docker::DockerRuntime`] (bollard); tests
//! substitute in-memory mocks.

pub mod docker;

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::fleet::WorkerDesc;

/// Point-in-time view of one worker, fetched from the runtime on demand and
/// never cached across reconciliation steps.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeObservation {
    pub name: String,
    pub running: bool,
    /// Host ports the runtime reports as published.
    pub ports: BTreeSet<u16>,
    /// CPU usage in percent, when a stats sample was taken.
    pub cpu_percent: Option<f64>,
    /// Memory usage in MB, when a stats sample was taken.
    pub memory_mb: Option<f64>,
}

/// One resource-usage sample for a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStats {
    pub name: String,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Operations the core needs from a container runtime.
///
/// All operations are idempotent where the contract says so: starting a
/// running worker and stopping an absent one are no-ops, not errors.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Build the worker image from `context`. Re-running with an unchanged
    /// image definition is a cache hit.
    async fn build_image(&self, image: &str, context: &Path) -> Result<(), RuntimeError>;

    /// Create (if needed) and start the container for `worker` with its
    /// port bindings, volumes and environment.
    async fn up(&self, worker: &WorkerDesc) -> Result<(), RuntimeError>;

    /// Stop and remove the named container. Absent containers are a no-op.
    async fn down(&self, name: &str) -> Result<(), RuntimeError>;

    /// Observe all fleet containers (scoped by the fleet name prefix).
    async fn ps(&self) -> Result<Vec<RuntimeObservation>, RuntimeError>;

    /// Run a command inside a running worker and return its output.
    async fn exec(&self, name: &str, command: &[&str]) -> Result<String, RuntimeError>;

    /// Attach an interactive shell to a running worker (blocks until the
    /// session ends).
    async fn attach_shell(&self, name: &str) -> Result<(), RuntimeError>;

    /// One resource-usage sample per running fleet container.
    async fn stats(&self) -> Result<Vec<WorkerStats>, RuntimeError>;
}
