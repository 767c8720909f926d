//! Desired-state builder.
//!
//! Turns a [`FleetSpec`] plus per-worker job configuration into the complete
//! target specification: every worker with its ports, volume bindings and
//! environment, and the exact firewall rule set. The output is recomputed
//! fresh on every run and never mutated in place; ordered collections
//! (`Vec` by index, `BTreeMap`, `BTreeSet`) keep recomputation byte-stable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::bootstrap::WorkerJobBlob;
use crate::config::PathsConfig;
use crate::error::ConfigError;
use crate::fleet::{FleetSpec, PortPair, allocate, validate_ports, worker_name};

/// Guest-side port the remote-desktop server listens on.
pub const GUEST_DESKTOP_PORT: u16 = 5901;
/// Guest-side port the shell-access server listens on.
pub const GUEST_SHELL_PORT: u16 = 22;

/// Offset added to the worker index for the in-guest display number, so
/// co-located workers never collide on a display.
const DISPLAY_BASE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BindMode {
    ReadWrite,
    ReadOnly,
}

impl BindMode {
    /// Suffix used in runtime bind strings.
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::ReadWrite => "rw",
            Self::ReadOnly => "ro",
        }
    }
}

/// One host path mounted into a worker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VolumeBinding {
    pub host: PathBuf,
    pub container: String,
    pub mode: BindMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum Protocol {
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum Direction {
    Inbound,
}

/// One firewall allowance derived from the desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct FirewallRule {
    pub port: u16,
    pub protocol: Protocol,
    pub direction: Direction,
}

impl FirewallRule {
    pub fn tcp_in(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            direction: Direction::Inbound,
        }
    }
}

/// Everything needed to run one worker. Derived deterministically from the
/// spec and index; never hand-edited.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkerDesc {
    /// 1-based fleet index.
    pub index: u32,
    /// Unique container name, derived from the index.
    pub name: String,
    /// Host port forwarded to the guest remote-desktop server.
    pub desktop_port: u16,
    /// Host port forwarded to the guest shell server.
    pub shell_port: u16,
    pub volumes: Vec<VolumeBinding>,
    pub env: BTreeMap<String, String>,
}

impl WorkerDesc {
    /// Host-port → guest-port mappings for this worker.
    pub fn port_mappings(&self) -> [(u16, u16); 2] {
        [
            (self.desktop_port, GUEST_DESKTOP_PORT),
            (self.shell_port, GUEST_SHELL_PORT),
        ]
    }
}

/// The complete target configuration for one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DesiredState {
    /// Workers ordered by index; unique names, unique ports.
    pub workers: Vec<WorkerDesc>,
    /// Exactly the ports referenced by `workers` plus the fixed
    /// administrative set — no orphan rules, no missing rules.
    pub firewall_rules: BTreeSet<FirewallRule>,
}

impl DesiredState {
    /// Build the desired state for `spec`.
    ///
    /// Fails with [`ConfigError`] if the port allocation is invalid or if
    /// `job_configs` is missing an entry for any index in `1..=size`.
    pub fn build(
        spec: &FleetSpec,
        paths: &PathsConfig,
        job_configs: &BTreeMap<u32, WorkerJobBlob>,
    ) -> Result<Self, ConfigError> {
        validate_ports(spec)?;

        let mut workers = Vec::with_capacity(spec.size as usize);
        let mut firewall_rules: BTreeSet<FirewallRule> = spec
            .reserved_ports
            .iter()
            .map(|&p| FirewallRule::tcp_in(p))
            .collect();

        for index in 1..=spec.size {
            if !job_configs.contains_key(&index) {
                return Err(ConfigError::MissingWorkerConfig { index });
            }
            let PortPair { desktop, shell } = allocate(index, spec)?;
            let name = worker_name(index);

            let volumes = vec![
                VolumeBinding {
                    host: paths.worker_data_dir(&name),
                    container: "/home/worker/data".to_string(),
                    mode: BindMode::ReadWrite,
                },
                VolumeBinding {
                    host: paths.scripts_dir(),
                    container: "/opt/deskfleet/scripts".to_string(),
                    mode: BindMode::ReadOnly,
                },
                VolumeBinding {
                    host: paths.worker_config_file(&name),
                    container: "/opt/deskfleet/job.json".to_string(),
                    mode: BindMode::ReadOnly,
                },
            ];

            let mut env = BTreeMap::new();
            env.insert("WORKER_ID".to_string(), name.clone());
            env.insert("WORKER_INDEX".to_string(), index.to_string());
            env.insert("DISPLAY".to_string(), format!(":{}", DISPLAY_BASE + index));

            firewall_rules.insert(FirewallRule::tcp_in(desktop));
            firewall_rules.insert(FirewallRule::tcp_in(shell));

            workers.push(WorkerDesc {
                index,
                name,
                desktop_port: desktop,
                shell_port: shell,
                volumes,
                env,
            });
        }

        Ok(Self {
            workers,
            firewall_rules,
        })
    }

    /// All host ports the fleet needs reachable, in ascending order.
    pub fn worker_ports(&self) -> BTreeSet<u16> {
        self.workers
            .iter()
            .flat_map(|w| [w.desktop_port, w.shell_port])
            .collect()
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerDesc> {
        self.workers.iter().find(|w| w.name == name)
    }
}
