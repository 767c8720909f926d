//! Firewall synchronization.
//!
//! The rule set required by a [`DesiredState`] replaces the host firewall's
//! managed rules wholesale: disable, full reset, default-deny-inbound /
//! allow-outbound, then allow exactly the desired rules, then enable.
//! Replace-not-merge guarantees no stale rule from a previous run (e.g. a
//! shrunk fleet) survives.
//!
//! The firewall is briefly disabled during the reset, so all mutation and
//! status reads go through a single-writer lock. `sync` must never run
//! concurrently with itself or with a verification status check.

pub mod ufw;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::EnvironmentError;
use crate::fleet::{DesiredState, FirewallRule};

/// Host firewall control seam. The production implementation is
/// [`ufw::UfwBackend`]; tests substitute recording mocks.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Verify the control interface is present and usable.
    async fn available(&self) -> Result<(), EnvironmentError>;

    /// Disable the firewall and wipe every managed rule.
    async fn reset(&self) -> Result<(), EnvironmentError>;

    /// Default-deny inbound, default-allow outbound.
    async fn set_default_policies(&self) -> Result<(), EnvironmentError>;

    async fn allow(&self, rule: FirewallRule) -> Result<(), EnvironmentError>;

    async fn enable(&self) -> Result<(), EnvironmentError>;

    async fn is_active(&self) -> Result<bool, EnvironmentError>;
}

/// Serializes all firewall access behind one lock.
pub struct FirewallSync {
    backend: Arc<dyn FirewallBackend>,
    lock: Mutex<()>,
}

impl FirewallSync {
    pub fn new(backend: Arc<dyn FirewallBackend>) -> Self {
        Self {
            backend,
            lock: Mutex::new(()),
        }
    }

    /// Replace the firewall's managed rules with exactly those derived from
    /// `desired`. Holding the lock for the whole reset-then-apply bracket
    /// keeps the disabled window exclusive.
    pub async fn sync(&self, desired: &DesiredState) -> Result<(), EnvironmentError> {
        let _guard = self.lock.lock().await;

        self.backend.available().await?;
        self.backend.reset().await?;
        self.backend.set_default_policies().await?;
        for rule in &desired.firewall_rules {
            self.backend.allow(*rule).await?;
        }
        self.backend.enable().await?;

        tracing::info!(
            rules = desired.firewall_rules.len(),
            "Firewall rules replaced with desired set"
        );
        Ok(())
    }

    /// Read-only status check, serialized against `sync` so it never
    /// observes the mid-reset disabled window.
    pub async fn is_active(&self) -> Result<bool, EnvironmentError> {
        let _guard = self.lock.lock().await;
        self.backend.is_active().await
    }

    /// Check the control interface exists without touching any rule.
    pub async fn available(&self) -> Result<(), EnvironmentError> {
        let _guard = self.lock.lock().await;
        self.backend.available().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::bootstrap::WorkerJobBlob;
    use crate::config::PathsConfig;
    use crate::fleet::FleetSpec;

    /// Records the exact call sequence; `allow` calls land between the
    /// markers so stale-rule behavior is observable.
    #[derive(Default)]
    struct RecordingBackend {
        calls: StdMutex<Vec<String>>,
        active: StdMutex<bool>,
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        async fn available(&self) -> Result<(), EnvironmentError> {
            self.calls.lock().unwrap().push("available".to_string());
            Ok(())
        }

        async fn reset(&self) -> Result<(), EnvironmentError> {
            let mut calls = self.calls.lock().unwrap();
            // Reset wipes everything applied so far.
            calls.retain(|c| !c.starts_with("allow"));
            calls.push("reset".to_string());
            *self.active.lock().unwrap() = false;
            Ok(())
        }

        async fn set_default_policies(&self) -> Result<(), EnvironmentError> {
            self.calls.lock().unwrap().push("defaults".to_string());
            Ok(())
        }

        async fn allow(&self, rule: FirewallRule) -> Result<(), EnvironmentError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("allow:{}", rule.port));
            Ok(())
        }

        async fn enable(&self) -> Result<(), EnvironmentError> {
            self.calls.lock().unwrap().push("enable".to_string());
            *self.active.lock().unwrap() = true;
            Ok(())
        }

        async fn is_active(&self) -> Result<bool, EnvironmentError> {
            Ok(*self.active.lock().unwrap())
        }
    }

    fn desired(size: u32) -> DesiredState {
        let spec = FleetSpec {
            size,
            desktop_base_port: 54040,
            shell_base_port: 52520,
            reserved_ports: [22, 51800].into_iter().collect(),
            domain: "fleet.example.com".to_string(),
        };
        let paths = PathsConfig {
            root: PathBuf::from("/srv/deskfleet"),
        };
        let cfgs: BTreeMap<u32, WorkerJobBlob> =
            (1..=size).map(|i| (i, WorkerJobBlob::default())).collect();
        DesiredState::build(&spec, &paths, &cfgs).unwrap()
    }

    fn allowed_ports(backend: &RecordingBackend) -> BTreeSet<u16> {
        backend
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| c.strip_prefix("allow:"))
            .map(|p| p.parse().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn sync_applies_reset_then_rules_then_enable() {
        let backend = Arc::new(RecordingBackend::default());
        let sync = FirewallSync::new(backend.clone());

        sync.sync(&desired(2)).await.unwrap();

        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls[0], "available");
        assert_eq!(calls[1], "reset");
        assert_eq!(calls[2], "defaults");
        assert_eq!(calls.last().unwrap(), "enable");
        assert!(sync.is_active().await.unwrap());
    }

    #[tokio::test]
    async fn sync_twice_yields_same_effective_rule_set() {
        let backend = Arc::new(RecordingBackend::default());
        let sync = FirewallSync::new(backend.clone());
        let state = desired(3);

        sync.sync(&state).await.unwrap();
        let first = allowed_ports(&backend);
        sync.sync(&state).await.unwrap();
        let second = allowed_ports(&backend);

        assert_eq!(first, second);
        assert_eq!(
            first,
            [22, 51800, 54041, 54042, 54043, 52521, 52522, 52523]
                .into_iter()
                .collect()
        );
    }

    #[tokio::test]
    async fn shrinking_the_fleet_leaves_no_stale_rules() {
        let backend = Arc::new(RecordingBackend::default());
        let sync = FirewallSync::new(backend.clone());

        sync.sync(&desired(3)).await.unwrap();
        sync.sync(&desired(1)).await.unwrap();

        let ports = allowed_ports(&backend);
        assert!(ports.contains(&54041));
        assert!(!ports.contains(&54042), "stale rule survived the reset");
        assert!(!ports.contains(&52523), "stale rule survived the reset");
    }
}
