//! Post-convergence verification.
//!
//! Read-only health checks aggregated into a [`VerificationReport`]:
//! runtime reachable, expected worker count running, every desired port
//! locally reachable, DDNS healthy (active scheduler, or a record that
//! matches the public address), firewall active. Nothing here
//! mutates runtime, firewall, or DNS state; a failing check carries enough
//! detail (which port, which worker) to diagnose.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::ddns::DdnsReconciler;
use crate::firewall::FirewallSync;
use crate::fleet::DesiredState;
use crate::runtime::ContainerRuntime;

/// Aggregated check results plus per-check failure details.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub runtime_up: bool,
    /// Observed running workers vs. the desired count.
    pub workers_running: usize,
    pub workers_desired: usize,
    /// Desired host ports that answered a local TCP probe.
    pub ports_open: BTreeSet<u16>,
    pub ports_desired: BTreeSet<u16>,
    pub ddns_active: bool,
    pub firewall_active: bool,
    /// Human-readable failure details, empty iff the report passes.
    pub failures: Vec<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "runtime up:       {}", self.runtime_up)?;
        writeln!(
            f,
            "workers running:  {}/{}",
            self.workers_running, self.workers_desired
        )?;
        writeln!(
            f,
            "ports open:       {}/{}",
            self.ports_open.len(),
            self.ports_desired.len()
        )?;
        writeln!(f, "ddns active:      {}", self.ddns_active)?;
        writeln!(f, "firewall active:  {}", self.firewall_active)?;
        if self.passed() {
            write!(f, "result:           PASS")
        } else {
            writeln!(f, "result:           FAIL")?;
            for failure in &self.failures {
                writeln!(f, "  - {failure}")?;
            }
            Ok(())
        }
    }
}

pub struct Verifier {
    runtime: Arc<dyn ContainerRuntime>,
    firewall: Arc<FirewallSync>,
    ddns: Arc<DdnsReconciler>,
    probe_timeout: Duration,
}

impl Verifier {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        firewall: Arc<FirewallSync>,
        ddns: Arc<DdnsReconciler>,
    ) -> Self {
        Self {
            runtime,
            firewall,
            ddns,
            probe_timeout: Duration::from_secs(2),
        }
    }

    /// Run every check against `desired`. Individual check failures land in
    /// the report, never as an error — the operator always gets the full
    /// picture of actual state.
    pub async fn run(&self, desired: &DesiredState) -> VerificationReport {
        let mut report = VerificationReport {
            workers_desired: desired.workers.len(),
            ports_desired: desired.worker_ports(),
            ..Default::default()
        };

        match self.runtime.ping().await {
            Ok(()) => report.runtime_up = true,
            Err(e) => report.failures.push(format!("container runtime unreachable: {e}")),
        }

        if report.runtime_up {
            match self.runtime.ps().await {
                Ok(observed) => {
                    let running: Vec<&str> = observed
                        .iter()
                        .filter(|o| o.running)
                        .map(|o| o.name.as_str())
                        .collect();
                    report.workers_running = running.len();
                    for worker in &desired.workers {
                        if !running.contains(&worker.name.as_str()) {
                            report
                                .failures
                                .push(format!("worker '{}' is not running", worker.name));
                        }
                    }
                }
                Err(e) => report.failures.push(format!("runtime observation failed: {e}")),
            }
        }

        for &port in &report.ports_desired.clone() {
            if probe_port("127.0.0.1", port, self.probe_timeout).await {
                report.ports_open.insert(port);
            } else {
                let owner = desired
                    .workers
                    .iter()
                    .find(|w| w.desktop_port == port || w.shell_port == port)
                    .map(|w| w.name.as_str())
                    .unwrap_or("unknown");
                report
                    .failures
                    .push(format!("port {port} ({owner}) is not reachable locally"));
            }
        }

        report.ddns_active = self.ddns.status().is_active().await;
        if !report.ddns_active {
            // No live loop and no recent tick in this process. A standalone
            // check can still pass: compare the provider record against the
            // discovered address, read-only.
            match self.ddns.is_converged().await {
                Ok(true) => report.ddns_active = true,
                Ok(false) => report.failures.push(
                    "DNS record is missing or does not match the public address".to_string(),
                ),
                Err(e) => report
                    .failures
                    .push(format!("DNS convergence check failed: {e}")),
            }
        }

        match self.firewall.is_active().await {
            Ok(active) => {
                report.firewall_active = active;
                if !active {
                    report.failures.push("firewall is not active".to_string());
                }
            }
            Err(e) => report.failures.push(format!("firewall status check failed: {e}")),
        }

        report
    }
}

/// True when a TCP connection to `host:port` succeeds within `timeout`.
pub async fn probe_port(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::bootstrap::WorkerJobBlob;
    use crate::config::{DdnsConfig, PathsConfig};
    use crate::ddns::{DnsProvider, DnsRecord, PublicAddressSource};
    use crate::error::{EnvironmentError, ExternalServiceError, RuntimeError};
    use crate::firewall::FirewallBackend;
    use crate::fleet::{FirewallRule, FleetSpec, WorkerDesc};
    use crate::runtime::{RuntimeObservation, WorkerStats};

    struct MockRuntime {
        reachable: bool,
        observations: StdMutex<Vec<RuntimeObservation>>,
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn ping(&self) -> Result<(), RuntimeError> {
            if self.reachable {
                Ok(())
            } else {
                Err(RuntimeError::new("ping", "docker", "daemon down"))
            }
        }

        async fn build_image(&self, _image: &str, _context: &Path) -> Result<(), RuntimeError> {
            panic!("verification must not build images");
        }

        async fn up(&self, _worker: &WorkerDesc) -> Result<(), RuntimeError> {
            panic!("verification must not start workers");
        }

        async fn down(&self, _name: &str) -> Result<(), RuntimeError> {
            panic!("verification must not stop workers");
        }

        async fn ps(&self) -> Result<Vec<RuntimeObservation>, RuntimeError> {
            Ok(self.observations.lock().unwrap().clone())
        }

        async fn exec(&self, _name: &str, _command: &[&str]) -> Result<String, RuntimeError> {
            panic!("verification must not exec");
        }

        async fn attach_shell(&self, _name: &str) -> Result<(), RuntimeError> {
            panic!("verification must not attach");
        }

        async fn stats(&self) -> Result<Vec<WorkerStats>, RuntimeError> {
            Ok(vec![])
        }
    }

    /// Firewall that panics on any mutation, proving verification is
    /// read-only.
    struct ReadOnlyFirewall {
        active: bool,
    }

    #[async_trait]
    impl FirewallBackend for ReadOnlyFirewall {
        async fn available(&self) -> Result<(), EnvironmentError> {
            panic!("verification must not touch firewall setup");
        }

        async fn reset(&self) -> Result<(), EnvironmentError> {
            panic!("verification must not reset the firewall");
        }

        async fn set_default_policies(&self) -> Result<(), EnvironmentError> {
            panic!("verification must not change policies");
        }

        async fn allow(&self, _rule: FirewallRule) -> Result<(), EnvironmentError> {
            panic!("verification must not add rules");
        }

        async fn enable(&self) -> Result<(), EnvironmentError> {
            panic!("verification must not enable the firewall");
        }

        async fn is_active(&self) -> Result<bool, EnvironmentError> {
            Ok(self.active)
        }
    }

    fn desired(size: u32) -> DesiredState {
        let spec = FleetSpec {
            size,
            desktop_base_port: 54040,
            shell_base_port: 52520,
            reserved_ports: BTreeSet::new(),
            domain: "fleet.example.com".to_string(),
        };
        let paths = PathsConfig {
            root: PathBuf::from("/srv/deskfleet"),
        };
        let cfgs: BTreeMap<u32, WorkerJobBlob> =
            (1..=size).map(|i| (i, WorkerJobBlob::default())).collect();
        DesiredState::build(&spec, &paths, &cfgs).unwrap()
    }

    fn observation(name: &str, running: bool) -> RuntimeObservation {
        RuntimeObservation {
            name: name.to_string(),
            running,
            ports: BTreeSet::new(),
            cpu_percent: None,
            memory_mb: None,
        }
    }

    /// Reconciler over static mocks; no events recorded, no loop running —
    /// exactly the state a standalone check starts from.
    fn ddns(
        discovered: Result<Ipv4Addr, String>,
        record: Option<DnsRecord>,
    ) -> Arc<DdnsReconciler> {
        struct StaticDiscovery {
            result: Result<Ipv4Addr, String>,
        }
        #[async_trait]
        impl PublicAddressSource for StaticDiscovery {
            async fn discover(&self) -> Result<Ipv4Addr, ExternalServiceError> {
                self.result
                    .clone()
                    .map_err(|last| ExternalServiceError::DiscoveryExhausted { last })
            }
        }
        struct StaticDns {
            record: Option<DnsRecord>,
        }
        #[async_trait]
        impl DnsProvider for StaticDns {
            async fn get_record(
                &self,
                _name: &str,
            ) -> Result<Option<DnsRecord>, ExternalServiceError> {
                Ok(self.record.clone())
            }
            async fn create_record(&self, _r: &DnsRecord) -> Result<(), ExternalServiceError> {
                panic!("verification must not create records");
            }
            async fn update_record(
                &self,
                _id: &str,
                _r: &DnsRecord,
            ) -> Result<(), ExternalServiceError> {
                panic!("verification must not update records");
            }
        }

        let config = DdnsConfig {
            proxied: false,
            interval: Duration::from_secs(300),
            jitter: Duration::from_secs(0),
            call_timeout: Duration::from_secs(1),
        };
        Arc::new(DdnsReconciler::new(
            Arc::new(StaticDiscovery { result: discovered }),
            Arc::new(StaticDns { record }),
            &config,
            "fleet.example.com".to_string(),
        ))
    }

    /// A converged record: the mock provider answers with the same address
    /// the mock discovery reports.
    fn converged_ddns() -> Arc<DdnsReconciler> {
        ddns(
            Ok("203.0.113.7".parse().unwrap()),
            Some(DnsRecord {
                id: Some("rec-1".to_string()),
                name: "fleet.example.com".to_string(),
                content: "203.0.113.7".parse().unwrap(),
                proxied: false,
            }),
        )
    }

    #[tokio::test]
    async fn missing_worker_fails_and_is_named() {
        let runtime = Arc::new(MockRuntime {
            reachable: true,
            observations: StdMutex::new(vec![
                observation("deskfleet-worker-1", true),
                observation("deskfleet-worker-2", true),
                observation("deskfleet-worker-3", false),
            ]),
        });
        let firewall = Arc::new(FirewallSync::new(Arc::new(ReadOnlyFirewall {
            active: true,
        })));
        let verifier = Verifier::new(runtime, firewall, converged_ddns());

        let report = verifier.run(&desired(3)).await;

        assert!(!report.passed());
        assert_eq!(report.workers_running, 2);
        assert_eq!(report.workers_desired, 3);
        assert!(
            report
                .failures
                .iter()
                .any(|f| f.contains("deskfleet-worker-3")),
            "missing worker not named: {:?}",
            report.failures
        );
    }

    #[tokio::test]
    async fn empty_fleet_with_healthy_services_passes() {
        let runtime = Arc::new(MockRuntime {
            reachable: true,
            observations: StdMutex::new(vec![]),
        });
        let firewall = Arc::new(FirewallSync::new(Arc::new(ReadOnlyFirewall {
            active: true,
        })));
        let verifier = Verifier::new(runtime, firewall, converged_ddns());

        let report = verifier.run(&desired(0)).await;
        assert!(report.passed(), "failures: {:?}", report.failures);
        assert!(report.runtime_up);
        assert!(report.firewall_active);
        assert!(report.ddns_active);
    }

    #[tokio::test]
    async fn standalone_check_passes_via_record_comparison() {
        // Fresh process: no reconcile loop, no recorded ticks. The check
        // must still be able to pass on a healthy host.
        let runtime = Arc::new(MockRuntime {
            reachable: true,
            observations: StdMutex::new(vec![]),
        });
        let firewall = Arc::new(FirewallSync::new(Arc::new(ReadOnlyFirewall {
            active: true,
        })));
        let ddns = converged_ddns();
        assert!(ddns.status().last_event().await.is_none());

        let verifier = Verifier::new(runtime, firewall, ddns);
        let report = verifier.run(&desired(0)).await;

        assert!(report.passed(), "failures: {:?}", report.failures);
        assert!(report.ddns_active);
    }

    #[tokio::test]
    async fn stale_record_fails_the_standalone_check() {
        let runtime = Arc::new(MockRuntime {
            reachable: true,
            observations: StdMutex::new(vec![]),
        });
        let firewall = Arc::new(FirewallSync::new(Arc::new(ReadOnlyFirewall {
            active: true,
        })));
        let ddns = ddns(
            Ok("203.0.113.9".parse().unwrap()),
            Some(DnsRecord {
                id: Some("rec-1".to_string()),
                name: "fleet.example.com".to_string(),
                content: "203.0.113.7".parse().unwrap(),
                proxied: false,
            }),
        );

        let verifier = Verifier::new(runtime, firewall, ddns);
        let report = verifier.run(&desired(0)).await;

        assert!(!report.passed());
        assert!(!report.ddns_active);
        assert!(
            report
                .failures
                .iter()
                .any(|f| f.contains("does not match")),
            "failures: {:?}",
            report.failures
        );
    }

    #[tokio::test]
    async fn unreachable_runtime_is_reported_not_fatal() {
        let runtime = Arc::new(MockRuntime {
            reachable: false,
            observations: StdMutex::new(vec![]),
        });
        let firewall = Arc::new(FirewallSync::new(Arc::new(ReadOnlyFirewall {
            active: false,
        })));
        let verifier = Verifier::new(
            runtime,
            firewall,
            ddns(Err("all sources down".to_string()), None),
        );

        let report = verifier.run(&desired(0)).await;
        assert!(!report.passed());
        assert!(!report.runtime_up);
        assert!(report.failures.iter().any(|f| f.contains("unreachable")));
        assert!(report.failures.iter().any(|f| f.contains("firewall")));
        assert!(report.failures.iter().any(|f| f.contains("DNS")));
    }

    #[tokio::test]
    async fn probe_detects_open_and_closed_ports() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe_port("127.0.0.1", port, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!probe_port("127.0.0.1", port, Duration::from_secs(1)).await);
    }
}
