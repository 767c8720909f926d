//! Read-only monitoring loop.
//!
//! Periodic snapshot of container status, resource usage, port
//! reachability, and the last DDNS event, logged for human observation.
//! Completely independent of reconciliation: it never mutates state and
//! tolerates being interleaved with lifecycle operations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MonitorConfig;
use crate::ddns::DdnsStatus;
use crate::fleet::DesiredState;
use crate::runtime::ContainerRuntime;
use crate::verify::probe_port;

/// One snapshot of observable fleet state.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub workers_running: usize,
    pub workers_total: usize,
    pub ports_open: usize,
    pub ports_total: usize,
    pub last_ddns: Option<String>,
}

pub struct MonitorLoop {
    runtime: Arc<dyn ContainerRuntime>,
    ddns: DdnsStatus,
    desired: DesiredState,
    interval: Duration,
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

impl MonitorLoop {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ddns: DdnsStatus,
        desired: DesiredState,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            runtime,
            ddns,
            desired,
            interval: config.interval,
        }
    }

    /// Take one snapshot. Runtime errors degrade the snapshot rather than
    /// failing it — a monitoring pass must never crash on a flaky
    /// dependency.
    pub async fn snapshot(&self) -> Snapshot {
        let (mut running, mut usage_lines) = (0, Vec::new());
        match self.runtime.ps().await {
            Ok(observed) => {
                running = observed.iter().filter(|o| o.running).count();
                if let Ok(samples) = self.runtime.stats().await {
                    for s in samples {
                        usage_lines.push(format!(
                            "{}: cpu {:.1}% mem {:.0}MB",
                            s.name, s.cpu_percent, s.memory_mb
                        ));
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Monitor could not observe runtime"),
        }

        let mut ports_open = 0;
        let ports = self.desired.worker_ports();
        for &port in &ports {
            if probe_port("127.0.0.1", port, Duration::from_secs(2)).await {
                ports_open += 1;
            }
        }

        let last_ddns = self
            .ddns
            .last_event()
            .await
            .map(|e| format!("{} at {}", e.outcome, e.at.format("%H:%M:%S")));

        let snapshot = Snapshot {
            workers_running: running,
            workers_total: self.desired.workers.len(),
            ports_open,
            ports_total: ports.len(),
            last_ddns,
        };

        tracing::info!(
            workers = format!("{}/{}", snapshot.workers_running, snapshot.workers_total),
            ports = format!("{}/{}", snapshot.ports_open, snapshot.ports_total),
            ddns = snapshot.last_ddns.as_deref().unwrap_or("no activity"),
            "Fleet snapshot"
        );
        for line in usage_lines {
            tracing::info!(target: "deskfleet::usage", "{line}");
        }
        snapshot
    }

    /// Spawn the periodic loop; snapshots continue until shutdown. The
    /// interval fires immediately, so the first snapshot is taken at spawn
    /// time — callers must not take their own snapshot beforehand.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.snapshot().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        MonitorHandle { shutdown_tx, task }
    }
}
