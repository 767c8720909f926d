//! Fleet lifecycle operations.
//!
//! Start/stop/restart/status/shell/backup/teardown against the container
//! runtime, addressable to the whole fleet or one named worker. Raw runtime
//! responses are wrapped into structured results; nothing here retries —
//! that is a caller decision. Per-worker operations address disjoint
//! runtime resources and may run concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::config::{PathsConfig, RuntimeConfig};
use crate::error::{FleetError, NotFoundError, RuntimeError};
use crate::fleet::{DesiredState, WorkerDesc};
use crate::runtime::{ContainerRuntime, RuntimeObservation};

/// Which workers an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Worker(String),
}

impl Target {
    pub fn from_name(name: Option<String>) -> Self {
        match name {
            Some(n) => Self::Worker(n),
            None => Self::All,
        }
    }
}

/// Result of a backup run.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub destination: PathBuf,
}

pub struct FleetLifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    desired: DesiredState,
    runtime_config: RuntimeConfig,
    paths: PathsConfig,
}

impl FleetLifecycle {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        desired: DesiredState,
        runtime_config: RuntimeConfig,
        paths: PathsConfig,
    ) -> Self {
        Self {
            runtime,
            desired,
            runtime_config,
            paths,
        }
    }

    pub fn desired(&self) -> &DesiredState {
        &self.desired
    }

    fn select(&self, target: &Target) -> Result<Vec<&WorkerDesc>, NotFoundError> {
        match target {
            Target::All => Ok(self.desired.workers.iter().collect()),
            Target::Worker(name) => self
                .desired
                .worker(name)
                .map(|w| vec![w])
                .ok_or_else(|| NotFoundError {
                    name: name.clone(),
                    state: "does not exist",
                }),
        }
    }

    /// Build the worker image. Idempotent: an unchanged image definition is
    /// a cache hit in the runtime.
    pub async fn build(&self) -> Result<(), FleetError> {
        self.runtime
            .build_image(&self.runtime_config.image, &self.runtime_config.build_context)
            .await?;
        Ok(())
    }

    /// Start the targeted workers per the desired bindings. Starting an
    /// already-running worker is a no-op.
    pub async fn up(&self, target: &Target) -> Result<(), FleetError> {
        for worker in self.select(target)? {
            self.runtime.up(worker).await?;
        }
        Ok(())
    }

    /// Stop and remove the targeted workers. Already-stopped is a no-op.
    pub async fn down(&self, target: &Target) -> Result<(), FleetError> {
        for worker in self.select(target)? {
            self.runtime.down(&worker.name).await?;
        }
        Ok(())
    }

    pub async fn restart(&self, target: &Target) -> Result<(), FleetError> {
        self.down(target).await?;
        self.up(target).await
    }

    /// Observe the targeted workers, enriched with one resource-usage
    /// sample per running container.
    pub async fn status(&self, target: &Target) -> Result<Vec<RuntimeObservation>, FleetError> {
        let selected: Vec<String> = self
            .select(target)?
            .into_iter()
            .map(|w| w.name.clone())
            .collect();

        let mut observations: Vec<RuntimeObservation> = self
            .runtime
            .ps()
            .await?
            .into_iter()
            .filter(|o| selected.contains(&o.name))
            .collect();

        match self.runtime.stats().await {
            Ok(samples) => {
                for obs in &mut observations {
                    if let Some(s) = samples.iter().find(|s| s.name == obs.name) {
                        obs.cpu_percent = Some(s.cpu_percent);
                        obs.memory_mb = Some(s.memory_mb);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stats sample unavailable, reporting status without usage");
            }
        }
        Ok(observations)
    }

    /// Interactive shell into one running worker.
    pub async fn shell(&self, name: &str) -> Result<(), FleetError> {
        if self.desired.worker(name).is_none() {
            return Err(NotFoundError {
                name: name.to_string(),
                state: "does not exist",
            }
            .into());
        }
        let running = self
            .runtime
            .ps()
            .await?
            .into_iter()
            .any(|o| o.name == name && o.running);
        if !running {
            return Err(NotFoundError {
                name: name.to_string(),
                state: "is not running",
            }
            .into());
        }
        self.runtime.attach_shell(name).await?;
        Ok(())
    }

    /// Stop the fleet, copy the data/config/scripts trees to a timestamped
    /// archive directory, restart the fleet.
    ///
    /// The restart is guaranteed even when the copy step fails: the copy
    /// result is held until the fleet is back up, then surfaced.
    pub async fn backup(&self) -> Result<BackupReport, FleetError> {
        self.down(&Target::All).await?;

        let destination = self
            .paths
            .backups_dir()
            .join(format!("backup-{}", Utc::now().format("%Y%m%d-%H%M%S")));
        let copy_result = self.copy_trees(&destination).await;

        let restart_result = self.up(&Target::All).await;

        // Copy failure wins the error report; a restart failure on top of a
        // successful copy is still an error.
        copy_result?;
        restart_result?;

        tracing::info!(destination = %destination.display(), "Backup complete, fleet restarted");
        Ok(BackupReport { destination })
    }

    async fn copy_trees(&self, destination: &Path) -> Result<(), FleetError> {
        let sources = [
            self.paths.data_dir(),
            self.paths.config_dir(),
            self.paths.scripts_dir(),
        ];
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), FleetError> {
            std::fs::create_dir_all(&destination)
                .map_err(|e| FleetError::io(format!("creating {}", destination.display()), e))?;
            for source in sources {
                if !source.is_dir() {
                    continue;
                }
                let name = source.file_name().unwrap_or_default();
                copy_dir(&source, &destination.join(name))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| RuntimeError::new("backup", "fleet", e))?
    }

    /// Stop and remove every fleet container, desired or leftover from a
    /// previous (possibly larger) fleet. Absent resources are success, not
    /// failure; only containers carrying the fleet name prefix are touched.
    pub async fn teardown(&self) -> Result<(), FleetError> {
        let mut names: Vec<String> = self
            .runtime
            .ps()
            .await?
            .into_iter()
            .map(|o| o.name)
            .collect();
        for worker in &self.desired.workers {
            if !names.contains(&worker.name) {
                names.push(worker.name.clone());
            }
        }
        for name in names {
            self.runtime.down(&name).await?;
        }
        Ok(())
    }
}

/// Recursive copy preserving the directory shape. Symlinks are skipped.
fn copy_dir(source: &Path, destination: &Path) -> Result<(), FleetError> {
    std::fs::create_dir_all(destination)
        .map_err(|e| FleetError::io(format!("creating {}", destination.display()), e))?;
    let entries = std::fs::read_dir(source)
        .map_err(|e| FleetError::io(format!("reading {}", source.display()), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FleetError::io("reading backup source", e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| FleetError::io("reading backup source", e))?;
        let target = destination.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| FleetError::io(format!("copying to {}", target.display()), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::bootstrap::WorkerJobBlob;
    use crate::error::RuntimeError;
    use crate::fleet::FleetSpec;
    use crate::runtime::WorkerStats;

    #[derive(Default)]
    struct MockRuntime {
        calls: StdMutex<Vec<String>>,
        observations: StdMutex<Vec<RuntimeObservation>>,
    }

    impl MockRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn build_image(&self, image: &str, _context: &Path) -> Result<(), RuntimeError> {
            self.push(format!("build:{image}"));
            Ok(())
        }

        async fn up(&self, worker: &WorkerDesc) -> Result<(), RuntimeError> {
            self.push(format!("up:{}", worker.name));
            Ok(())
        }

        async fn down(&self, name: &str) -> Result<(), RuntimeError> {
            self.push(format!("down:{name}"));
            Ok(())
        }

        async fn ps(&self) -> Result<Vec<RuntimeObservation>, RuntimeError> {
            Ok(self.observations.lock().unwrap().clone())
        }

        async fn exec(&self, name: &str, _command: &[&str]) -> Result<String, RuntimeError> {
            self.push(format!("exec:{name}"));
            Ok(String::new())
        }

        async fn attach_shell(&self, name: &str) -> Result<(), RuntimeError> {
            self.push(format!("shell:{name}"));
            Ok(())
        }

        async fn stats(&self) -> Result<Vec<WorkerStats>, RuntimeError> {
            Ok(vec![WorkerStats {
                name: "deskfleet-worker-1".to_string(),
                cpu_percent: 12.5,
                memory_mb: 300.0,
            }])
        }
    }

    fn desired(size: u32, root: &Path) -> DesiredState {
        let spec = FleetSpec {
            size,
            desktop_base_port: 54040,
            shell_base_port: 52520,
            reserved_ports: BTreeSet::new(),
            domain: "fleet.example.com".to_string(),
        };
        let paths = PathsConfig {
            root: root.to_path_buf(),
        };
        let cfgs: BTreeMap<u32, WorkerJobBlob> =
            (1..=size).map(|i| (i, WorkerJobBlob::default())).collect();
        DesiredState::build(&spec, &paths, &cfgs).unwrap()
    }

    fn lifecycle(size: u32, root: &Path) -> (FleetLifecycle, Arc<MockRuntime>) {
        let runtime = Arc::new(MockRuntime::default());
        let paths = PathsConfig {
            root: root.to_path_buf(),
        };
        let runtime_config = RuntimeConfig {
            image: "deskfleet-worker:latest".to_string(),
            build_context: root.join("image"),
            memory_limit_mb: 2048,
            cpu_shares: 1024,
        };
        (
            FleetLifecycle::new(
                runtime.clone(),
                desired(size, root),
                runtime_config,
                paths,
            ),
            runtime,
        )
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

    #[tokio::test]
    async fn up_all_starts_every_worker_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, runtime) = lifecycle(3, tmp.path());

        lifecycle.up(&Target::All).await.unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                "up:deskfleet-worker-1",
                "up:deskfleet-worker-2",
                "up:deskfleet-worker-3"
            ]
        );
    }

    #[tokio::test]
    async fn unknown_worker_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, _runtime) = lifecycle(2, tmp.path());

        let err = lifecycle
            .up(&Target::Worker("deskfleet-worker-9".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[tokio::test]
    async fn shell_requires_a_running_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, runtime) = lifecycle(2, tmp.path());
        *runtime.observations.lock().unwrap() =
            vec![observation("deskfleet-worker-1", false)];

        let err = lifecycle.shell("deskfleet-worker-1").await.unwrap_err();
        match err {
            FleetError::NotFound(nf) => assert_eq!(nf.state, "is not running"),
            other => panic!("expected NotFound, got: {other:?}"),
        }

        *runtime.observations.lock().unwrap() =
            vec![observation("deskfleet-worker-1", true)];
        lifecycle.shell("deskfleet-worker-1").await.unwrap();
        assert!(runtime.calls().contains(&"shell:deskfleet-worker-1".to_string()));
    }

    #[tokio::test]
    async fn status_merges_stats_into_observations() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, runtime) = lifecycle(2, tmp.path());
        *runtime.observations.lock().unwrap() = vec![
            observation("deskfleet-worker-1", true),
            observation("deskfleet-worker-2", true),
        ];

        let status = lifecycle.status(&Target::All).await.unwrap();
        let w1 = status.iter().find(|o| o.name == "deskfleet-worker-1").unwrap();
        assert_eq!(w1.cpu_percent, Some(12.5));
        let w2 = status.iter().find(|o| o.name == "deskfleet-worker-2").unwrap();
        assert_eq!(w2.cpu_percent, None);
    }

    #[tokio::test]
    async fn backup_copies_trees_and_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, runtime) = lifecycle(1, tmp.path());
        std::fs::create_dir_all(tmp.path().join("data/deskfleet-worker-1")).unwrap();
        std::fs::write(tmp.path().join("data/deskfleet-worker-1/notes.txt"), b"hi").unwrap();

        let report = lifecycle.backup().await.unwrap();
        assert!(report
            .destination
            .join("data/deskfleet-worker-1/notes.txt")
            .is_file());

        let calls = runtime.calls();
        assert_eq!(calls, vec!["down:deskfleet-worker-1", "up:deskfleet-worker-1"]);
    }

    #[tokio::test]
    async fn backup_restarts_even_when_copy_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, runtime) = lifecycle(1, tmp.path());
        // A plain file where the backups directory should go makes the
        // copy step fail while leaving everything else intact.
        std::fs::write(tmp.path().join("backups"), b"not a directory").unwrap();

        let err = lifecycle.backup().await.unwrap_err();
        assert!(matches!(err, FleetError::Io { .. }));

        let calls = runtime.calls();
        assert_eq!(calls, vec!["down:deskfleet-worker-1", "up:deskfleet-worker-1"]);
    }

    #[tokio::test]
    async fn teardown_also_removes_leftovers_from_a_larger_fleet() {
        let tmp = tempfile::tempdir().unwrap();
        let (lifecycle, runtime) = lifecycle(1, tmp.path());
        *runtime.observations.lock().unwrap() = vec![
            observation("deskfleet-worker-1", true),
            observation("deskfleet-worker-2", false),
        ];

        lifecycle.teardown().await.unwrap();

        let calls = runtime.calls();
        assert!(calls.contains(&"down:deskfleet-worker-1".to_string()));
        assert!(calls.contains(&"down:deskfleet-worker-2".to_string()));
    }
}
