//! The rebuild orchestrator.
//!
//! A deterministic, strictly-ordered pipeline: confirm → teardown previous
//! instance → host dependencies → firewall sync → image build → fleet up →
//! one-shot DDNS reconcile → verification. Each stage depends on the one
//! before it; the first fatal error aborts the rest, but the verification
//! pass always runs so the operator sees the actual resulting state rather
//! than being left uninformed. Teardown is idempotent: absent resources
//! count as success.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bootstrap::{self, WorkerJobBlob};
use crate::config::PathsConfig;
use crate::ddns::DdnsReconciler;
use crate::error::{EnvironmentError, FleetError};
use crate::firewall::FirewallSync;
use crate::fleet::FleetSpec;
use crate::lifecycle::{FleetLifecycle, Target};
use crate::runtime::ContainerRuntime;
use crate::verify::{VerificationReport, Verifier};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Confirmation,
    Teardown,
    HostDependencies,
    FirewallSync,
    ImageBuild,
    FleetUp,
    DdnsOneShot,
    Verification,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Confirmation => "confirmation",
            Self::Teardown => "teardown",
            Self::HostDependencies => "host dependencies",
            Self::FirewallSync => "firewall sync",
            Self::ImageBuild => "image build",
            Self::FleetUp => "fleet up",
            Self::DdnsOneShot => "ddns one-shot",
            Self::Verification => "verification",
        }
    }
}

/// Result of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    /// Non-fatal problem (only the DDNS one-shot produces this).
    Warned(String),
    /// Fatal: this stage failed and aborted the stages after it.
    Failed(String),
    /// Not executed because an earlier stage failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub outcome: StageOutcome,
}

/// Everything the operator needs to know about a rebuild run.
#[derive(Debug)]
pub struct RebuildReport {
    pub stages: Vec<StageReport>,
    /// Present unless the run was declined at the confirmation gate.
    pub verification: Option<VerificationReport>,
}

impl RebuildReport {
    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|s| !matches!(s.outcome, StageOutcome::Failed(_)))
            && self.verification.as_ref().is_some_and(|v| v.passed())
    }

    /// The first fatal stage, if any.
    pub fn failed_stage(&self) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|s| matches!(s.outcome, StageOutcome::Failed(_)))
    }
}

pub struct RebuildOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    lifecycle: Arc<FleetLifecycle>,
    firewall: Arc<FirewallSync>,
    ddns: Arc<DdnsReconciler>,
    verifier: Verifier,
    spec: FleetSpec,
    paths: PathsConfig,
    job_configs: BTreeMap<u32, WorkerJobBlob>,
}

impl RebuildOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        lifecycle: Arc<FleetLifecycle>,
        firewall: Arc<FirewallSync>,
        ddns: Arc<DdnsReconciler>,
        verifier: Verifier,
        spec: FleetSpec,
        paths: PathsConfig,
        job_configs: BTreeMap<u32, WorkerJobBlob>,
    ) -> Self {
        Self {
            runtime,
            lifecycle,
            firewall,
            ddns,
            verifier,
            spec,
            paths,
            job_configs,
        }
    }

    /// Execute the full rebuild.
    ///
    /// `confirm` is the explicit user gate before the destructive teardown;
    /// it is a required callback, not a configuration flag, so it cannot be
    /// bypassed by config. Declining stops the run before anything is
    /// touched.
    pub async fn run(&self, confirm: impl FnOnce() -> bool) -> RebuildReport {
        let mut stages = Vec::new();

        if !confirm() {
            tracing::warn!("Rebuild declined at the confirmation gate, nothing was changed");
            stages.push(StageReport {
                stage: Stage::Confirmation,
                outcome: StageOutcome::Failed("declined by operator".to_string()),
            });
            return RebuildReport {
                stages,
                verification: None,
            };
        }
        stages.push(StageReport {
            stage: Stage::Confirmation,
            outcome: StageOutcome::Ok,
        });

        let mut aborted = false;

        for stage in [
            Stage::Teardown,
            Stage::HostDependencies,
            Stage::FirewallSync,
            Stage::ImageBuild,
            Stage::FleetUp,
        ] {
            if aborted {
                stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Skipped,
                });
                continue;
            }
            tracing::info!(stage = stage.name(), "Running rebuild stage");
            match self.run_stage(stage).await {
                Ok(()) => stages.push(StageReport {
                    stage,
                    outcome: StageOutcome::Ok,
                }),
                Err(e) => {
                    tracing::error!(stage = stage.name(), error = %e, "Rebuild stage failed");
                    stages.push(StageReport {
                        stage,
                        outcome: StageOutcome::Failed(e.to_string()),
                    });
                    aborted = true;
                }
            }
        }

        // DDNS one-shot: failure is a warning, not pipeline-fatal — the
        // record can be set manually and everything else still converged.
        if aborted {
            stages.push(StageReport {
                stage: Stage::DdnsOneShot,
                outcome: StageOutcome::Skipped,
            });
        } else {
            match self.ddns.reconcile_once().await {
                Ok(outcome) => {
                    tracing::info!(outcome = %outcome, "DDNS one-shot complete");
                    stages.push(StageReport {
                        stage: Stage::DdnsOneShot,
                        outcome: StageOutcome::Ok,
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "DDNS one-shot failed; set the record manually if needed");
                    stages.push(StageReport {
                        stage: Stage::DdnsOneShot,
                        outcome: StageOutcome::Warned(e.to_string()),
                    });
                }
            }
        }

        // Verification always runs, even after an abort, so the report
        // reflects the real (possibly partial) state.
        let verification = self.verifier.run(self.lifecycle.desired()).await;
        stages.push(StageReport {
            stage: Stage::Verification,
            outcome: if verification.passed() {
                StageOutcome::Ok
            } else {
                StageOutcome::Warned(format!("{} check(s) failed", verification.failures.len()))
            },
        });

        RebuildReport {
            stages,
            verification: Some(verification),
        }
    }

    async fn run_stage(&self, stage: Stage) -> Result<(), FleetError> {
        match stage {
            Stage::Teardown => self.lifecycle.teardown().await,
            Stage::HostDependencies => self.host_dependencies().await,
            Stage::FirewallSync => {
                self.firewall.sync(self.lifecycle.desired()).await?;
                Ok(())
            }
            Stage::ImageBuild => self.lifecycle.build().await,
            Stage::FleetUp => self.lifecycle.up(&Target::All).await,
            // Handled inline in `run`; not reachable through run_stage.
            Stage::Confirmation | Stage::DdnsOneShot | Stage::Verification => Ok(()),
        }
    }

    /// Verify host capabilities and prepare the directory tree the fleet
    /// mounts from.
    async fn host_dependencies(&self) -> Result<(), FleetError> {
        self.runtime.ping().await.map_err(|e| EnvironmentError {
            capability: "container runtime",
            cause: e.to_string(),
            hint: "install Docker and ensure the daemon is running",
        })?;
        self.firewall.available().await?;
        bootstrap::prepare_tree(&self.spec, &self.paths, &self.job_configs)?;
        Ok(())
    }
}
