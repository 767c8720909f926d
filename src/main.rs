//! deskfleet - Main entry point.
//!
//! All presentation (prompting, printing, exit codes) lives here; the
//! library returns structured results and typed errors.

use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deskfleet::{
    bootstrap,
    config::{Config, DdnsCredentials},
    ddns::{CloudflareDns, DdnsReconciler, DdnsStatus, HttpDiscovery},
    firewall::{FirewallSync, ufw::UfwBackend},
    fleet::DesiredState,
    lifecycle::{FleetLifecycle, Target},
    monitor::MonitorLoop,
    orchestrator::{RebuildOrchestrator, StageOutcome},
    runtime::{ContainerRuntime, docker::DockerRuntime},
    verify::Verifier,
};

#[derive(Parser, Debug)]
#[command(name = "deskfleet")]
#[command(about = "Provision and operate a fleet of isolated remote-desktop workers")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tear down and rebuild the whole fleet (asks for confirmation)
    Rebuild,
    /// Start all workers, or one by name
    Start { name: Option<String> },
    /// Stop all workers, or one by name
    Stop { name: Option<String> },
    /// Restart all workers, or one by name
    Restart { name: Option<String> },
    /// Show the status of every worker
    Status,
    /// Open an interactive shell into a running worker
    Shell { name: String },
    /// Back up data, config and scripts; the fleet restarts afterwards
    Backup,
    /// Reconcile the DNS record once, or keep it reconciled with --watch
    Dns {
        #[arg(long)]
        watch: bool,
    },
    /// Run the read-only verification pass
    Verify,
    /// Periodically log a read-only fleet snapshot (Ctrl-C to stop)
    Monitor,
}

/// Components wired from config. Built once per invocation; nothing is
/// cached between runs.
struct App {
    config: Config,
    desired: DesiredState,
    runtime: Arc<DockerRuntime>,
    lifecycle: Arc<FleetLifecycle>,
    firewall: Arc<FirewallSync>,
}

impl App {
    fn from_env() -> anyhow::Result<Self> {
        let config = Config::from_env()?;
        let job_configs = bootstrap::job_configs(&config.fleet, &config.job);
        let desired = DesiredState::build(&config.fleet, &config.paths, &job_configs)?;

        let runtime = Arc::new(DockerRuntime::new(config.runtime.clone()));
        let lifecycle = Arc::new(FleetLifecycle::new(
            runtime.clone(),
            desired.clone(),
            config.runtime.clone(),
            config.paths.clone(),
        ));
        let firewall = Arc::new(FirewallSync::new(Arc::new(UfwBackend::new())));

        Ok(Self {
            config,
            desired,
            runtime,
            lifecycle,
            firewall,
        })
    }

    /// DNS components, built only for the commands that talk to the
    /// provider. Credentials are resolved here, not at startup, so local
    /// operations never require them.
    fn ddns(&self) -> anyhow::Result<Arc<DdnsReconciler>> {
        let credentials = DdnsCredentials::resolve()?;
        Ok(Arc::new(DdnsReconciler::new(
            Arc::new(HttpDiscovery::new(self.config.ddns.call_timeout)?),
            Arc::new(CloudflareDns::new(
                credentials.zone_id,
                credentials.api_token,
                self.config.ddns.call_timeout,
            )?),
            &self.config.ddns,
            self.config.fleet.domain.clone(),
        )))
    }

    fn verifier(&self, ddns: Arc<DdnsReconciler>) -> Verifier {
        Verifier::new(
            self.runtime.clone() as Arc<dyn ContainerRuntime>,
            self.firewall.clone(),
            ddns,
        )
    }
}

/// Interactive confirmation for the destructive rebuild. Deliberately not
/// a flag: the gate cannot be pre-answered by configuration.
fn confirm_rebuild(fleet_size: u32) -> bool {
    print!(
        "This will STOP and REMOVE all {fleet_size} fleet containers and reset the firewall.\n\
         Type 'yes' to continue: "
    );
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim().eq_ignore_ascii_case("yes")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deskfleet=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let app = App::from_env()?;

    match args.command {
        Command::Rebuild => {
            let ddns = app.ddns()?;
            let job_configs = bootstrap::job_configs(&app.config.fleet, &app.config.job);
            let orchestrator = RebuildOrchestrator::new(
                app.runtime.clone(),
                app.lifecycle.clone(),
                app.firewall.clone(),
                ddns.clone(),
                app.verifier(ddns),
                app.config.fleet.clone(),
                app.config.paths.clone(),
                job_configs,
            );
            let size = app.config.fleet.size;
            let report = orchestrator.run(|| confirm_rebuild(size)).await;

            println!("\nRebuild stages:");
            for stage in &report.stages {
                let outcome = match &stage.outcome {
                    StageOutcome::Ok => "ok".to_string(),
                    StageOutcome::Warned(w) => format!("warning: {w}"),
                    StageOutcome::Failed(e) => format!("FAILED: {e}"),
                    StageOutcome::Skipped => "skipped".to_string(),
                };
                println!("  {:<18} {outcome}", stage.stage.name());
            }
            if let Some(verification) = &report.verification {
                println!("\n{verification}");
            }
            if !report.succeeded() {
                if let Some(failed) = report.failed_stage() {
                    anyhow::bail!("rebuild failed at stage '{}'", failed.stage.name());
                }
                anyhow::bail!("rebuild finished but verification did not pass");
            }
        }
        Command::Start { name } => {
            app.lifecycle.up(&Target::from_name(name)).await?;
            println!("started");
        }
        Command::Stop { name } => {
            app.lifecycle.down(&Target::from_name(name)).await?;
            println!("stopped");
        }
        Command::Restart { name } => {
            app.lifecycle.restart(&Target::from_name(name)).await?;
            println!("restarted");
        }
        Command::Status => {
            let observations = app.lifecycle.status(&Target::All).await?;
            if observations.is_empty() {
                println!("no fleet containers found");
            }
            for obs in observations {
                let state = if obs.running { "running" } else { "stopped" };
                let usage = match (obs.cpu_percent, obs.memory_mb) {
                    (Some(cpu), Some(mem)) => format!("  cpu {cpu:.1}%  mem {mem:.0}MB"),
                    _ => String::new(),
                };
                let ports: Vec<String> = obs.ports.iter().map(|p| p.to_string()).collect();
                println!("{:<22} {state:<8} ports [{}]{usage}", obs.name, ports.join(", "));
            }
        }
        Command::Shell { name } => {
            app.lifecycle.shell(&name).await?;
        }
        Command::Backup => {
            let report = app.lifecycle.backup().await?;
            println!("backup written to {}", report.destination.display());
        }
        Command::Dns { watch } => {
            let ddns = app.ddns()?;
            let outcome = ddns.reconcile_once().await?;
            println!("{outcome}");
            if watch {
                let handle = ddns.spawn();
                println!("watching (Ctrl-C to stop)");
                tokio::signal::ctrl_c().await?;
                handle.shutdown().await;
            }
        }
        Command::Verify => {
            let report = app.verifier(app.ddns()?).run(&app.desired).await;
            println!("{report}");
            if !report.passed() {
                anyhow::bail!("verification failed");
            }
        }
        Command::Monitor => {
            // No reconcile loop runs in this process, so the DDNS column
            // starts empty; the loop belongs to `dns --watch`.
            let monitor = MonitorLoop::new(
                app.runtime.clone() as Arc<dyn ContainerRuntime>,
                DdnsStatus::default(),
                app.desired.clone(),
                &app.config.monitor,
            );
            let handle = monitor.spawn();
            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
        }
    }

    Ok(())
}
