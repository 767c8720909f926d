//! Docker implementation of the container runtime contract.
//!
//! All queries are scoped to the fleet's container name prefix so nothing
//! else on the host is ever observed or removed. The Docker connection is
//! created lazily on first use and then cached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::fleet::{CONTAINER_PREFIX, WorkerDesc};
use crate::runtime::{ContainerRuntime, RuntimeObservation, WorkerStats};

/// Bollard-backed runtime.
pub struct DockerRuntime {
    config: RuntimeConfig,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<bollard::Docker>>>,
}

impl DockerRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create the Docker connection.
    async fn docker(&self) -> Result<bollard::Docker, RuntimeError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = bollard::Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::new("connect", "docker", e))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::new("connect", "docker", e))?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    /// True when the error is a 404 from the daemon (resource already gone).
    fn is_not_found(err: &bollard::errors::Error) -> bool {
        matches!(
            err,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }

    fn prefix_filter() -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![CONTAINER_PREFIX.to_string()]);
        filters
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;
        docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::new("ping", "docker", e))
    }

    async fn build_image(&self, image: &str, context: &Path) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;

        // Tar up the build context in a blocking task; bollard wants the
        // whole archive as the request body.
        let context_dir = context.to_path_buf();
        let tarball = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut builder = tar::Builder::new(Vec::new());
            builder.append_dir_all(".", &context_dir)?;
            builder.into_inner()
        })
        .await
        .map_err(|e| RuntimeError::new("build", image, e))?
        .map_err(|e| RuntimeError::new("build", image, e))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(tarball.into()));
        while let Some(msg) = stream.next().await {
            let info = msg.map_err(|e| RuntimeError::new("build", image, e))?;
            if let Some(err) = info.error {
                return Err(RuntimeError::new("build", image, err));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(target: "deskfleet::build", "{line}");
                }
            }
        }
        tracing::info!(image, "Image build complete");
        Ok(())
    }

    async fn up(&self, worker: &WorkerDesc) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;

        // Already running is a no-op; an existing stopped container is
        // restarted as-is.
        match docker.inspect_container(&worker.name, None).await {
            Ok(existing) => {
                let running = existing
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if running {
                    tracing::debug!(worker = %worker.name, "Already running, up is a no-op");
                    return Ok(());
                }
                docker
                    .start_container::<String>(&worker.name, None)
                    .await
                    .map_err(|e| RuntimeError::new("up", &worker.name, e))?;
                tracing::info!(worker = %worker.name, "Restarted existing container");
                return Ok(());
            }
            Err(e) if Self::is_not_found(&e) => {}
            Err(e) => return Err(RuntimeError::new("up", &worker.name, e)),
        }

        let binds: Vec<String> = worker
            .volumes
            .iter()
            .map(|v| {
                format!(
                    "{}:{}:{}",
                    v.host.display(),
                    v.container,
                    v.mode.as_flag()
                )
            })
            .collect();

        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for (host_port, guest_port) in worker.port_mappings() {
            let key = format!("{guest_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            memory: Some((self.config.memory_limit_mb * 1024 * 1024) as i64),
            cpu_shares: Some(self.config.cpu_shares as i64),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            shm_size: Some(512 * 1024 * 1024),
            ..Default::default()
        };

        let env: Vec<String> = worker
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let container_config = Config {
            image: Some(self.config.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: worker.name.clone(),
            ..Default::default()
        };

        docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| RuntimeError::new("up", &worker.name, e))?;
        docker
            .start_container::<String>(&worker.name, None)
            .await
            .map_err(|e| RuntimeError::new("up", &worker.name, e))?;

        tracing::info!(
            worker = %worker.name,
            desktop_port = worker.desktop_port,
            shell_port = worker.shell_port,
            "Created and started worker container"
        );
        Ok(())
    }

    async fn down(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;

        match docker
            .stop_container(name, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {}
            Err(e) if Self::is_not_found(&e) => {
                tracing::debug!(worker = name, "Nothing to stop, down is a no-op");
                return Ok(());
            }
            Err(e) => {
                // 304 means already stopped; anything else still gets removed.
                tracing::debug!(worker = name, error = %e, "Stop reported an error, continuing to remove");
            }
        }

        match docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(worker = name, "Stopped and removed container");
                Ok(())
            }
            Err(e) if Self::is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::new("down", name, e)),
        }
    }

    async fn ps(&self) -> Result<Vec<RuntimeObservation>, RuntimeError> {
        let docker = self.docker().await?;
        let containers = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: Self::prefix_filter(),
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::new("ps", "fleet", e))?;

        let mut observations = Vec::with_capacity(containers.len());
        for c in containers {
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let running = c.state.as_deref() == Some("running");
            let ports = c
                .ports
                .unwrap_or_default()
                .into_iter()
                .filter_map(|p| p.public_port)
                .collect();
            observations.push(RuntimeObservation {
                name,
                running,
                ports,
                cpu_percent: None,
                memory_mb: None,
            });
        }
        observations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(observations)
    }

    async fn exec(&self, name: &str, command: &[&str]) -> Result<String, RuntimeError> {
        let docker = self.docker().await?;

        let exec = docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(command.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::new("exec", name, e))?;

        let mut collected = String::new();
        match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::new("exec", name, e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| RuntimeError::new("exec", name, e))? {
                        LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                            collected.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }
        Ok(collected)
    }

    async fn attach_shell(&self, name: &str) -> Result<(), RuntimeError> {
        let docker = self.docker().await?;

        let exec = docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/bash".to_string()]),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::new("shell", name, e))?;

        if let StartExecResults::Attached {
            mut output,
            mut input,
        } = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::new("shell", name, e))?
        {
            // Forward local stdin into the exec session until it closes.
            let stdin_pump = tokio::spawn(async move {
                let mut stdin = tokio::io::stdin();
                let mut buf = [0u8; 1024];
                loop {
                    match stdin.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if input.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = output.next().await {
                let chunk = chunk.map_err(|e| RuntimeError::new("shell", name, e))?;
                stdout
                    .write_all(chunk.into_bytes().as_ref())
                    .await
                    .map_err(|e| RuntimeError::new("shell", name, e))?;
                let _ = stdout.flush().await;
            }
            stdin_pump.abort();
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<WorkerStats>, RuntimeError> {
        let docker = self.docker().await?;
        let running: Vec<String> = self
            .ps()
            .await?
            .into_iter()
            .filter(|o| o.running)
            .map(|o| o.name)
            .collect();

        let mut samples = Vec::with_capacity(running.len());
        for name in running {
            let mut stream = docker.stats(
                &name,
                Some(StatsOptions {
                    stream: false,
                    one_shot: true,
                }),
            );
            if let Some(stats) = stream.next().await {
                let stats = stats.map_err(|e| RuntimeError::new("stats", &name, e))?;

                let cpu_delta = stats
                    .cpu_stats
                    .cpu_usage
                    .total_usage
                    .saturating_sub(stats.precpu_stats.cpu_usage.total_usage)
                    as f64;
                let system_delta = stats
                    .cpu_stats
                    .system_cpu_usage
                    .unwrap_or(0)
                    .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0))
                    as f64;
                let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
                let cpu_percent = if system_delta > 0.0 {
                    (cpu_delta / system_delta) * online_cpus * 100.0
                } else {
                    0.0
                };
                let memory_mb =
                    stats.memory_stats.usage.unwrap_or(0) as f64 / (1024.0 * 1024.0);

                samples.push(WorkerStats {
                    name,
                    cpu_percent,
                    memory_mb,
                });
            }
        }
        Ok(samples)
    }
}
