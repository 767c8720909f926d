//! Configuration for deskfleet.
//!
//! Settings are resolved with priority: env var > default. `./.env` and
//! `~/.deskfleet/.env` are loaded via dotenvy early in startup (existing
//! vars are never overwritten). Every component receives an immutable config
//! value — there is no process-wide mutable configuration state.

mod helpers;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fleet::FleetSpec;

pub(crate) use helpers::{optional_env, parse_env, require_env};

/// Main configuration, one section per component.
#[derive(Debug, Clone)]
pub struct Config {
    pub fleet: FleetSpec,
    pub paths: PathsConfig,
    pub runtime: RuntimeConfig,
    pub firewall: FirewallConfig,
    pub ddns: DdnsConfig,
    pub monitor: MonitorConfig,
    pub job: JobTemplate,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `./.env` (higher priority) and `~/.deskfleet/.env` via dotenvy
    /// first; neither overwrites vars already present in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        if let Some(home) = dirs::home_dir() {
            let _ = dotenvy::from_path(home.join(".deskfleet").join(".env"));
        }

        let firewall = FirewallConfig::resolve()?;
        Ok(Self {
            fleet: FleetSpec::resolve(&firewall)?,
            paths: PathsConfig::resolve()?,
            runtime: RuntimeConfig::resolve()?,
            ddns: DdnsConfig::resolve()?,
            monitor: MonitorConfig::resolve()?,
            job: JobTemplate::resolve()?,
            firewall,
        })
    }
}

impl FleetSpec {
    /// Resolve the fleet specification from env vars.
    ///
    /// - `FLEET_SIZE` (default 3)
    /// - `FLEET_DESKTOP_BASE_PORT` (default 54040)
    /// - `FLEET_SHELL_BASE_PORT` (default 52520)
    /// - `FLEET_DOMAIN` (required)
    ///
    /// The reserved port set is the administrative ports from the firewall
    /// section; worker allocation is validated against it.
    pub fn resolve(firewall: &FirewallConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            size: parse_env("FLEET_SIZE", 3)?,
            desktop_base_port: parse_env("FLEET_DESKTOP_BASE_PORT", 54040)?,
            shell_base_port: parse_env("FLEET_SHELL_BASE_PORT", 52520)?,
            reserved_ports: firewall.reserved_ports(),
            domain: require_env("FLEET_DOMAIN")?,
        })
    }
}

/// Host directory layout. Everything lives under one root so backup and
/// bootstrap can reason about a single tree.
#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Root directory, default `~/.deskfleet`.
    pub root: PathBuf,
}

impl PathsConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        let root = match optional_env("DESKFLEET_ROOT") {
            Some(v) => PathBuf::from(v),
            None => dirs::home_dir()
                .ok_or_else(|| ConfigError::MissingEnv {
                    var: "DESKFLEET_ROOT (no home directory to default to)".to_string(),
                })?
                .join(".deskfleet"),
        };
        Ok(Self { root })
    }

    /// Per-worker read-write data directory.
    pub fn worker_data_dir(&self, worker_name: &str) -> PathBuf {
        self.root.join("data").join(worker_name)
    }

    /// Shared read-only scripts directory.
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Per-worker read-only config blob.
    pub fn worker_config_file(&self, worker_name: &str) -> PathBuf {
        self.config_dir().join(format!("{worker_name}.json"))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }
}

/// Container runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Image tag workers run.
    pub image: String,
    /// Directory holding the image build context (Dockerfile and friends).
    pub build_context: PathBuf,
    /// Memory limit per worker in MB.
    pub memory_limit_mb: u64,
    /// CPU shares per worker.
    pub cpu_shares: u32,
}

impl RuntimeConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        let paths = PathsConfig::resolve()?;
        Ok(Self {
            image: optional_env("DESKFLEET_IMAGE")
                .unwrap_or_else(|| "deskfleet-worker:latest".to_string()),
            build_context: optional_env("DESKFLEET_BUILD_CONTEXT")
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.root.join("image")),
            memory_limit_mb: parse_env("DESKFLEET_WORKER_MEMORY_MB", 2048)?,
            cpu_shares: parse_env("DESKFLEET_WORKER_CPU_SHARES", 1024)?,
        })
    }
}

/// Firewall settings. The administrative ports are always allowed and form
/// the reserved set every allocated worker port is validated against.
#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub admin_ssh_port: u16,
    pub admin_service_port: u16,
}

impl FirewallConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            admin_ssh_port: parse_env("DESKFLEET_ADMIN_SSH_PORT", 22)?,
            admin_service_port: parse_env("DESKFLEET_ADMIN_SERVICE_PORT", 51800)?,
        })
    }

    /// The ports workers must never be allocated onto.
    pub fn reserved_ports(&self) -> BTreeSet<u16> {
        [self.admin_ssh_port, self.admin_service_port]
            .into_iter()
            .collect()
    }
}

/// Dynamic DNS settings. All defaulted, so loading them never fails for
/// commands that end up not talking to DNS at all.
#[derive(Debug, Clone)]
pub struct DdnsConfig {
    /// Whether the record should be proxied by the provider.
    pub proxied: bool,
    /// Fixed interval between reconcile ticks.
    pub interval: Duration,
    /// Upper bound on the random jitter added to each interval.
    pub jitter: Duration,
    /// Timeout applied to each discovery source and each provider call.
    pub call_timeout: Duration,
}

impl DdnsConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            proxied: parse_env("DDNS_PROXIED", false)?,
            interval: Duration::from_secs(parse_env("DDNS_INTERVAL_SECS", 300u64)?),
            jitter: Duration::from_secs(parse_env("DDNS_JITTER_SECS", 30u64)?),
            call_timeout: Duration::from_secs(parse_env("DDNS_CALL_TIMEOUT_SECS", 10u64)?),
        })
    }
}

/// DNS provider credentials, resolved only by the commands that actually
/// reach the provider (rebuild, dns, verify).
#[derive(Debug, Clone)]
pub struct DdnsCredentials {
    /// DNS zone identifier (opaque, passed through to the provider).
    pub zone_id: String,
    /// Provider API token (opaque, passed through).
    pub api_token: String,
}

impl DdnsCredentials {
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            zone_id: require_env("DDNS_ZONE_ID")?,
            api_token: require_env("DDNS_API_TOKEN")?,
        })
    }
}

/// Monitoring loop settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
}

impl MonitorConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            interval: Duration::from_secs(parse_env("DESKFLEET_MONITOR_INTERVAL_SECS", 60u64)?),
        })
    }
}

/// Template for the per-worker configuration blob consumed by the in-guest
/// automation. The core only writes the blob and mounts it read-only; it
/// never interprets the contents.
#[derive(Debug, Clone, Default)]
pub struct JobTemplate {
    pub target_site_url: String,
    pub username: String,
    pub password: String,
    pub field_selectors: String,
    pub tracker_url: String,
    pub tracker_username: String,
    pub tracker_password: String,
}

impl JobTemplate {
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            target_site_url: optional_env("JOB_TARGET_SITE_URL").unwrap_or_default(),
            username: optional_env("JOB_USERNAME").unwrap_or_default(),
            password: optional_env("JOB_PASSWORD").unwrap_or_default(),
            field_selectors: optional_env("JOB_FIELD_SELECTORS").unwrap_or_default(),
            tracker_url: optional_env("JOB_TRACKER_URL").unwrap_or_default(),
            tracker_username: optional_env("JOB_TRACKER_USERNAME").unwrap_or_default(),
            tracker_password: optional_env("JOB_TRACKER_PASSWORD").unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_layout_is_rooted() {
        let paths = PathsConfig {
            root: PathBuf::from("/srv/deskfleet"),
        };
        assert_eq!(
            paths.worker_data_dir("worker-2"),
            PathBuf::from("/srv/deskfleet/data/worker-2")
        );
        assert_eq!(
            paths.worker_config_file("worker-2"),
            PathBuf::from("/srv/deskfleet/config/worker-2.json")
        );
        assert_eq!(paths.scripts_dir(), PathBuf::from("/srv/deskfleet/scripts"));
    }

    #[test]
    fn firewall_reserved_ports_contains_both_admin_ports() {
        let fw = FirewallConfig {
            admin_ssh_port: 22,
            admin_service_port: 51800,
        };
        let reserved = fw.reserved_ports();
        assert!(reserved.contains(&22));
        assert!(reserved.contains(&51800));
        assert_eq!(reserved.len(), 2);
    }

    #[test]
    fn fleet_spec_reserves_the_firewall_admin_set() {
        // SAFETY: test-only env mutation, no other test reads this var.
        unsafe { std::env::set_var("FLEET_DOMAIN", "fleet.example.com") };
        let fw = FirewallConfig {
            admin_ssh_port: 2222,
            admin_service_port: 51900,
        };
        let spec = FleetSpec::resolve(&fw).unwrap();
        unsafe { std::env::remove_var("FLEET_DOMAIN") };

        assert_eq!(spec.reserved_ports, fw.reserved_ports());
    }

    #[test]
    fn ddns_section_resolves_without_credentials() {
        let ddns = DdnsConfig::resolve().unwrap();
        assert_eq!(ddns.interval, Duration::from_secs(300));
        assert!(matches!(
            DdnsCredentials::resolve(),
            Err(ConfigError::MissingEnv { .. })
        ));
    }
}
