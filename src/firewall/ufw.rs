//! ufw backend.
//!
//! Drives the `ufw` control binary directly through `tokio::process`; no
//! generated rule scripts. Every invocation uses `--force` where ufw would
//! otherwise prompt, since the synchronizer owns its own confirmation story.

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::EnvironmentError;
use crate::firewall::FirewallBackend;
use crate::fleet::FirewallRule;

const HINT: &str = "install ufw (e.g. `apt install ufw`) and run with root privileges";

pub struct UfwBackend;

impl UfwBackend {
    pub fn new() -> Self {
        Self
    }

    /// Run `ufw` with the given args, failing on spawn error or non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<String, EnvironmentError> {
        let output = Command::new("ufw")
            .args(args)
            .output()
            .await
            .map_err(|e| EnvironmentError {
                capability: "ufw",
                cause: format!("failed to run `ufw {}`: {e}", args.join(" ")),
                hint: HINT,
            })?;

        if !output.status.success() {
            return Err(EnvironmentError {
                capability: "ufw",
                cause: format!(
                    "`ufw {}` exited with {}: {}",
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                hint: HINT,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for UfwBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FirewallBackend for UfwBackend {
    async fn available(&self) -> Result<(), EnvironmentError> {
        self.run(&["--version"]).await.map(|_| ())
    }

    async fn reset(&self) -> Result<(), EnvironmentError> {
        self.run(&["--force", "disable"]).await?;
        self.run(&["--force", "reset"]).await?;
        tracing::debug!("Firewall disabled and reset");
        Ok(())
    }

    async fn set_default_policies(&self) -> Result<(), EnvironmentError> {
        self.run(&["default", "deny", "incoming"]).await?;
        self.run(&["default", "allow", "outgoing"]).await?;
        Ok(())
    }

    async fn allow(&self, rule: FirewallRule) -> Result<(), EnvironmentError> {
        let spec = format!("{}/tcp", rule.port);
        self.run(&["allow", &spec]).await?;
        tracing::debug!(port = rule.port, "Allowed inbound tcp");
        Ok(())
    }

    async fn enable(&self) -> Result<(), EnvironmentError> {
        self.run(&["--force", "enable"]).await.map(|_| ())
    }

    async fn is_active(&self) -> Result<bool, EnvironmentError> {
        let out = self.run(&["status"]).await?;
        Ok(out.lines().any(|l| l.trim() == "Status: active"))
    }
}
