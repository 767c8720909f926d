//! Error types for deskfleet.
//!
//! One enum per failure class so callers can match on the kind that matters
//! to them. Propagation policy:
//! - `ConfigError` is always fatal to the run and never retried.
//! - `EnvironmentError` is fatal and carries a remediation hint.
//! - `RuntimeError` is reported with operation + target + cause; lifecycle
//!   operations never retry on their own, callers may.
//! - `ExternalServiceError` is swallowed into a log line by background loops
//!   (DDNS, monitoring); the one-shot orchestrated invocation surfaces it as
//!   a warning, not a pipeline-fatal error.
//! - `NotFoundError` means an operation addressed a worker that doesn't
//!   exist or isn't running.

use thiserror::Error;

/// Invalid fleet specification or port math. Fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fleet size {size} pushes {namespace} port {port} past the valid range (1-65535)")]
    PortRangeExceeded {
        size: u32,
        namespace: &'static str,
        port: u32,
    },

    #[error("worker {index} {namespace} port {port} collides with a reserved administrative port")]
    ReservedPortCollision {
        index: u32,
        namespace: &'static str,
        port: u16,
    },

    #[error("desktop and shell port ranges overlap at port {port} (worker {index})")]
    NamespaceOverlap { index: u32, port: u16 },

    #[error("no per-worker configuration for worker {index}")]
    MissingWorkerConfig { index: u32 },

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: String, reason: String },

    #[error("missing required configuration: {var}")]
    MissingEnv { var: String },
}

/// A required host capability is unavailable. Fatal, surfaced with a
/// remediation hint rather than retried.
#[derive(Debug, Error)]
#[error("{capability} unavailable: {cause} (hint: {hint})")]
pub struct EnvironmentError {
    pub capability: &'static str,
    pub cause: String,
    pub hint: &'static str,
}

/// A container runtime call failed.
#[derive(Debug, Error)]
#[error("runtime operation '{operation}' failed for {target}: {cause}")]
pub struct RuntimeError {
    pub operation: &'static str,
    pub target: String,
    pub cause: String,
}

impl RuntimeError {
    pub fn new(operation: &'static str, target: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            operation,
            target: target.into(),
            cause: cause.to_string(),
        }
    }
}

/// DNS provider or public-address discovery failure.
#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("address discovery failed: no source returned a public address (last error: {last})")]
    DiscoveryExhausted { last: String },

    #[error("DNS provider call '{call}' failed: {cause}")]
    DnsCall { call: &'static str, cause: String },

    #[error("DNS provider returned an unusable response for '{call}': {reason}")]
    DnsResponse { call: &'static str, reason: String },
}

/// An operation addressed a worker that doesn't exist or isn't running.
#[derive(Debug, Error)]
#[error("worker '{name}' {state}")]
pub struct NotFoundError {
    pub name: String,
    /// "does not exist" or "is not running".
    pub state: &'static str,
}

/// Umbrella error for the lifecycle API surface.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    External(#[from] ExternalServiceError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FleetError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
