//! Public-address discovery.
//!
//! Tries a short list of HTTPS plain-text sources in sequence and returns
//! the first parseable IPv4 address. Each source gets its own bounded
//! timeout so one unreachable endpoint cannot stall a reconcile tick.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExternalServiceError;

/// Sources that return the caller's public address as plain text.
pub const DEFAULT_SOURCES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.me/ip",
    "https://icanhazip.com",
];

/// Pluggable best-effort public-address lookup.
#[async_trait]
pub trait PublicAddressSource: Send + Sync {
    async fn discover(&self) -> Result<Ipv4Addr, ExternalServiceError>;
}

/// HTTP implementation over the default (or injected) source list.
pub struct HttpDiscovery {
    client: reqwest::Client,
    sources: Vec<String>,
}

impl HttpDiscovery {
    pub fn new(timeout: Duration) -> Result<Self, ExternalServiceError> {
        Self::with_sources(
            timeout,
            DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn with_sources(
        timeout: Duration,
        sources: Vec<String>,
    ) -> Result<Self, ExternalServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExternalServiceError::DiscoveryExhausted {
                last: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, sources })
    }

    async fn query(&self, source: &str) -> Result<Ipv4Addr, String> {
        let body = self
            .client
            .get(source)
            .send()
            .await
            .map_err(|e| format!("{source}: {e}"))?
            .error_for_status()
            .map_err(|e| format!("{source}: {e}"))?
            .text()
            .await
            .map_err(|e| format!("{source}: {e}"))?;

        body.trim()
            .parse::<Ipv4Addr>()
            .map_err(|e| format!("{source}: unparseable address {:?}: {e}", body.trim()))
    }
}

#[async_trait]
impl PublicAddressSource for HttpDiscovery {
    /// First source to succeed wins; all failing is an
    /// [`ExternalServiceError`] carrying the last cause.
    async fn discover(&self) -> Result<Ipv4Addr, ExternalServiceError> {
        let mut last = "no sources configured".to_string();
        for source in &self.sources {
            match self.query(source).await {
                Ok(addr) => {
                    tracing::debug!(source, address = %addr, "Discovered public address");
                    return Ok(addr);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Address source failed, trying next");
                    last = e;
                }
            }
        }
        Err(ExternalServiceError::DiscoveryExhausted { last })
    }
}
