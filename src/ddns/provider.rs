//! DNS provider contract and the Cloudflare implementation.
//!
//! The core speaks to the provider only through get-record / create-record /
//! update-record. Zone id and API token are opaque configuration values
//! passed straight through.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalServiceError;

/// An A record as the provider sees it. `id` absent means the record does
/// not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: Option<String>,
    pub name: String,
    pub content: Ipv4Addr,
    pub proxied: bool,
}

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Fetch the existing A record for `name`, if any.
    async fn get_record(&self, name: &str) -> Result<Option<DnsRecord>, ExternalServiceError>;

    async fn create_record(&self, record: &DnsRecord) -> Result<(), ExternalServiceError>;

    async fn update_record(
        &self,
        id: &str,
        record: &DnsRecord,
    ) -> Result<(), ExternalServiceError>;
}

#[derive(Serialize)]
struct RecordPayload<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: &'a str,
    content: String,
    ttl: u32,
    proxied: bool,
}

impl<'a> RecordPayload<'a> {
    fn from_record(record: &'a DnsRecord) -> Self {
        Self {
            record_type: "A",
            name: &record.name,
            content: record.content.to_string(),
            ttl: 300,
            proxied: record.proxied,
        }
    }
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    name: String,
    content: String,
    #[serde(default)]
    proxied: bool,
}

/// Cloudflare zone-scoped DNS client.
pub struct CloudflareDns {
    client: reqwest::Client,
    base_url: String,
    zone_id: String,
    api_token: String,
}

impl CloudflareDns {
    pub fn new(
        zone_id: String,
        api_token: String,
        timeout: Duration,
    ) -> Result<Self, ExternalServiceError> {
        Self::with_base_url(
            "https://api.cloudflare.com/client/v4".to_string(),
            zone_id,
            api_token,
            timeout,
        )
    }

    /// Constructor with an overridable endpoint, used by tests.
    pub fn with_base_url(
        base_url: String,
        zone_id: String,
        api_token: String,
        timeout: Duration,
    ) -> Result<Self, ExternalServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExternalServiceError::DnsCall {
                call: "client",
                cause: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            zone_id,
            api_token,
        })
    }

    fn records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.base_url, self.zone_id)
    }

    fn check_envelope<T>(
        call: &'static str,
        envelope: ApiEnvelope<T>,
    ) -> Result<Option<T>, ExternalServiceError> {
        if !envelope.success {
            let reason = envelope
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ExternalServiceError::DnsResponse {
                call,
                reason: if reason.is_empty() {
                    "provider reported failure without detail".to_string()
                } else {
                    reason
                },
            });
        }
        Ok(envelope.result)
    }
}

#[async_trait]
impl DnsProvider for CloudflareDns {
    async fn get_record(&self, name: &str) -> Result<Option<DnsRecord>, ExternalServiceError> {
        let envelope: ApiEnvelope<Vec<ApiRecord>> = self
            .client
            .get(self.records_url())
            .bearer_auth(&self.api_token)
            .query(&[("type", "A"), ("name", name)])
            .send()
            .await
            .map_err(|e| ExternalServiceError::DnsCall {
                call: "get_record",
                cause: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| ExternalServiceError::DnsResponse {
                call: "get_record",
                reason: e.to_string(),
            })?;

        let records = Self::check_envelope("get_record", envelope)?.unwrap_or_default();
        let Some(api) = records.into_iter().next() else {
            return Ok(None);
        };
        let content =
            api.content
                .parse::<Ipv4Addr>()
                .map_err(|e| ExternalServiceError::DnsResponse {
                    call: "get_record",
                    reason: format!("record content {:?} is not an IPv4 address: {e}", api.content),
                })?;
        Ok(Some(DnsRecord {
            id: Some(api.id),
            name: api.name,
            content,
            proxied: api.proxied,
        }))
    }

    async fn create_record(&self, record: &DnsRecord) -> Result<(), ExternalServiceError> {
        let envelope: ApiEnvelope<ApiRecord> = self
            .client
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&RecordPayload::from_record(record))
            .send()
            .await
            .map_err(|e| ExternalServiceError::DnsCall {
                call: "create_record",
                cause: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| ExternalServiceError::DnsResponse {
                call: "create_record",
                reason: e.to_string(),
            })?;

        Self::check_envelope("create_record", envelope)?;
        Ok(())
    }

    async fn update_record(
        &self,
        id: &str,
        record: &DnsRecord,
    ) -> Result<(), ExternalServiceError> {
        let envelope: ApiEnvelope<ApiRecord> = self
            .client
            .put(format!("{}/{id}", self.records_url()))
            .bearer_auth(&self.api_token)
            .json(&RecordPayload::from_record(record))
            .send()
            .await
            .map_err(|e| ExternalServiceError::DnsCall {
                call: "update_record",
                cause: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| ExternalServiceError::DnsResponse {
                call: "update_record",
                reason: e.to_string(),
            })?;

        Self::check_envelope("update_record", envelope)?;
        Ok(())
    }
}
