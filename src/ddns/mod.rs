//! Dynamic DNS reconciliation.
//!
//! A polling loop discovers the host's current public address, compares it
//! to the provider's existing record for the fleet domain, and issues a
//! create-or-update only when they differ. The loop runs on a fixed
//! interval with bounded random jitter and supports clean shutdown; each
//! tick either fully applies its decision or fully no-ops.

pub mod discovery;
pub mod provider;
pub mod reconciler;

pub use discovery::{HttpDiscovery, PublicAddressSource};
pub use provider::{CloudflareDns, DnsProvider, DnsRecord};
pub use reconciler::{DdnsEvent, DdnsHandle, DdnsOutcome, DdnsReconciler, DdnsStatus};
