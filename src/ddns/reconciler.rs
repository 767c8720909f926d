//! The DDNS reconcile loop.
//!
//! Two states, Idle and Updating, with the transition driven by a fixed
//! interval plus bounded random jitter. Each tick discovers the public
//! address, fetches the existing record, and creates or updates only when
//! they differ. Tick failures are logged and skipped — the loop never
//! crashes. The same `reconcile_once` is invoked synchronously (outside the
//! timer) during initial convergence so the record exists before
//! verification runs.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use crate::config::DdnsConfig;
use crate::ddns::discovery::PublicAddressSource;
use crate::ddns::provider::{DnsProvider, DnsRecord};
use crate::error::ExternalServiceError;

/// The decision a tick took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdnsOutcome {
    Created { address: Ipv4Addr },
    Updated { from: Ipv4Addr, to: Ipv4Addr },
    Unchanged { address: Ipv4Addr },
    Skipped { reason: String },
}

impl std::fmt::Display for DdnsOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created { address } => write!(f, "created record -> {address}"),
            Self::Updated { from, to } => write!(f, "updated record {from} -> {to}"),
            Self::Unchanged { address } => write!(f, "record already {address}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// One recorded tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdnsEvent {
    pub at: DateTime<Utc>,
    pub outcome: DdnsOutcome,
}

/// Shared observable state of the reconciler, read by verification and
/// monitoring without touching the loop itself.
#[derive(Clone)]
pub struct DdnsStatus {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    last_event: RwLock<Option<DdnsEvent>>,
    loop_alive: AtomicBool,
    /// How long a recorded tick counts as recent once the loop is gone.
    recent_window: Duration,
}

impl Default for DdnsStatus {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(600))
    }
}

impl DdnsStatus {
    fn with_window(recent_window: Duration) -> Self {
        Self {
            inner: Arc::new(StatusInner {
                last_event: RwLock::new(None),
                loop_alive: AtomicBool::new(false),
                recent_window,
            }),
        }
    }

    pub async fn last_event(&self) -> Option<DdnsEvent> {
        self.inner.last_event.read().await.clone()
    }

    /// Active means the timer loop is running, or a tick was recorded
    /// recently enough (the one-shot invocation during convergence). A
    /// stale event from a long-gone loop does not count.
    pub async fn is_active(&self) -> bool {
        if self.inner.loop_alive.load(Ordering::Relaxed) {
            return true;
        }
        match self.inner.last_event.read().await.as_ref() {
            Some(event) => Utc::now()
                .signed_duration_since(event.at)
                .to_std()
                .map_or(true, |age| age <= self.inner.recent_window),
            None => false,
        }
    }

    async fn record(&self, outcome: DdnsOutcome) {
        *self.inner.last_event.write().await = Some(DdnsEvent {
            at: Utc::now(),
            outcome,
        });
    }
}

/// Handle to a spawned reconcile loop.
pub struct DdnsHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    status: DdnsStatus,
}

impl DdnsHandle {
    pub fn status(&self) -> DdnsStatus {
        self.status.clone()
    }

    /// Stop accepting new ticks and wait for an in-flight tick to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

pub struct DdnsReconciler {
    discovery: Arc<dyn PublicAddressSource>,
    provider: Arc<dyn DnsProvider>,
    domain: String,
    proxied: bool,
    interval: Duration,
    jitter: Duration,
    status: DdnsStatus,
}

impl DdnsReconciler {
    pub fn new(
        discovery: Arc<dyn PublicAddressSource>,
        provider: Arc<dyn DnsProvider>,
        config: &DdnsConfig,
        domain: String,
    ) -> Self {
        Self {
            discovery,
            provider,
            domain,
            proxied: config.proxied,
            interval: config.interval,
            jitter: config.jitter,
            // Two missed ticks and a recorded event stops counting as
            // recent activity.
            status: DdnsStatus::with_window(config.interval * 2),
        }
    }

    pub fn status(&self) -> DdnsStatus {
        self.status.clone()
    }

    /// One full reconcile: discover, fetch, create-or-update-or-no-op.
    ///
    /// A tick is atomic from the record's point of view: it either fully
    /// creates/updates or fully no-ops.
    pub async fn reconcile_once(&self) -> Result<DdnsOutcome, ExternalServiceError> {
        let address = self.discovery.discover().await?;
        let existing = self.provider.get_record(&self.domain).await?;

        let outcome = match existing {
            None => {
                let record = DnsRecord {
                    id: None,
                    name: self.domain.clone(),
                    content: address,
                    proxied: self.proxied,
                };
                self.provider.create_record(&record).await?;
                DdnsOutcome::Created { address }
            }
            Some(record) if record.content != address => {
                let id = record
                    .id
                    .clone()
                    .ok_or_else(|| ExternalServiceError::DnsResponse {
                        call: "get_record",
                        reason: "existing record has no id".to_string(),
                    })?;
                let updated = DnsRecord {
                    content: address,
                    ..record.clone()
                };
                self.provider.update_record(&id, &updated).await?;
                DdnsOutcome::Updated {
                    from: record.content,
                    to: address,
                }
            }
            Some(record) => DdnsOutcome::Unchanged {
                address: record.content,
            },
        };

        self.status.record(outcome.clone()).await;
        tracing::info!(domain = %self.domain, outcome = %outcome, "DDNS reconcile");
        Ok(outcome)
    }

    /// Read-only convergence check: the record exists and matches the
    /// currently discovered public address. Never issues a create or
    /// update, so verification can call it freely.
    pub async fn is_converged(&self) -> Result<bool, ExternalServiceError> {
        let address = self.discovery.discover().await?;
        let existing = self.provider.get_record(&self.domain).await?;
        Ok(existing.is_some_and(|record| record.content == address))
    }

    /// One loop iteration: reconcile, converting failures into a logged
    /// `Skipped` event instead of an error.
    async fn tick(&self) {
        if let Err(e) = self.reconcile_once().await {
            let reason = e.to_string();
            tracing::warn!(domain = %self.domain, error = %reason, "DDNS tick skipped");
            self.status.record(DdnsOutcome::Skipped { reason }).await;
        }
    }

    /// Interval plus a uniformly random jitter up to the configured bound.
    fn jittered_interval(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Spawn the timer loop. Shutdown stops new ticks; an in-flight tick
    /// always runs to completion because ticks are awaited outside the
    /// cancellation select.
    pub fn spawn(self: Arc<Self>) -> DdnsHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let status = self.status();
        status.inner.loop_alive.store(true, Ordering::Relaxed);

        let loop_status = status.clone();
        let task = tokio::spawn(async move {
            loop {
                let sleep = tokio::time::sleep(self.jittered_interval());
                tokio::select! {
                    _ = sleep => self.tick().await,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            loop_status.inner.loop_alive.store(false, Ordering::Relaxed);
            tracing::info!("DDNS loop shut down");
        });

        DdnsHandle {
            shutdown_tx,
            task,
            status,
        }
    }
}
