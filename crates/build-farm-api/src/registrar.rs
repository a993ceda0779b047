//! Agent registration in the discovery registry
//!
//! One entry per process, keyed `prefix + address:port`, bound to a lease.
//! While registered, a keep-alive task refreshes the lease every TTL/3 and
//! rewrites the value with the current running-job count so the router can
//! balance on load. If the lease was lost the task grants a new one.

use std::sync::Arc;
use std::time::Duration;

use build_farm_core::DiscoveryConfig;
use build_farm_worker::RunningJobs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{http_client, request_timeout, DiscoveryRegistry, LeaseId, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("cannot get external ip: {0}")]
    Lookup(#[from] reqwest::Error),

    #[error("cannot get external ip: {status} {body}")]
    LookupStatus { status: u16, body: String },

    #[error("cannot get external ip: empty response from {0}")]
    EmptyAddress(String),

    #[error("agent is already registered as {0}")]
    AlreadyRegistered(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Registered discovery entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEntry {
    pub key: String,
    pub address: String,
    pub port: u16,
    pub lease: LeaseId,
}

/// Value stored under the agent key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub address: String,
    pub workers: usize,
    pub running_jobs: usize,
    pub version: String,
}

struct Registration {
    entry: AgentEntry,
    lease: Arc<Mutex<LeaseId>>,
    cancel: CancellationToken,
    keep_alive: JoinHandle<()>,
}

/// Resolve the address other services should use to reach this node
///
/// An explicit host wins; otherwise the body of the IP lookup service is used.
pub async fn resolve_external_address(
    config: &DiscoveryConfig,
    client: &reqwest::Client,
) -> Result<String, RegistrarError> {
    if let Some(host) = config
        .host_override
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
    {
        return Ok(host.to_string());
    }

    let url = config.ip_lookup_url();
    let response = client.get(&url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if status != reqwest::StatusCode::OK {
        return Err(RegistrarError::LookupStatus {
            status: status.as_u16(),
            body,
        });
    }

    let address = body.trim();
    if address.is_empty() {
        return Err(RegistrarError::EmptyAddress(url));
    }
    Ok(address.to_string())
}

pub struct AgentRegistrar {
    registry: Arc<dyn DiscoveryRegistry>,
    config: DiscoveryConfig,
    client: reqwest::Client,
    running: RunningJobs,
    workers: usize,
    registration: tokio::sync::Mutex<Option<Registration>>,
}

impl AgentRegistrar {
    pub fn new(
        registry: Arc<dyn DiscoveryRegistry>,
        config: DiscoveryConfig,
        running: RunningJobs,
        workers: usize,
    ) -> Self {
        Self {
            registry,
            client: http_client(request_timeout(config.lease_ttl)),
            config,
            running,
            workers,
            registration: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Publish this node and start refreshing its lease
    pub async fn register(&self, port: u16) -> Result<AgentEntry, RegistrarError> {
        let mut registration = self.registration.lock().await;
        if let Some(existing) = registration.as_ref() {
            return Err(RegistrarError::AlreadyRegistered(existing.entry.key.clone()));
        }

        let address = resolve_external_address(&self.config, &self.client).await?;
        let authority = host_port(&address, port);
        let key = format!("{}{}", self.config.key_prefix, authority);
        let advertiser = Advertiser {
            registry: Arc::clone(&self.registry),
            key: key.clone(),
            info: AgentInfo {
                address: authority,
                workers: self.workers,
                running_jobs: 0,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            running: self.running.clone(),
            ttl: self.config.lease_ttl,
        };

        let lease = advertiser.publish().await?;
        let entry = AgentEntry {
            key,
            address,
            port,
            lease,
        };

        let shared_lease = Arc::new(Mutex::new(lease));
        let cancel = CancellationToken::new();
        let keep_alive = tokio::spawn(keep_alive_loop(
            advertiser,
            Arc::clone(&shared_lease),
            cancel.clone(),
        ));

        info!(key = %entry.key, lease = %lease, ttl = ?self.config.lease_ttl, "Agent registered");
        *registration = Some(Registration {
            entry: entry.clone(),
            lease: shared_lease,
            cancel,
            keep_alive,
        });
        Ok(entry)
    }

    /// Remove this node from the registry
    ///
    /// Calls after the first are no-ops. If the delete fails the entry still
    /// disappears once its lease runs out, since keep-alive has stopped.
    pub async fn deregister(&self) -> Result<(), RegistrarError> {
        let Some(registration) = self.registration.lock().await.take() else {
            return Ok(());
        };

        registration.cancel.cancel();
        if let Err(e) = registration.keep_alive.await {
            warn!("Keep-alive task failed: {}", e);
        }

        let key = &registration.entry.key;
        let deleted = self.registry.delete(key).await?;
        let lease = *registration.lease.lock();
        if let Err(e) = self.registry.revoke(lease).await {
            warn!(lease = %lease, "Cannot revoke lease: {}", e);
        }

        info!(key = %key, deleted, "Agent deregistered");
        Ok(())
    }

    /// Currently registered entry, if any
    pub async fn entry(&self) -> Option<AgentEntry> {
        self.registration
            .lock()
            .await
            .as_ref()
            .map(|r| r.entry.clone())
    }
}

/// `address:port`, bracketing IPv6 literals so the port stays unambiguous
pub fn host_port(address: &str, port: u16) -> String {
    match address.parse::<std::net::Ipv6Addr>() {
        Ok(_) => format!("[{address}]:{port}"),
        Err(_) => format!("{address}:{port}"),
    }
}

struct Advertiser {
    registry: Arc<dyn DiscoveryRegistry>,
    key: String,
    info: AgentInfo,
    running: RunningJobs,
    ttl: Duration,
}

impl Advertiser {
    fn value(&self) -> Result<String, RegistryError> {
        let info = AgentInfo {
            running_jobs: self.running.get(),
            ..self.info.clone()
        };
        serde_json::to_string(&info).map_err(|e| RegistryError::InvalidResponse(e.to_string()))
    }

    async fn write(&self, lease: LeaseId) -> Result<(), RegistryError> {
        self.registry.put(&self.key, &self.value()?, lease).await
    }

    /// Grant a fresh lease and write the entry under it
    async fn publish(&self) -> Result<LeaseId, RegistryError> {
        let lease = self.registry.grant_lease(self.ttl).await?;
        self.write(lease).await?;
        Ok(lease)
    }

    async fn refresh(&self, lease: &Mutex<LeaseId>) -> Result<(), RegistryError> {
        let current = *lease.lock();
        if self.registry.keep_alive(current).await? {
            return self.write(current).await;
        }

        warn!(key = %self.key, lease = %current, "Lease expired, registering again");
        let renewed = self.publish().await?;
        *lease.lock() = renewed;
        Ok(())
    }
}

async fn keep_alive_loop(advertiser: Advertiser, lease: Arc<Mutex<LeaseId>>, cancel: CancellationToken) {
    let period = (advertiser.ttl / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // An in-flight refresh is abandoned on cancel
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = advertiser.refresh(&lease) => match result {
                Ok(()) => debug!(key = %advertiser.key, "Lease refreshed"),
                Err(e) => warn!(key = %advertiser.key, "Cannot refresh lease: {}", e),
            },
        }
    }
}
