//! Discovery registry clients
//!
//! The node advertises itself in a key/lease store so an upstream router can
//! find it. [`EtcdRegistry`] speaks the etcd v3 JSON gateway, where keys and
//! values travel base64-encoded and 64-bit integers as strings.
//! [`InMemoryRegistry`] backs tests and single-machine runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use build_farm_core::{DiscoveryBackend, DiscoveryConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Lease identifier assigned by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected registry response: {0}")]
    InvalidResponse(String),
}

/// Key/lease store used for node discovery
#[async_trait]
pub trait DiscoveryRegistry: Send + Sync {
    /// Create a lease that expires after `ttl` unless kept alive
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, RegistryError>;

    /// Write `key` bound to `lease`
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), RegistryError>;

    /// Refresh a lease; `false` means it has already expired
    async fn keep_alive(&self, lease: LeaseId) -> Result<bool, RegistryError>;

    /// Delete a key, returning how many entries were removed
    async fn delete(&self, key: &str) -> Result<u64, RegistryError>;

    /// Revoke a lease and every key attached to it
    async fn revoke(&self, lease: LeaseId) -> Result<(), RegistryError>;
}

/// Upper bound for one registry request when no lease TTL applies
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request timeout for a given lease TTL: the keep-alive period, at
/// least one second
pub fn request_timeout(lease_ttl: Duration) -> Duration {
    (lease_ttl / 3).max(Duration::from_secs(1))
}

/// HTTP client whose every request gives up after `timeout`
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Cannot build HTTP client with timeout, using defaults: {}", e);
            reqwest::Client::new()
        })
}

/// Build the registry selected by configuration
pub fn from_config(config: &DiscoveryConfig) -> Arc<dyn DiscoveryRegistry> {
    match config.backend {
        DiscoveryBackend::Etcd => Arc::new(EtcdRegistry::with_timeout(
            config.etcd_endpoint.clone(),
            request_timeout(config.lease_ttl),
        )),
        DiscoveryBackend::Memory => Arc::new(InMemoryRegistry::new()),
    }
}

// =============================================================================
// etcd v3 JSON gateway
// =============================================================================

pub struct EtcdRegistry {
    client: reqwest::Client,
    endpoint: String,
}

impl EtcdRegistry {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(http_client(timeout), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, path: &str, body: Value) -> Result<Value, RegistryError> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

/// Read an int64 field that the gateway may encode as string or number
fn int_field(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

#[async_trait]
impl DiscoveryRegistry for EtcdRegistry {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, RegistryError> {
        let response = self
            .call("/v3/lease/grant", json!({"TTL": ttl.as_secs().max(1)}))
            .await?;
        int_field(&response, "ID")
            .map(LeaseId)
            .ok_or_else(|| RegistryError::InvalidResponse(format!("lease grant: {response}")))
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), RegistryError> {
        self.call(
            "/v3/kv/put",
            json!({
                "key": STANDARD.encode(key),
                "value": STANDARD.encode(value),
                "lease": lease.0.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<bool, RegistryError> {
        let response = self
            .call("/v3/lease/keepalive", json!({"ID": lease.0.to_string()}))
            .await?;
        // An expired lease comes back without a TTL (or with TTL 0)
        let ttl = response
            .get("result")
            .and_then(|result| int_field(result, "TTL"))
            .unwrap_or(0);
        Ok(ttl > 0)
    }

    async fn delete(&self, key: &str) -> Result<u64, RegistryError> {
        let response = self
            .call("/v3/kv/deleterange", json!({"key": STANDARD.encode(key)}))
            .await?;
        Ok(int_field(&response, "deleted").unwrap_or(0).max(0) as u64)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), RegistryError> {
        self.call("/v3/lease/revoke", json!({"ID": lease.0.to_string()}))
            .await?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
struct MemoryState {
    next_lease: i64,
    leases: HashMap<LeaseId, Duration>,
    entries: HashMap<String, (String, LeaseId)>,
}

/// Registry held in process memory
///
/// Leases never expire on their own; [`expire`](Self::expire) simulates it.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<MemoryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|(value, _)| value.clone())
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop a lease and its keys as if its TTL had run out
    pub fn expire(&self, lease: LeaseId) {
        let mut state = self.state.lock();
        state.leases.remove(&lease);
        state.entries.retain(|_, (_, owner)| *owner != lease);
    }
}

#[async_trait]
impl DiscoveryRegistry for InMemoryRegistry {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, RegistryError> {
        let mut state = self.state.lock();
        state.next_lease += 1;
        let lease = LeaseId(state.next_lease);
        state.leases.insert(lease, ttl);
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if !state.leases.contains_key(&lease) {
            return Err(RegistryError::InvalidResponse(format!(
                "lease {lease} not found"
            )));
        }
        state
            .entries
            .insert(key.to_string(), (value.to_string(), lease));
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<bool, RegistryError> {
        Ok(self.state.lock().leases.contains_key(&lease))
    }

    async fn delete(&self, key: &str) -> Result<u64, RegistryError> {
        Ok(self.state.lock().entries.remove(key).map_or(0, |_| 1))
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), RegistryError> {
        self.expire(lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_lease_lifecycle() {
        let registry = InMemoryRegistry::new();
        let lease = registry.grant_lease(Duration::from_secs(30)).await.unwrap();

        registry.put("/builders/a:1", "{}", lease).await.unwrap();
        assert_eq!(registry.keys(), vec!["/builders/a:1"]);
        assert!(registry.keep_alive(lease).await.unwrap());

        registry.revoke(lease).await.unwrap();
        assert!(registry.keys().is_empty());
        assert!(!registry.keep_alive(lease).await.unwrap());
        assert!(registry.put("/builders/a:1", "{}", lease).await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_delete_counts() {
        let registry = InMemoryRegistry::new();
        let lease = registry.grant_lease(Duration::from_secs(30)).await.unwrap();
        registry.put("k", "v", lease).await.unwrap();

        assert_eq!(registry.delete("k").await.unwrap(), 1);
        assert_eq!(registry.delete("k").await.unwrap(), 0);
    }

    #[test]
    fn test_int_field_accepts_strings_and_numbers() {
        let value = json!({"ID": "7587862", "TTL": 30, "bad": true});
        assert_eq!(int_field(&value, "ID"), Some(7587862));
        assert_eq!(int_field(&value, "TTL"), Some(30));
        assert_eq!(int_field(&value, "bad"), None);
        assert_eq!(int_field(&value, "missing"), None);
    }
}
