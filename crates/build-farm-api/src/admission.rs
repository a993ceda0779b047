//! Admission control
//!
//! Per-client token buckets rejecting excess traffic before it reaches the
//! queue. Each protected endpoint class gets its own [`RateLimiter`]. Buckets
//! idle longer than the TTL are dropped by a background sweep, never on the
//! request path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bucket identity used when a request carries no usable source address
const UNKNOWN_CLIENT: &str = "unknown";

/// Token bucket parameters for one endpoint class
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Tokens added per second
    pub rate_per_sec: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Idle time after which a client's bucket is forgotten
    pub ttl: Duration,
}

impl RateLimitConfig {
    /// Build submissions: each one takes a worker slot, so keep it tight
    pub fn builds() -> Self {
        Self {
            rate_per_sec: 1.0,
            burst: 10,
            ttl: Duration::from_secs(3600),
        }
    }

    /// Artifact downloads: clients fetch multi-part artifacts in parallel
    pub fn downloads() -> Self {
        Self {
            rate_per_sec: 10.0,
            burst: 100,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Returned when a client has no tokens left
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimited {
    /// Time until the next token is available
    pub retry_after: Duration,
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let secs = self.retry_after.as_secs_f64().ceil().max(1.0) as u64;
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "You have reached maximum request limit."})),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        response
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// Token-bucket limiter keyed by client identity
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Take one token for `client`, or report how long until one is available
    pub fn check(&self, client: &str) -> Result<(), RateLimited> {
        let now = Instant::now();
        let burst = f64::from(self.config.burst);
        let rate = self.config.rate_per_sec;

        let mut bucket = self.buckets.entry(client.to_string()).or_insert(Bucket {
            tokens: burst,
            updated: now,
        });

        let elapsed = now.duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(RateLimited {
                retry_after: Duration::from_secs_f64(missing / rate.max(f64::EPSILON)),
            })
        }
    }

    /// Drop buckets idle for longer than the TTL; returns how many were removed
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.updated) < self.config.ttl);
        before - self.buckets.len()
    }

    /// Number of tracked clients
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Periodically evict idle buckets until `cancel` fires
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Evicted idle rate limiter buckets");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

/// Limiters for the two protected endpoint classes
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub builds: Arc<RateLimiter>,
    pub downloads: Arc<RateLimiter>,
}

impl RateLimits {
    pub fn new(builds: RateLimitConfig, downloads: RateLimitConfig) -> Self {
        Self {
            builds: Arc::new(RateLimiter::new(builds)),
            downloads: Arc::new(RateLimiter::new(downloads)),
        }
    }

    /// Start eviction sweeps for both limiters
    pub fn spawn_sweepers(&self, cancel: &CancellationToken) {
        for limiter in [&self.builds, &self.downloads] {
            let interval = (limiter.config().ttl / 4).max(Duration::from_secs(1));
            limiter.spawn_sweeper(interval, cancel.clone());
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new(RateLimitConfig::builds(), RateLimitConfig::downloads())
    }
}

/// Client identity: peer IP, then forwarding headers, then a shared bucket
pub fn client_identity(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }

    let headers = request.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim);
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    forwarded
        .or(real_ip)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

/// Middleware admitting or rejecting a request against one limiter
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_identity(&request);
    match limiter.check(&client) {
        Ok(()) => next.run(request).await,
        Err(limited) => {
            tracing::debug!(%client, path = %request.uri().path(), "Request rate limited");
            limited.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            rate_per_sec: rate,
            burst,
            ttl: Duration::from_secs(3600),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_reject() {
        let limiter = limiter(1.0, 10);

        for _ in 0..10 {
            assert!(limiter.check("10.0.0.1").is_ok());
        }
        let rejected = limiter.check("10.0.0.1").unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(1));

        // Other clients have their own bucket
        assert!(limiter.check("10.0.0.2").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_interval() {
        let limiter = limiter(1.0, 10);
        for _ in 0..10 {
            limiter.check("client").unwrap();
        }
        assert!(limiter.check("client").is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("client").is_ok());
        assert!(limiter.check("client").is_err());

        // Refill never exceeds the burst
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..10 {
            assert!(limiter.check("client").is_ok());
        }
        assert!(limiter.check("client").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_bucket_is_looser() {
        let limiter = RateLimiter::new(RateLimitConfig::downloads());
        for _ in 0..100 {
            assert!(limiter.check("client").is_ok());
        }
        assert!(limiter.check("client").is_err());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(limiter.check("client").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_buckets_are_evicted() {
        let limiter = limiter(1.0, 10);
        limiter.check("stale").unwrap();
        tokio::time::advance(Duration::from_secs(1800)).await;
        limiter.check("fresh").unwrap();

        tokio::time::advance(Duration::from_secs(1800)).await;
        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_in_background() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            rate_per_sec: 1.0,
            burst: 1,
            ttl: Duration::from_secs(10),
        }));
        let cancel = CancellationToken::new();
        let sweeper = limiter.spawn_sweeper(Duration::from_secs(5), cancel.clone());

        limiter.check("client").unwrap();
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(limiter.tracked_clients(), 0);

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[test]
    fn test_client_identity_sources() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_identity(&request), "203.0.113.7");

        let mut request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 40000))));
        assert_eq!(client_identity(&request), "192.0.2.1");

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_identity(&request), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_rejection_response() {
        let response = RateLimited {
            retry_after: Duration::from_millis(300),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }
}
