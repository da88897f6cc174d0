//! APIClient (C6, outbound half) — typed HTTP client plumbing with
//! opt-in dedup, retry, circuit-breaker, bounded queue, cache, offline
//! queue, and optimistic-update support. Every suspension point here
//! (the actual `reqwest` call) is `async`, matching §5's scheduling
//! model: CPU-ish work stays synchronous, I/O stays off the
//! latency-critical path.
//!
//! Request auth is carried in a typed, request-scoped [`RequestSpec`]
//! rather than smuggled onto a mutable request DTO (spec.md §9 redesign
//! note on the "dynamic decryption middleware" anti-pattern).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Method;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify, Semaphore};
use tracing::{info, warn};

use crate::config::Environment;
use crate::crypto::sha256;
use crate::error::{CoreError, CoreResult};
use crate::integrity::IntegrityLayer;

/// Local-dev precedence: forces localhost regardless of env-var
/// overrides when the environment is dev-like.
pub fn resolve_service_url(environment: Environment, port: u16, env_override: Option<&str>, production_default: &str) -> String {
    if environment.is_local_dev() {
        return format!("http://localhost:{port}");
    }
    env_override
        .map(str::to_string)
        .unwrap_or_else(|| production_default.to_string())
}

#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    /// Path including query string, e.g. `/customer/cust_1?include=email`.
    pub path_with_query: String,
    pub body: Option<Vec<u8>>,
    pub customer_id: Option<String>,
    /// Higher runs first in the bounded queue.
    pub priority: u8,
    /// `Some` makes a successful GET response cacheable for this many
    /// seconds (stale-while-revalidate).
    pub cache_ttl_secs: Option<u64>,
    pub cache_tags: Vec<String>,
    /// GET requests are eligible for dedup coalescing.
    pub dedupable: bool,
}

impl RequestSpec {
    pub fn get(path_with_query: impl Into<String>) -> Self {
        RequestSpec {
            method: Method::GET,
            path_with_query: path_with_query.into(),
            body: None,
            customer_id: None,
            priority: 0,
            cache_ttl_secs: None,
            cache_tags: vec![],
            dedupable: true,
        }
    }

    fn fingerprint(&self) -> String {
        let mut msg = Vec::new();
        msg.extend_from_slice(self.method.as_str().as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(self.path_with_query.as_bytes());
        msg.push(b'\n');
        msg.extend_from_slice(self.body.as_deref().unwrap_or_default());
        hex::encode(sha256(&msg))
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

// ---------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------

const RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3, base_delay_ms: 200 }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_secs {
            return Duration::from_secs(secs);
        }
        Duration::from_millis(self.base_delay_ms * 2u64.pow(attempt))
    }
}

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

// ---------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: DateTime<Utc> },
    HalfOpen,
}

pub struct CircuitBreaker {
    state: AsyncMutex<CircuitState>,
    failure_threshold: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_after: Duration) -> Self {
        CircuitBreaker {
            state: AsyncMutex::new(CircuitState::Closed { consecutive_failures: 0 }),
            failure_threshold,
            reset_after,
        }
    }

    /// `true` if a request may proceed (closed or half-open probe).
    async fn allow_request(&self) -> bool {
        let mut state = self.state.lock().await;
        match *state {
            CircuitState::Closed { .. } => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open { opened_at } => {
                let elapsed = Utc::now().signed_duration_since(opened_at);
                if elapsed.to_std().unwrap_or_default() >= self.reset_after {
                    *state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        *state = CircuitState::Closed { consecutive_failures: 0 };
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        *state = match *state {
            CircuitState::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    CircuitState::Open { opened_at: Utc::now() }
                } else {
                    CircuitState::Closed { consecutive_failures: failures }
                }
            }
            CircuitState::HalfOpen => CircuitState::Open { opened_at: Utc::now() },
            CircuitState::Open { opened_at } => CircuitState::Open { opened_at },
        };
    }
}

// ---------------------------------------------------------------------
// Cache (stale-while-revalidate / network-only)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    body: Vec<u8>,
    status: u16,
    expires_at: DateTime<Utc>,
    tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    StaleWhileRevalidate,
    NetworkOnly,
}

#[derive(Default)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
}

impl ResponseCache {
    fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        self.entries.get(fingerprint).map(|e| e.clone())
    }

    fn put(&self, fingerprint: String, status: u16, body: Vec<u8>, ttl_secs: u64, tags: Vec<String>) {
        self.entries.insert(
            fingerprint,
            CacheEntry {
                body,
                status,
                expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs as i64),
                tags,
            },
        );
    }

    /// Invalidates every cached entry carrying any of `tags`.
    pub fn invalidate_tags(&self, tags: &[String]) {
        self.entries.retain(|_, entry| !entry.tags.iter().any(|t| tags.contains(t)));
    }
}

// ---------------------------------------------------------------------
// Offline queue — bounded FIFO, replayed on reconnect.
// ---------------------------------------------------------------------

pub const OFFLINE_QUEUE_MAX: usize = 100;

pub struct OfflineQueue {
    queue: AsyncMutex<VecDeque<RequestSpec>>,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        OfflineQueue { queue: AsyncMutex::new(VecDeque::new()) }
    }
}

impl OfflineQueue {
    /// Drops the request (does not error) once the bound is hit —
    /// mirrors the spec's "bounded size 100" with no overflow policy
    /// specified beyond the bound itself.
    pub async fn enqueue(&self, spec: RequestSpec) -> bool {
        let mut queue = self.queue.lock().await;
        if queue.len() >= OFFLINE_QUEUE_MAX {
            return false;
        }
        queue.push_back(spec);
        true
    }

    pub async fn drain(&self) -> Vec<RequestSpec> {
        let mut queue = self.queue.lock().await;
        queue.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

// ---------------------------------------------------------------------
// Optimistic updates — caller supplies apply/rollback closures.
// ---------------------------------------------------------------------

pub struct OptimisticUpdate<T> {
    pub apply: Box<dyn FnOnce() -> T + Send>,
    pub rollback: Box<dyn FnOnce(T) + Send>,
}

// ---------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    pub base_url: String,
    pub max_concurrent: usize,
    pub enable_dedup: bool,
    pub enable_retry: bool,
    pub enable_circuit_breaker: bool,
    pub enable_cache: bool,
    pub cache_strategy: CacheStrategy,
    pub throw_on_failure: bool,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        ApiClientConfig {
            base_url: "http://localhost:8787".to_string(),
            max_concurrent: 6,
            enable_dedup: true,
            enable_retry: true,
            enable_circuit_breaker: true,
            enable_cache: false,
            cache_strategy: CacheStrategy::StaleWhileRevalidate,
            throw_on_failure: true,
        }
    }
}

/// Outbound typed HTTP client. One instance is the per-process
/// singleton for dedup/cache/circuit-breaker state (spec.md §5);
/// construct it once at the composition root and pass it by `Arc`,
/// never as an ambient module-level global (spec.md §9).
pub struct ApiClient {
    http: reqwest::Client,
    config: ApiClientConfig,
    integrity: Option<Arc<IntegrityLayer>>,
    retry: RetryPolicy,
    circuit_breaker: CircuitBreaker,
    cache: ResponseCache,
    pub offline_queue: OfflineQueue,
    semaphore: Arc<Semaphore>,
    inflight_dedup: DashMap<String, broadcast::Sender<Arc<CoreResult<ApiResponse>>>>,
    cancel_signals: DashMap<u64, Arc<Notify>>,
    next_request_id: AtomicU64,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig, integrity: Option<Arc<IntegrityLayer>>) -> Self {
        let max_concurrent = config.max_concurrent;
        ApiClient {
            http: reqwest::Client::new(),
            integrity,
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            cache: ResponseCache::default(),
            offline_queue: OfflineQueue::default(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inflight_dedup: DashMap::new(),
            cancel_signals: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Removes a request's cancellation slot without affecting other
    /// waiters sharing the same dedup fingerprint (spec.md §5: detaching
    /// one waiter doesn't cancel the in-flight fetch).
    pub fn cancel(&self, request_id: u64) {
        if let Some((_, notify)) = self.cancel_signals.remove(&request_id) {
            notify.notify_waiters();
        }
    }

    pub fn cancel_all(&self) {
        for entry in self.cancel_signals.iter() {
            entry.value().notify_waiters();
        }
        self.cancel_signals.clear();
    }

    pub fn invalidate_cache_tags(&self, tags: &[String]) {
        self.cache.invalidate_tags(tags);
    }

    pub async fn execute(&self, spec: RequestSpec) -> CoreResult<ApiResponse> {
        let request_id = self.next_id();
        let notify = Arc::new(Notify::new());
        self.cancel_signals.insert(request_id, notify.clone());

        let result = tokio::select! {
            biased;
            _ = notify.notified() => Err(CoreError::UpstreamUnavailable("cancelled".into())),
            result = self.execute_inner(&spec) => result,
        };

        self.cancel_signals.remove(&request_id);
        result
    }

    async fn execute_inner(&self, spec: &RequestSpec) -> CoreResult<ApiResponse> {
        let fingerprint = spec.fingerprint();
        let is_get = spec.method == Method::GET;

        if self.config.enable_cache && is_get {
            if let Some(entry) = self.cache.get(&fingerprint) {
                if entry.expires_at > Utc::now() || self.config.cache_strategy == CacheStrategy::StaleWhileRevalidate {
                    return Ok(ApiResponse { status: entry.status, body: entry.body, headers: HashMap::new() });
                }
            }
        }

        if self.config.enable_dedup && is_get && spec.dedupable {
            return self.execute_deduped(spec, &fingerprint).await;
        }

        self.execute_guarded(spec, &fingerprint).await
    }

    /// Coalesces concurrent identical GETs: the first caller drives the
    /// fetch, everyone else subscribes to its broadcast result.
    async fn execute_deduped(&self, spec: &RequestSpec, fingerprint: &str) -> CoreResult<ApiResponse> {
        if let Some(tx) = self.inflight_dedup.get(fingerprint) {
            let mut rx = tx.subscribe();
            drop(tx);
            return match rx.recv().await {
                Ok(result) => (*result).clone(),
                Err(_) => Err(CoreError::UpstreamUnavailable("dedup channel closed".into())),
            };
        }

        let (tx, _rx) = broadcast::channel(1);
        self.inflight_dedup.insert(fingerprint.to_string(), tx.clone());
        let result = self.execute_guarded(spec, fingerprint).await;
        self.inflight_dedup.remove(fingerprint);
        let _ = tx.send(Arc::new(result.clone()));
        result
    }

    async fn execute_guarded(&self, spec: &RequestSpec, fingerprint: &str) -> CoreResult<ApiResponse> {
        if self.config.enable_circuit_breaker && !self.circuit_breaker.allow_request().await {
            return Err(CoreError::UpstreamUnavailable("circuit breaker open".into()));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CoreError::UpstreamUnavailable("client shutting down".into()))?;

        let max_attempts = if self.config.enable_retry { self.retry.max_attempts } else { 1 };
        let mut attempt = 0;
        loop {
            let result = self.send_once(spec).await;
            match &result {
                Ok(resp) if is_retryable_status(resp.status) && attempt + 1 < max_attempts => {
                    attempt += 1;
                    let retry_after = resp
                        .headers
                        .get("retry-after")
                        .and_then(|v| v.parse::<u64>().ok());
                    warn!(status = resp.status, attempt, "retrying outbound call");
                    tokio::time::sleep(self.retry.delay_for(attempt, retry_after)).await;
                    continue;
                }
                Ok(resp) => {
                    if resp.status < 500 {
                        self.circuit_breaker.record_success().await;
                    } else {
                        self.circuit_breaker.record_failure().await;
                    }
                    if self.config.enable_cache && spec.method == Method::GET && resp.status < 300 {
                        if let Some(ttl) = spec.cache_ttl_secs {
                            self.cache.put(fingerprint.to_string(), resp.status, resp.body.clone(), ttl, spec.cache_tags.clone());
                        }
                    }
                    return result;
                }
                Err(_) if attempt + 1 < max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay_for(attempt, None)).await;
                    continue;
                }
                Err(_) => {
                    self.circuit_breaker.record_failure().await;
                    return result;
                }
            }
        }
    }

    async fn send_once(&self, spec: &RequestSpec) -> CoreResult<ApiResponse> {
        let url = format!("{}{}", self.config.base_url, spec.path_with_query);
        let mut builder = self.http.request(spec.method.clone(), &url);

        if let Some(integrity) = &self.integrity {
            let body_bytes = spec.body.as_deref().unwrap_or_default();
            let headers = integrity.sign_request(
                spec.method.as_str(),
                &spec.path_with_query,
                body_bytes,
                spec.customer_id.as_deref(),
            );
            builder = builder
                .header(crate::integrity::REQUEST_INTEGRITY_HEADER, headers.signature)
                .header(crate::integrity::REQUEST_TIMESTAMP_HEADER, headers.timestamp);
            if let Some(customer_id) = &headers.customer_id {
                builder = builder.header(crate::integrity::CUSTOMER_ID_HEADER, customer_id.clone());
            }
        }

        if let Some(body) = &spec.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "outbound request failed");
            CoreError::UpstreamUnavailable(e.to_string())
        })?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| CoreError::UpstreamUnavailable(e.to_string()))?.to_vec();

        info!(status, path = %spec.path_with_query, "outbound call complete");

        if self.config.throw_on_failure {
            if let Some(integrity) = &self.integrity {
                if let Some(sig) = headers.get("x-strixun-response-integrity") {
                    if !integrity.verify_response(status, &body, sig) {
                        return Err(CoreError::IntegrityFailed("response signature mismatch".into()));
                    }
                }
            }
        }

        Ok(ApiResponse { status, body, headers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    #[test]
    fn local_dev_precedence_forces_localhost() {
        assert_eq!(
            resolve_service_url(Environment::Development, 8787, Some("https://prod.example.com"), "https://default.example.com"),
            "http://localhost:8787"
        );
        assert_eq!(
            resolve_service_url(Environment::Production, 8787, Some("https://prod.example.com"), "https://default.example.com"),
            "https://prod.example.com"
        );
        assert_eq!(
            resolve_service_url(Environment::Production, 8787, None, "https://default.example.com"),
            "https://default.example.com"
        );
    }

    #[test]
    fn fingerprint_is_stable_for_identical_requests() {
        let a = RequestSpec::get("/foo?x=1");
        let b = RequestSpec::get("/foo?x=1");
        let c = RequestSpec::get("/foo?x=2");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_and_resets() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(20));
        assert!(cb.allow_request().await);
        cb.record_failure().await;
        assert!(cb.allow_request().await);
        cb.record_failure().await;
        assert!(!cb.allow_request().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cb.allow_request().await); // half-open probe
        cb.record_success().await;
        assert!(cb.allow_request().await);
    }

    #[tokio::test]
    async fn offline_queue_is_bounded_and_fifo() {
        let queue = OfflineQueue::default();
        for i in 0..OFFLINE_QUEUE_MAX {
            assert!(queue.enqueue(RequestSpec::get(format!("/{i}"))).await);
        }
        assert!(!queue.enqueue(RequestSpec::get("/overflow")).await);
        let drained = queue.drain().await;
        assert_eq!(drained.len(), OFFLINE_QUEUE_MAX);
        assert_eq!(drained[0].path_with_query, "/0");
    }

    #[test]
    fn cache_invalidates_by_tag() {
        let cache = ResponseCache::default();
        cache.put("fp1".into(), 200, b"a".to_vec(), 60, vec!["profile".into()]);
        cache.put("fp2".into(), 200, b"b".to_vec(), 60, vec!["other".into()]);
        cache.invalidate_tags(&["profile".to_string()]);
        assert!(cache.get("fp1").is_none());
        assert!(cache.get("fp2").is_some());
    }

    #[test]
    fn retryable_statuses_match_spec_list() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }
}
