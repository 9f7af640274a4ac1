//! Request rate limiting.
//!
//! A [`RateLimiter`] pairs a key extractor with one algorithm instance.
//! Each algorithm keeps its per-key state behind a single mutex. Callers
//! pass the current instant in, which keeps the arithmetic testable.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::config::{KeyExtractor, RateLimitConfig, RateLimitStrategy};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};

/// Outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u64,
    /// Time until the next request for this key would be admitted.
    pub reset_after: Duration,
    pub limit_type: &'static str,
    pub reason: String,
}

impl RateLimitResult {
    fn allowed(remaining: u64, limit_type: &'static str) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_after: Duration::ZERO,
            limit_type,
            reason: String::new(),
        }
    }

    fn denied(reset_after: Duration, limit_type: &'static str, reason: &str) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_after,
            limit_type,
            reason: reason.to_string(),
        }
    }
}

pub trait RateLimitAlgorithm: Send + Sync {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult;

    /// Forgets keys that have been idle for longer than `idle`.
    fn cleanup(&self, now: Instant, idle: Duration);

    fn active_keys(&self) -> usize;

    fn reset(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Holds up to `capacity` tokens and adds `refill_rate` of them every
/// whole `refill_interval`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    refill_interval: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval: refill_interval.max(Duration::from_millis(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimitAlgorithm for TokenBucket {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut buckets = lock(&self.buckets);
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });
        bucket.last_seen = now;

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let interval = self.refill_interval.as_nanos();
        let intervals = u64::try_from(elapsed.as_nanos() / interval).unwrap_or(u64::MAX);
        if intervals > 0 {
            let added = self.refill_rate.saturating_mul(intervals);
            bucket.tokens = self.capacity.min(bucket.tokens.saturating_add(added));
            // Stay on the interval grid: keep only the partial interval.
            let partial = u64::try_from(elapsed.as_nanos() % interval).unwrap_or(0);
            bucket.last_refill = now
                .checked_sub(Duration::from_nanos(partial))
                .unwrap_or(now);
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            RateLimitResult::allowed(bucket.tokens, "token_bucket")
        } else {
            let into_interval = now.saturating_duration_since(bucket.last_refill);
            RateLimitResult::denied(
                self.refill_interval.saturating_sub(into_interval),
                "token_bucket",
                "Token bucket exhausted",
            )
        }
    }

    fn cleanup(&self, now: Instant, idle: Duration) {
        lock(&self.buckets).retain(|_, b| now.saturating_duration_since(b.last_seen) <= idle);
    }

    fn active_keys(&self) -> usize {
        lock(&self.buckets).len()
    }

    fn reset(&self) {
        lock(&self.buckets).clear();
    }
}

#[derive(Debug)]
struct Window {
    count: u64,
    started: Instant,
}

/// At most `max_requests` per window; the window restarts on the first
/// request after it has elapsed.
#[derive(Debug)]
pub struct FixedWindow {
    max_requests: u64,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindow {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimitAlgorithm for FixedWindow {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut windows = lock(&self.windows);
        let window = windows
            .entry(key.to_string())
            .or_insert(Window { count: 0, started: now });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.window {
            window.count = 0;
            window.started = now;
        }

        if window.count < self.max_requests {
            window.count += 1;
            RateLimitResult::allowed(self.max_requests - window.count, "fixed_window")
        } else {
            RateLimitResult::denied(
                self.window.saturating_sub(elapsed),
                "fixed_window",
                "Fixed window limit exceeded",
            )
        }
    }

    fn cleanup(&self, now: Instant, idle: Duration) {
        lock(&self.windows).retain(|_, w| now.saturating_duration_since(w.started) <= idle);
    }

    fn active_keys(&self) -> usize {
        lock(&self.windows).len()
    }

    fn reset(&self) {
        lock(&self.windows).clear();
    }
}

/// At most `max_requests` within any trailing `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    max_requests: u64,
    window: Duration,
    logs: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindow {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            logs: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimitAlgorithm for SlidingWindow {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut logs = lock(&self.logs);
        let log = logs.entry(key.to_string()).or_default();

        while log
            .front()
            .is_some_and(|&t| now.saturating_duration_since(t) >= self.window)
        {
            log.pop_front();
        }

        if (log.len() as u64) < self.max_requests {
            log.push_back(now);
            RateLimitResult::allowed(self.max_requests - log.len() as u64, "sliding_window")
        } else {
            let reset_after = log
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            RateLimitResult::denied(reset_after, "sliding_window", "Sliding window limit exceeded")
        }
    }

    fn cleanup(&self, now: Instant, idle: Duration) {
        let mut logs = lock(&self.logs);
        for log in logs.values_mut() {
            log.retain(|&t| now.saturating_duration_since(t) <= idle);
        }
        logs.retain(|_, log| !log.is_empty());
    }

    fn active_keys(&self) -> usize {
        lock(&self.logs).len()
    }

    fn reset(&self) {
        lock(&self.logs).clear();
    }
}

/// Builds the algorithm a strategy names.
pub fn algorithm_for(config: &RateLimitConfig) -> Box<dyn RateLimitAlgorithm> {
    match config.strategy {
        RateLimitStrategy::TokenBucket | RateLimitStrategy::LeakyBucket => Box::new(TokenBucket::new(
            config.burst_capacity,
            config.max_requests,
            config.window(),
        )),
        RateLimitStrategy::FixedWindow => Box::new(FixedWindow::new(config.max_requests, config.window())),
        RateLimitStrategy::SlidingWindow => Box::new(SlidingWindow::new(config.max_requests, config.window())),
    }
}

pub mod keys {
    //! Functions that pick the identity a request is limited under.

    use crate::http::request::Request;

    /// First `X-Forwarded-For` entry, then `X-Real-IP`, then the peer.
    pub fn ip_address(request: &Request) -> String {
        if let Some(forwarded) = request.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return first.to_string();
            }
        }
        if let Some(real_ip) = request.header("x-real-ip") {
            return real_ip.trim().to_string();
        }
        request
            .remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Bearer token, falling back to the client address.
    pub fn user_id(request: &Request) -> String {
        request
            .header("authorization")
            .and_then(|auth| auth.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .unwrap_or_else(|| ip_address(request))
    }

    pub fn api_key(request: &Request) -> String {
        request
            .header("x-api-key")
            .or_else(|| request.query_param("api_key"))
            .map(str::to_string)
            .unwrap_or_else(|| ip_address(request))
    }

    pub fn ip_and_user_agent(request: &Request) -> String {
        format!(
            "{}|{}",
            ip_address(request),
            request.header("user-agent").unwrap_or("unknown")
        )
    }

    pub fn endpoint_path(request: &Request) -> String {
        request.path.clone()
    }
}

impl KeyExtractor {
    pub fn extract(&self, request: &Request) -> String {
        match self {
            KeyExtractor::IpAddress => keys::ip_address(request),
            KeyExtractor::UserId => keys::user_id(request),
            KeyExtractor::ApiKey => keys::api_key(request),
            KeyExtractor::IpAndUserAgent => keys::ip_and_user_agent(request),
            KeyExtractor::EndpointPath => keys::endpoint_path(request),
        }
    }
}

pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

pub struct RateLimiter {
    config: RateLimitConfig,
    algorithm: Box<dyn RateLimitAlgorithm>,
    key_fn: KeyFn,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let extractor = config.key_extractor;
        Self {
            algorithm: algorithm_for(&config),
            key_fn: Arc::new(move |request: &Request| extractor.extract(request)),
            config,
        }
    }

    /// Replaces the configured key extractor.
    pub fn with_key_fn(mut self, key_fn: impl Fn(&Request) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check_request(&self, request: &Request) -> RateLimitResult {
        self.check_request_at(request, Instant::now())
    }

    pub fn check_request_at(&self, request: &Request, now: Instant) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult::allowed(u64::MAX, "disabled");
        }
        let key = (self.key_fn)(request);
        self.algorithm.check(&key, now)
    }

    pub fn active_keys(&self) -> usize {
        self.algorithm.active_keys()
    }

    pub fn reset_all_limits(&self) {
        self.algorithm.reset();
    }

    pub fn cleanup(&self, now: Instant, idle: Duration) {
        self.algorithm.cleanup(now, idle);
    }

    /// Checks the request and annotates the response. Returns false, with
    /// the response turned into a 429, when the request is over its limit.
    pub fn apply(&self, request: &Request, response: &mut Response) -> bool {
        let result = self.check_request(request);
        if result.limit_type == "disabled" {
            return true;
        }

        response.set_header("X-RateLimit-Limit", self.config.max_requests.to_string());
        response.set_header("X-RateLimit-Remaining", result.remaining.to_string());
        if result.allowed {
            return true;
        }

        let reset_secs = result.reset_after.as_secs() + u64::from(result.reset_after.subsec_nanos() > 0);
        response.set_header("X-RateLimit-Reset", reset_secs.to_string());
        response.set_header("X-RateLimit-Type", result.limit_type);
        let body = serde_json::json!({
            "error": "Rate limit exceeded",
            "reason": result.reason,
        });
        response.set_status(StatusCode::TooManyRequests).set_json(body.to_string());

        tracing::debug!(
            path = %request.path,
            limit_type = result.limit_type,
            "request rate limited"
        );
        false
    }

    /// Wraps the limiter as a middleware closure.
    pub fn middleware(self: &Arc<Self>) -> impl Fn(&Request, &mut Response) -> bool + Send + Sync + 'static {
        let limiter = Arc::clone(self);
        move |request, response| limiter.apply(request, response)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("active_keys", &self.active_keys())
            .finish()
    }
}

#[derive(Default)]
struct Limiters {
    global: Option<Arc<RateLimiter>>,
    endpoints: HashMap<String, Arc<RateLimiter>>,
    users: Option<Arc<RateLimiter>>,
}

impl Limiters {
    fn all(&self) -> Vec<Arc<RateLimiter>> {
        self.global
            .iter()
            .chain(self.users.iter())
            .chain(self.endpoints.values())
            .cloned()
            .collect()
    }
}

/// Owns the server's limiters and sweeps their idle keys in the
/// background. The sweep stops when the registry is dropped.
pub struct RateLimitRegistry {
    limiters: Arc<Mutex<Limiters>>,
    idle_expiry: Duration,
    sweeper: Option<JoinHandle<()>>,
}

impl RateLimitRegistry {
    /// Creates a registry without a background sweep.
    pub fn new(idle_expiry: Duration) -> Self {
        Self {
            limiters: Arc::new(Mutex::new(Limiters::default())),
            idle_expiry,
            sweeper: None,
        }
    }

    /// Creates a registry and spawns its sweep on the current runtime.
    pub fn with_cleanup(cleanup_interval: Duration, idle_expiry: Duration) -> Self {
        let mut registry = Self::new(idle_expiry);
        let limiters = Arc::clone(&registry.limiters);
        let period = cleanup_interval.max(Duration::from_secs(1));

        registry.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let all = lock(&limiters).all();
                let now = Instant::now();
                for limiter in &all {
                    limiter.cleanup(now, idle_expiry);
                }
                tracing::trace!(limiters = all.len(), "rate limit cleanup sweep");
            }
        }));
        registry
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::with_cleanup(
            Duration::from_secs(config.cleanup_interval_secs),
            Duration::from_secs(config.idle_expiry_secs),
        )
    }

    /// Installs the limiter shared by every request.
    pub fn global(&self, config: RateLimitConfig) -> Arc<RateLimiter> {
        let limiter = Arc::new(RateLimiter::new(config));
        lock(&self.limiters).global = Some(Arc::clone(&limiter));
        limiter
    }

    /// Limiter for one endpoint, keyed by client address. Repeated calls
    /// for the same endpoint return the same limiter.
    pub fn endpoint(&self, endpoint: &str, config: RateLimitConfig) -> Arc<RateLimiter> {
        let mut limiters = lock(&self.limiters);
        let name = endpoint.to_string();
        Arc::clone(limiters.endpoints.entry(name.clone()).or_insert_with(|| {
            Arc::new(
                RateLimiter::new(config)
                    .with_key_fn(move |request| format!("{}|{}", keys::ip_address(request), name)),
            )
        }))
    }

    /// Limiter keyed by the bearer token.
    pub fn user(&self, config: RateLimitConfig) -> Arc<RateLimiter> {
        let mut limiters = lock(&self.limiters);
        Arc::clone(limiters.users.get_or_insert_with(|| {
            Arc::new(RateLimiter::new(config).with_key_fn(keys::user_id))
        }))
    }

    pub fn limiter_count(&self) -> usize {
        lock(&self.limiters).all().len()
    }

    pub fn active_keys(&self) -> usize {
        lock(&self.limiters).all().iter().map(|l| l.active_keys()).sum()
    }

    /// Runs one cleanup pass immediately.
    pub fn sweep(&self, now: Instant) {
        for limiter in lock(&self.limiters).all() {
            limiter.cleanup(now, self.idle_expiry);
        }
    }

    pub fn reset_all_limits(&self) {
        for limiter in lock(&self.limiters).all() {
            limiter.reset_all_limits();
        }
    }
}

impl Drop for RateLimitRegistry {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
