use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lantern::config::{KeyExtractor, RateLimitConfig, RateLimitStrategy};
use lantern::http::request::{Method, Request, RequestBuilder};
use lantern::http::response::{Response, StatusCode};
use lantern::server::rate_limit::{RateLimitAlgorithm, SlidingWindow, TokenBucket, keys};
use lantern::server::{App, RateLimitRegistry, RateLimiter};

fn request_from(ip: &str) -> RequestBuilder {
    let addr: SocketAddr = format!("{ip}:40000").parse().unwrap();
    RequestBuilder::new()
        .method(Method::GET)
        .path("/api/items")
        .remote_addr(addr)
}

fn plain(ip: &str) -> Request {
    request_from(ip).build().unwrap()
}

fn config(strategy: RateLimitStrategy, max_requests: u64) -> RateLimitConfig {
    RateLimitConfig {
        strategy,
        max_requests,
        window_secs: 60,
        ..RateLimitConfig::default()
    }
}

// ---- key extraction ----

#[test]
fn test_ip_key_prefers_forwarding_headers() {
    assert_eq!(keys::ip_address(&plain("10.0.0.1")), "10.0.0.1");

    let forwarded = request_from("10.0.0.1")
        .header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
        .build()
        .unwrap();
    assert_eq!(keys::ip_address(&forwarded), "203.0.113.9");

    let real_ip = request_from("10.0.0.1")
        .header("X-Real-IP", "198.51.100.4")
        .build()
        .unwrap();
    assert_eq!(keys::ip_address(&real_ip), "198.51.100.4");

    let anonymous = RequestBuilder::new().method(Method::GET).path("/").build().unwrap();
    assert_eq!(keys::ip_address(&anonymous), "unknown");
}

#[test]
fn test_identity_keys_fall_back_to_ip() {
    let bearer = request_from("10.0.0.2")
        .header("Authorization", "Bearer user-17")
        .build()
        .unwrap();
    assert_eq!(keys::user_id(&bearer), "user-17");
    assert_eq!(keys::user_id(&plain("10.0.0.2")), "10.0.0.2");

    let header_key = request_from("10.0.0.2").header("X-API-Key", "k1").build().unwrap();
    assert_eq!(keys::api_key(&header_key), "k1");
    let query_key = request_from("10.0.0.2").query("api_key", "k2").build().unwrap();
    assert_eq!(keys::api_key(&query_key), "k2");
    assert_eq!(keys::api_key(&plain("10.0.0.2")), "10.0.0.2");

    let agent = request_from("10.0.0.2").header("User-Agent", "curl/8").build().unwrap();
    assert_eq!(keys::ip_and_user_agent(&agent), "10.0.0.2|curl/8");
    assert_eq!(keys::ip_and_user_agent(&plain("10.0.0.2")), "10.0.0.2|unknown");

    assert_eq!(KeyExtractor::EndpointPath.extract(&plain("10.0.0.2")), "/api/items");
    assert_eq!(KeyExtractor::IpAddress.extract(&plain("10.0.0.2")), "10.0.0.2");
}

// ---- algorithms ----

#[test]
fn test_token_bucket_allows_a_burst_then_refills() {
    let bucket = TokenBucket::new(3, 1, Duration::from_secs(1));
    let start = Instant::now();

    let remaining: Vec<u64> = (0..3).map(|_| bucket.check("k", start).remaining).collect();
    assert_eq!(remaining, vec![2, 1, 0]);

    let denied = bucket.check("k", start + Duration::from_millis(400));
    assert!(!denied.allowed);
    assert_eq!(denied.reset_after, Duration::from_millis(600));
    assert_eq!(denied.limit_type, "token_bucket");

    assert!(bucket.check("k", start + Duration::from_secs(1)).allowed);
    assert!(!bucket.check("k", start + Duration::from_millis(1500)).allowed);

    // Other keys have their own bucket.
    assert!(bucket.check("other", start).allowed);
    assert_eq!(bucket.active_keys(), 2);
}

#[test]
fn test_token_bucket_refill_after_a_long_idle_stays_on_the_interval_grid() {
    let bucket = TokenBucket::new(3, 1, Duration::from_millis(1));
    let start = Instant::now();
    for _ in 0..3 {
        assert!(bucket.check("k", start).allowed);
    }

    // More whole intervals than fit in a u32.
    let later = start + Duration::from_secs(60 * 86_400) + Duration::from_micros(500);
    let remaining: Vec<u64> = (0..3).map(|_| bucket.check("k", later).remaining).collect();
    assert_eq!(remaining, vec![2, 1, 0]);

    let denied = bucket.check("k", later);
    assert!(!denied.allowed);
    assert_eq!(denied.reset_after, Duration::from_micros(500));
}

#[test]
fn test_sliding_window_frees_slots_as_requests_age() {
    let window = SlidingWindow::new(2, Duration::from_secs(10));
    let start = Instant::now();

    assert!(window.check("k", start).allowed);
    assert!(window.check("k", start + Duration::from_secs(5)).allowed);
    let denied = window.check("k", start + Duration::from_secs(8));
    assert!(!denied.allowed);
    assert_eq!(denied.reset_after, Duration::from_secs(2));

    assert!(window.check("k", start + Duration::from_secs(10)).allowed);
    assert!(!window.check("k", start + Duration::from_secs(11)).allowed);
}

#[test]
fn test_each_strategy_enforces_its_limit() {
    for strategy in [
        RateLimitStrategy::FixedWindow,
        RateLimitStrategy::SlidingWindow,
        RateLimitStrategy::TokenBucket,
        RateLimitStrategy::LeakyBucket,
    ] {
        let mut cfg = config(strategy, 3);
        cfg.burst_capacity = 3;
        let limiter = RateLimiter::new(cfg);
        let now = Instant::now();

        for i in 0..3 {
            assert!(limiter.check_request_at(&plain("10.1.1.1"), now).allowed, "{strategy:?} #{i}");
        }
        assert!(!limiter.check_request_at(&plain("10.1.1.1"), now).allowed, "{strategy:?}");
        assert!(limiter.check_request_at(&plain("10.1.1.2"), now).allowed, "{strategy:?}");
    }
}

#[test]
fn test_disabled_limiter_allows_everything() {
    let mut cfg = config(RateLimitStrategy::FixedWindow, 1);
    cfg.enabled = false;
    let limiter = RateLimiter::new(cfg);

    let mut response = Response::ok("ok");
    for _ in 0..10 {
        assert!(limiter.apply(&plain("10.0.0.3"), &mut response));
    }
    assert!(response.header("X-RateLimit-Limit").is_none());
    assert_eq!(limiter.active_keys(), 0);
}

// ---- middleware ----

#[test]
fn test_apply_sets_headers_and_429_body() {
    let limiter = RateLimiter::new(config(RateLimitStrategy::FixedWindow, 2));

    let mut first = Response::new(StatusCode::Ok);
    assert!(limiter.apply(&plain("10.0.0.4"), &mut first));
    assert_eq!(first.header("X-RateLimit-Limit"), Some("2"));
    assert_eq!(first.header("X-RateLimit-Remaining"), Some("1"));
    assert!(first.header("X-RateLimit-Reset").is_none());

    let mut second = Response::new(StatusCode::Ok);
    assert!(limiter.apply(&plain("10.0.0.4"), &mut second));
    assert_eq!(second.header("X-RateLimit-Remaining"), Some("0"));

    let mut third = Response::new(StatusCode::Ok);
    assert!(!limiter.apply(&plain("10.0.0.4"), &mut third));
    assert_eq!(third.status(), StatusCode::TooManyRequests);
    assert_eq!(third.header("X-RateLimit-Type"), Some("fixed_window"));
    assert_eq!(third.header("Content-Type"), Some("application/json"));
    let reset: u64 = third.header("X-RateLimit-Reset").unwrap().parse().unwrap();
    assert!((1..=60).contains(&reset));

    let body: serde_json::Value = serde_json::from_slice(third.body_bytes()).unwrap();
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["reason"], "Fixed window limit exceeded");
}

#[test]
fn test_limiter_as_app_middleware() {
    let limiter = Arc::new(RateLimiter::new(config(RateLimitStrategy::SlidingWindow, 1)));
    let mut app = App::new();
    app.get("/api/items", |_req| Ok(Response::ok("items")));
    app.use_middleware(limiter.middleware());

    let ok = app.handle(&plain("10.0.0.5")).unwrap();
    assert_eq!(ok.status(), StatusCode::Ok);
    assert_eq!(ok.body_bytes(), b"items");
    assert_eq!(ok.header("X-RateLimit-Remaining"), Some("0"));

    let limited = app.handle(&plain("10.0.0.5")).unwrap();
    assert_eq!(limited.status(), StatusCode::TooManyRequests);

    limiter.reset_all_limits();
    assert_eq!(app.handle(&plain("10.0.0.5")).unwrap().status(), StatusCode::Ok);
}

#[test]
fn test_custom_key_function() {
    let limiter = RateLimiter::new(config(RateLimitStrategy::FixedWindow, 1))
        .with_key_fn(|_req| "everyone".to_string());
    let now = Instant::now();

    assert!(limiter.check_request_at(&plain("10.0.0.6"), now).allowed);
    assert!(!limiter.check_request_at(&plain("10.0.0.7"), now).allowed);
}

// ---- registry ----

#[test]
fn test_registry_endpoint_limiters_are_cached() {
    let registry = RateLimitRegistry::new(Duration::from_secs(3600));

    let login = registry.endpoint("/login", config(RateLimitStrategy::FixedWindow, 1));
    let again = registry.endpoint("/login", config(RateLimitStrategy::FixedWindow, 50));
    assert!(Arc::ptr_eq(&login, &again));
    assert_eq!(again.config().max_requests, 1);

    let search = registry.endpoint("/search", config(RateLimitStrategy::FixedWindow, 1));
    registry.global(config(RateLimitStrategy::TokenBucket, 10));
    registry.user(config(RateLimitStrategy::SlidingWindow, 10));
    assert_eq!(registry.limiter_count(), 4);

    // Endpoint limiters count per client address and endpoint.
    assert!(login.check_request(&plain("10.0.0.8")).allowed);
    assert!(!login.check_request(&plain("10.0.0.8")).allowed);
    assert!(search.check_request(&plain("10.0.0.8")).allowed);
    assert!(login.check_request(&plain("10.0.0.9")).allowed);
    assert_eq!(registry.active_keys(), 3);

    registry.reset_all_limits();
    assert_eq!(registry.active_keys(), 0);
}

#[test]
fn test_registry_sweep_drops_idle_keys() {
    let registry = RateLimitRegistry::new(Duration::from_secs(60));
    let limiter = registry.global(config(RateLimitStrategy::SlidingWindow, 10));

    let start = Instant::now();
    limiter.check_request_at(&plain("10.0.1.1"), start);
    limiter.check_request_at(&plain("10.0.1.2"), start + Duration::from_secs(50));
    assert_eq!(registry.active_keys(), 2);

    registry.sweep(start + Duration::from_secs(90));
    assert_eq!(registry.active_keys(), 1);

    registry.sweep(start + Duration::from_secs(200));
    assert_eq!(registry.active_keys(), 0);
}

#[tokio::test]
async fn test_registry_background_sweep_starts_and_stops() {
    let registry = RateLimitRegistry::from_config(&RateLimitConfig::default());
    let limiter = registry.global(RateLimitConfig::default());
    assert!(limiter.check_request(&plain("10.0.2.1")).allowed);
    assert_eq!(registry.active_keys(), 1);
    drop(registry);

    // The limiter outlives the registry that handed it out.
    assert!(limiter.check_request(&plain("10.0.2.1")).allowed);
}
