//! Per-client request throttling.
//!
//! Requests over the per-second budget are not rejected outright: they wait
//! in a bounded queue, retrying admission every `delay_millis` until
//! `max_wait_millis` has passed.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::config::RateLimitConfig;
use crate::observability::metrics;
use crate::routing::matcher::{AnyPrefix, Matcher};
use crate::security::access_control::AllowedHostSet;

/// Header added to responses that had to wait for admission.
pub const DELAYED_HEADER: &str = "x-ratelimit-delayed-ms";

const WINDOW: Duration = Duration::from_secs(1);
const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Admissions of one client within the last second.
struct Tracker {
    admitted: VecDeque<Instant>,
    last_seen: Instant,
}

impl Tracker {
    fn new(now: Instant) -> Self {
        Self {
            admitted: VecDeque::new(),
            last_seen: now,
        }
    }

    fn try_admit(&mut self, now: Instant, limit: usize) -> bool {
        while let Some(&oldest) = self.admitted.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        self.last_seen = now;

        if self.admitted.len() < limit {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttled {
    /// Over the limit with a negative delay.
    Rejected,
    /// The throttled-request queue is full.
    QueueFull,
    /// Waited `max_wait_millis` without being admitted.
    WaitExhausted,
}

impl Throttled {
    fn reason(self) -> &'static str {
        match self {
            Throttled::Rejected => "rejected",
            Throttled::QueueFull => "queue_full",
            Throttled::WaitExhausted => "wait_exhausted",
        }
    }
}

/// State for the rate-limit stage.
pub struct RateLimiter {
    config: RateLimitConfig,
    allow_list: AllowedHostSet,
    trackers: DashMap<String, Tracker>,
    queue: Arc<Semaphore>,
    scope: Option<AnyPrefix>,
    epoch: Instant,
    last_sweep_millis: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter. With `api_only`, only paths under `api_prefixes` are throttled.
    pub async fn new(config: RateLimitConfig, api_prefixes: &[String]) -> Self {
        let allow_list = AllowedHostSet::from_entries(&config.ip_allow_list).await;
        let scope = config
            .api_only
            .then(|| AnyPrefix::new(api_prefixes.iter().cloned()));
        Self {
            queue: Arc::new(Semaphore::new(config.throttled_request_queue_depth)),
            config,
            allow_list,
            trackers: DashMap::new(),
            scope,
            epoch: Instant::now(),
            last_sweep_millis: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether requests for `path` are subject to throttling.
    pub fn applies_to(&self, path: &str) -> bool {
        self.scope.as_ref().map_or(true, |scope| scope.matches(path))
    }

    pub fn is_allow_listed(&self, ip: IpAddr) -> bool {
        self.allow_list.permits(ip)
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.trackers.len()
    }

    /// Identity a request is counted against.
    pub fn client_key(&self, peer: Option<SocketAddr>, headers: &HeaderMap) -> String {
        if self.config.track_sessions {
            if let Some(session) = session_from_cookies(headers, &self.config.session_cookie) {
                return format!("session:{session}");
            }
        }
        match peer {
            Some(addr) if self.config.remote_port => addr.to_string(),
            Some(addr) => addr.ip().to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Count one request against `key` if the client is under its budget.
    pub fn try_admit(&self, key: &str) -> bool {
        let now = Instant::now();
        let limit = self.config.max_requests_per_second as usize;
        self.trackers
            .entry(key.to_string())
            .or_insert_with(|| Tracker::new(now))
            .try_admit(now, limit)
    }

    /// Admit a request, waiting in the throttle queue if needed.
    ///
    /// Returns how long the request was held back.
    pub async fn admit(&self, key: &str) -> Result<Duration, Throttled> {
        if self.try_admit(key) {
            return Ok(Duration::ZERO);
        }
        if self.config.delay_millis < 0 {
            return Err(Throttled::Rejected);
        }

        let _permit = self
            .queue
            .clone()
            .try_acquire_owned()
            .map_err(|_| Throttled::QueueFull)?;

        let started = Instant::now();
        let delay = Duration::from_millis(self.config.delay_millis.unsigned_abs()).max(MIN_RETRY_DELAY);
        let max_wait = Duration::from_millis(self.config.max_wait_millis);

        loop {
            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(Throttled::WaitExhausted);
            }
            tokio::time::sleep(delay.min(max_wait - waited)).await;
            if self.try_admit(key) {
                return Ok(started.elapsed());
            }
        }
    }

    /// Drop trackers that have been idle longer than `max_idle_tracker_millis`.
    ///
    /// Runs at most once per idle period.
    pub fn sweep_idle(&self) {
        if self.config.max_idle_tracker_millis == 0 {
            return;
        }
        let max_idle = Duration::from_millis(self.config.max_idle_tracker_millis);
        let now_millis = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_sweep_millis.load(Ordering::Relaxed);
        if now_millis.saturating_sub(last) < self.config.max_idle_tracker_millis {
            return;
        }
        if self
            .last_sweep_millis
            .compare_exchange(last, now_millis, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let before = self.trackers.len();
        self.trackers
            .retain(|_, tracker| tracker.last_seen.elapsed() < max_idle);
        let evicted = before.saturating_sub(self.trackers.len());
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle rate-limit trackers");
        }
    }
}

fn session_from_cookies(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn unavailable(message: &'static str) -> Response {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

/// Middleware function for the rate-limit stage.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !limiter.applies_to(request.uri().path()) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    if peer.is_some_and(|addr| limiter.is_allow_listed(addr.ip())) {
        return next.run(request).await;
    }

    limiter.sweep_idle();
    let key = limiter.client_key(peer, request.headers());

    let delayed = match limiter.admit(&key).await {
        Ok(delayed) => delayed,
        Err(throttled) => {
            tracing::warn!(client = %key, reason = throttled.reason(), "Rate limit exceeded");
            metrics::record_rate_limited(throttled.reason());
            return unavailable("Too many requests");
        }
    };
    if !delayed.is_zero() {
        tracing::debug!(client = %key, delayed_ms = delayed.as_millis() as u64, "Request delayed");
        metrics::record_rate_limited("delayed");
    }

    let mut response = match limiter.config.max_request_duration_millis {
        0 => next.run(request).await,
        max => {
            let max = Duration::from_millis(max);
            match tokio::time::timeout(max, next.run(request)).await {
                Ok(response) => response,
                Err(_) => {
                    tracing::warn!(client = %key, max_ms = max.as_millis() as u64, "Request exceeded maximum duration");
                    metrics::record_rate_limited("duration_exceeded");
                    return unavailable("Request took too long");
                }
            }
        }
    };

    if limiter.config.insert_headers && !delayed.is_zero() {
        if let Ok(value) = HeaderValue::from_str(&delayed.as_millis().to_string()) {
            response.headers_mut().insert(DELAYED_HEADER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rate: u32, delay: i64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests_per_second: rate,
            delay_millis: delay,
            max_wait_millis: 200,
            throttled_request_queue_depth: 1,
            ..RateLimitConfig::default()
        }
    }

    fn prefixes() -> Vec<String> {
        vec!["/burst".to_string(), "/test".to_string()]
    }

    #[tokio::test]
    async fn budget_is_per_client() {
        let limiter = RateLimiter::new(config(2, -1), &prefixes()).await;
        assert!(limiter.try_admit("a"));
        assert!(limiter.try_admit("a"));
        assert!(!limiter.try_admit("a"));
        assert!(limiter.try_admit("b"));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[tokio::test]
    async fn negative_delay_rejects_immediately() {
        let limiter = RateLimiter::new(config(1, -1), &prefixes()).await;
        assert_eq!(limiter.admit("a").await, Ok(Duration::ZERO));
        assert_eq!(limiter.admit("a").await, Err(Throttled::Rejected));
    }

    #[tokio::test]
    async fn throttled_request_waits_then_gives_up() {
        let limiter = RateLimiter::new(config(1, 50), &prefixes()).await;
        assert!(limiter.admit("a").await.is_ok());
        let started = Instant::now();
        assert_eq!(limiter.admit("a").await, Err(Throttled::WaitExhausted));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn throttled_request_is_admitted_when_window_frees() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_wait_millis: 2_000,
                ..config(1, 100)
            },
            &prefixes(),
        )
        .await;
        assert!(limiter.admit("a").await.is_ok());
        let delayed = limiter.admit("a").await.unwrap();
        assert!(delayed >= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimitConfig {
                throttled_request_queue_depth: 0,
                ..config(1, 10)
            },
            &prefixes(),
        )
        .await);
        assert!(limiter.admit("a").await.is_ok());
        assert_eq!(limiter.admit("a").await, Err(Throttled::QueueFull));
    }

    #[tokio::test]
    async fn scope_and_allow_list() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                ip_allow_list: vec!["10.0.0.0/8".to_string()],
                ..RateLimitConfig::default()
            },
            &prefixes(),
        )
        .await;
        assert!(limiter.applies_to("/burst"));
        assert!(limiter.applies_to("/test/x"));
        assert!(!limiter.applies_to("/index.html"));
        assert!(limiter.is_allow_listed("10.2.3.4".parse().unwrap()));
        assert!(!limiter.is_allow_listed("127.0.0.1".parse().unwrap()));

        let everywhere = RateLimiter::new(
            RateLimitConfig {
                api_only: false,
                ..RateLimitConfig::default()
            },
            &prefixes(),
        )
        .await;
        assert!(everywhere.applies_to("/index.html"));
    }

    #[tokio::test]
    async fn client_identity() {
        let peer: SocketAddr = "192.0.2.7:4242".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=abc123"));

        let by_ip = RateLimiter::new(RateLimitConfig::default(), &prefixes()).await;
        assert_eq!(by_ip.client_key(Some(peer), &headers), "192.0.2.7");

        let by_port = RateLimiter::new(
            RateLimitConfig {
                remote_port: true,
                ..RateLimitConfig::default()
            },
            &prefixes(),
        )
        .await;
        assert_eq!(by_port.client_key(Some(peer), &headers), "192.0.2.7:4242");

        let by_session = RateLimiter::new(
            RateLimitConfig {
                track_sessions: true,
                ..RateLimitConfig::default()
            },
            &prefixes(),
        )
        .await;
        assert_eq!(by_session.client_key(Some(peer), &headers), "session:abc123");
        assert_eq!(
            by_session.client_key(Some(peer), &HeaderMap::new()),
            "192.0.2.7"
        );
    }

    #[tokio::test]
    async fn idle_trackers_are_evicted() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                max_idle_tracker_millis: 1,
                ..RateLimitConfig::default()
            },
            &prefixes(),
        )
        .await;
        limiter.try_admit("a");
        tokio::time::sleep(Duration::from_millis(5)).await;
        limiter.sweep_idle();
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
