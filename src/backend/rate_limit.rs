//! Per-client sliding-window rate limiting.
//!
//! Clients are identified by the first `X-Forwarded-For` entry, falling back
//! to the peer address. The header is taken at face value, so a client can
//! pick its own identity by sending it; deployments that care must strip the
//! header at the proxy.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;

/// Allowance for one endpoint: at most `max_requests` per trailing `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub name: &'static str,
    pub max_requests: usize,
    pub window: Duration,
}

impl RateBudget {
    pub const fn per_minute(name: &'static str, max_requests: usize) -> Self {
        Self {
            name,
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

pub const LIST_DOWNLOADS: RateBudget = RateBudget::per_minute("list_downloads", 120);
pub const ADD_DOWNLOAD: RateBudget = RateBudget::per_minute("add_download", 30);
pub const LIST_FILES: RateBudget = RateBudget::per_minute("list_files", 120);
pub const EXTRACT_FILE: RateBudget = RateBudget::per_minute("extract_file", 10);
pub const DELETE_FILE: RateBudget = RateBudget::per_minute("delete_file", 30);
pub const CONTROL_DOWNLOAD: RateBudget = RateBudget::per_minute("control_download", 60);

/// Idle windows are dropped at most this often
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Window {
    span: Duration,
    hits: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) >= self.span {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Default)]
struct Windows {
    by_client: HashMap<(&'static str, String), Window>,
    last_sweep: Option<Instant>,
}

impl Windows {
    /// Forgets every window with nothing left inside it, so client ids that
    /// stop calling do not pile up.
    fn sweep(&mut self, now: Instant) {
        let due = self
            .last_sweep
            .is_none_or(|last| now.saturating_duration_since(last) >= SWEEP_INTERVAL);
        if !due {
            return;
        }
        self.by_client.retain(|_, window| {
            window.prune(now);
            !window.hits.is_empty()
        });
        self.last_sweep = Some(now);
    }
}

/// Request timestamps per (endpoint, client). Windows are pruned when the
/// client next calls, and idle ones are swept out periodically, both on the
/// request path.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, client: &str, budget: RateBudget) -> bool {
        self.allow_at(client, budget, Instant::now())
    }

    /// Admits the call iff fewer than `max_requests` fall inside the window
    /// ending at `now`; admitted calls are recorded.
    pub fn allow_at(&self, client: &str, budget: RateBudget, now: Instant) -> bool {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.sweep(now);

        let window = windows
            .by_client
            .entry((budget.name, client.to_string()))
            .or_insert_with(|| Window {
                span: budget.window,
                hits: VecDeque::new(),
            });
        window.prune(now);

        if window.hits.len() >= budget.max_requests {
            return false;
        }
        window.hits.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_client
            .len()
    }
}

/// First `X-Forwarded-For` entry, else the peer IP
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (forwarded, peer) {
        (Some(forwarded), _) => forwarded.to_string(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Middleware state: which limiter and which budget guard a route
#[derive(Debug, Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    budget: RateBudget,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>, budget: RateBudget) -> Self {
        Self { limiter, budget }
    }
}

pub async fn enforce(State(rule): State<RateLimit>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_id(request.headers(), peer);

    if !rule.limiter.allow(&client, rule.budget) {
        tracing::warn!(%client, endpoint = rule.budget.name, "Rate limit exceeded");
        return ApiError::rate_limited().into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const TIGHT: RateBudget = RateBudget {
        name: "tight",
        max_requests: 3,
        window: Duration::from_secs(60),
    };

    #[test]
    fn admits_exactly_max_per_window() {
        let limiter = RateLimiter::new();
        let start = Instant::now();

        for i in 0..3 {
            assert!(limiter.allow_at("1.2.3.4", TIGHT, start + Duration::from_secs(i)));
        }
        assert!(!limiter.allow_at("1.2.3.4", TIGHT, start + Duration::from_secs(10)));
        // other clients have their own window
        assert!(limiter.allow_at("5.6.7.8", TIGHT, start + Duration::from_secs(10)));

        // the first call leaves the window at start + 60s
        assert!(limiter.allow_at("1.2.3.4", TIGHT, start + Duration::from_secs(60)));
        assert!(!limiter.allow_at("1.2.3.4", TIGHT, start + Duration::from_secs(60)));
    }

    #[test]
    fn rejected_calls_are_not_recorded() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.allow_at("c", TIGHT, start));
        }
        for s in 1..50 {
            assert!(!limiter.allow_at("c", TIGHT, start + Duration::from_secs(s)));
        }
        assert!(limiter.allow_at("c", TIGHT, start + Duration::from_secs(60)));
    }

    #[test]
    fn endpoints_are_budgeted_separately() {
        let limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..EXTRACT_FILE.max_requests {
            assert!(limiter.allow_at("c", EXTRACT_FILE, now));
        }
        assert!(!limiter.allow_at("c", EXTRACT_FILE, now));
        assert!(limiter.allow_at("c", LIST_FILES, now));
    }

    #[test]
    fn idle_clients_are_forgotten() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for i in 0..10_000 {
            assert!(limiter.allow_at(&format!("10.9.{}.{}", i / 256, i % 256), TIGHT, start));
        }
        assert_eq!(limiter.tracked(), 10_000);

        // still inside the sweep interval: nothing is dropped yet
        assert!(limiter.allow_at("late", TIGHT, start + Duration::from_secs(30)));
        assert_eq!(limiter.tracked(), 10_001);

        assert!(limiter.allow_at("late", TIGHT, start + Duration::from_secs(3600)));
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn client_identity() {
        let peer: SocketAddr = "10.0.0.9:5123".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_id(&headers, Some(peer)), "10.0.0.9");
        assert_eq!(client_id(&headers, None), "unknown");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_id(&headers, Some(peer)), "203.0.113.7");
    }
}
