use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::ConnectInfo,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

// ---------------------------------------------------------------------------
// REST: per-IP token bucket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// IP-keyed limiter for the REST surface.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    rate: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(self.capacity));
        bucket.try_consume(self.rate, self.capacity)
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0, 30.0)
    }
}

pub async fn rate_limit_middleware(
    axum::extract::State(limiter): axum::extract::State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&req);

    if let Some(ip) = ip {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// WebSocket: per-session command quota
// ---------------------------------------------------------------------------

/// Fixed-window counter for one command kind on one session. The window is
/// one minute; breaching it surfaces `rate_limited` and drops the command.
/// A limit of zero disables the quota.
pub struct CommandQuota {
    limit: u32,
    count: u32,
    window_start: Instant,
}

const QUOTA_WINDOW: Duration = Duration::from_secs(60);

impl CommandQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            count: 0,
            window_start: Instant::now(),
        }
    }

    pub fn allow(&mut self) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= QUOTA_WINDOW {
            self.window_start = now;
            self.count = 0;
        }

        self.count += 1;
        self.count <= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }

        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn rate_limiter_tracks_ips_independently() {
        let limiter = RateLimiter::new(10.0, 2.0);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(ip1).await);
        assert!(limiter.check(ip1).await);
        assert!(!limiter.check(ip1).await);

        assert!(limiter.check(ip2).await);
    }

    #[tokio::test]
    async fn purge_stale_evicts_idle_buckets() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(limiter.check(ip).await);

        limiter.purge_stale(0.0).await;

        let buckets = limiter.buckets.lock().await;
        assert!(buckets.is_empty());
    }

    #[test]
    fn quota_blocks_excess_within_window() {
        let mut quota = CommandQuota::new(2);
        assert!(quota.allow());
        assert!(quota.allow());
        assert!(!quota.allow());
    }

    #[test]
    fn quota_resets_on_next_window() {
        let mut quota = CommandQuota::new(1);
        assert!(quota.allow());
        assert!(!quota.allow());

        // Rewind the window start instead of sleeping a minute.
        quota.window_start = Instant::now() - QUOTA_WINDOW;
        assert!(quota.allow());
    }

    #[test]
    fn zero_limit_disables_quota() {
        let mut quota = CommandQuota::new(0);
        for _ in 0..1000 {
            assert!(quota.allow());
        }
    }
}
