use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::core::config::RateLimitConfig;

/// Callers tracked before idle buckets are swept
const SWEEP_THRESHOLD: usize = 10_000;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

/// Sliding-window request limiter keyed by caller and route
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            config: config.clone(),
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, caller: &str, route: &str) -> RateDecision {
        self.check_at(caller, route, Instant::now())
    }

    fn check_at(&self, caller: &str, route: &str, now: Instant) -> RateDecision {
        if self.buckets.len() > SWEEP_THRESHOLD {
            self.sweep(now);
        }

        let window = self.config.window;
        let limit = self.config.limit_for(route);
        let mut bucket = self.buckets.entry(format!("{}:{}", route, caller)).or_default();
        while bucket.front().is_some_and(|t| now.duration_since(*t) >= window) {
            bucket.pop_front();
        }

        if bucket.len() as u32 >= limit {
            // the oldest request leaves the window first
            let retry_after = bucket
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            debug!("Rate limited {} on {} for {:?}", caller, route, retry_after);
            return RateDecision::Limited { retry_after };
        }

        bucket.push_back(now);
        RateDecision::Allowed {
            remaining: limit - bucket.len() as u32,
        }
    }

    /// Drop buckets whose requests have all left the window
    fn sweep(&self, now: Instant) {
        let window = self.config.window;
        self.buckets
            .retain(|_, bucket| bucket.back().is_some_and(|t| now.duration_since(*t) < window));
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// Bucket key for a caller: its API key or bearer token when it sends one,
/// otherwise its address (IPv6 callers grouped by /64).
pub fn caller_key(api_key: Option<&str>, addr: Option<IpAddr>) -> String {
    if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
        return format!("key:{}", key);
    }
    match addr {
        Some(IpAddr::V4(v4)) => format!("ip:{}", v4),
        Some(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => format!("ip:{}", v4),
            None => {
                let s = v6.segments();
                format!("ip:{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3])
            }
        },
        None => "anonymous".to_string(),
    }
}
