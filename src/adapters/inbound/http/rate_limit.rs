//! Per-source-IP sliding-window limiter for the webhook endpoint, grounded
//! on `omo-protocol-defi-flow`'s `api/rate_limit.rs` (a per-user sliding
//! window over a `VecDeque<Instant>`), keyed here by client IP instead of
//! an authenticated user id. See spec §4.1/§6.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct IpRateLimiter {
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl IpRateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        Self { requests: Mutex::new(HashMap::new()), max_requests: max_requests_per_minute as usize, window: Duration::from_secs(60) }
    }

    /// Returns `Ok(())` if `source` is under its burst limit, otherwise
    /// `Err(retry_after_secs)`.
    pub async fn check(&self, source: &str) -> Result<(), u64> {
        let mut map = self.requests.lock().await;
        let now = Instant::now();
        let entry = map.entry(source.to_string()).or_default();

        while entry.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            entry.pop_front();
        }

        if entry.len() >= self.max_requests {
            let oldest = *entry.front().unwrap();
            let retry_after = self.window.as_secs().saturating_sub(now.duration_since(oldest).as_secs());
            return Err(retry_after.max(1));
        }

        entry.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_configured_burst() {
        let limiter = IpRateLimiter::new(2);
        assert!(limiter.check("1.2.3.4").await.is_ok());
        assert!(limiter.check("1.2.3.4").await.is_ok());
        assert!(limiter.check("1.2.3.4").await.is_err());
    }

    #[tokio::test]
    async fn tracks_each_source_independently() {
        let limiter = IpRateLimiter::new(1);
        assert!(limiter.check("1.1.1.1").await.is_ok());
        assert!(limiter.check("2.2.2.2").await.is_ok());
    }
}
