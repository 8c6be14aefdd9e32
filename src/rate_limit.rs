//! Crawl-delay rate limiting for the chapter downloader.
//!
//! The teacher uses `governor`'s keyed rate limiter to throttle inbound HTTP requests by
//! IP and by path+method (`rate_limit.rs`, built for a `warp` server). Here the same
//! crate throttles the opposite direction: outbound fetches to the source site, keyed by
//! host, so concurrent crawl workers hitting the same domain still honor one crawl delay
//! between them instead of one per worker.

use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Cheaply cloneable: the keyed rate limiter lives behind an `Arc` so the producer and
/// any other task sharing one crawl delay budget can each hold a handle without the
/// state store itself needing to be `Clone`.
#[derive(Clone)]
pub struct CrawlDelayLimiter {
    limiter: Arc<RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>>,
}

impl CrawlDelayLimiter {
    /// `delay` is the minimum spacing between two fetches to the same host. A delay of
    /// zero still enforces a quota of 1 request per the shortest representable period,
    /// which in practice never blocks.
    pub fn new(delay: Duration) -> Self {
        let per_period: NonZeroU32 = nonzero!(1u32);
        let period = if delay.is_zero() { Duration::from_millis(1) } else { delay };
        let quota = Quota::with_period(period)
            .map(|q| q.allow_burst(per_period))
            .unwrap_or_else(|| Quota::per_second(nonzero!(1000u32)));
        CrawlDelayLimiter {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Returns a handle sharing this limiter's state, so every crawl task honors the
    /// same per-host delay budget rather than each getting its own.
    pub fn clone_handle(&self) -> Self {
        self.clone()
    }

    fn host_key(url: &str) -> String {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| url.to_string())
    }

    /// Blocks the calling task until a fetch to `url`'s host is permitted. Uses the
    /// limiter's internal clock rather than a fixed pre-request sleep, so bursts that
    /// arrive well-spaced pass through immediately.
    pub async fn wait(&self, url: &str) {
        let key = Self::host_key(url);
        self.limiter.until_key_ready(&key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn second_fetch_to_same_host_is_delayed() {
        let limiter = CrawlDelayLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.wait("https://example.com/a").await;
        limiter.wait("https://example.com/b").await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn different_hosts_do_not_share_a_delay_budget() {
        let limiter = CrawlDelayLimiter::new(Duration::from_millis(200));
        let start = Instant::now();
        limiter.wait("https://example.com/a").await;
        limiter.wait("https://other.com/a").await;
        assert!(start.elapsed() < Duration::from_millis(150));
    }
}
