use moka::sync::Cache;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-client requests-per-second limiter.
pub struct RateLimiter {
    limit: u32,
    whitelist: HashSet<IpAddr>,
    // 每个客户端一个计数窗口，1 秒后自动过期
    windows: Cache<IpAddr, Arc<AtomicU32>>,
}

impl RateLimiter {
    pub fn new(limit: u32, whitelist: &[String]) -> Self {
        Self::with_window(limit, whitelist, Duration::from_secs(1))
    }

    fn with_window(limit: u32, whitelist: &[String], window: Duration) -> Self {
        let whitelist = whitelist.iter().filter_map(|s| match s.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!("Ignoring invalid ratelimit whitelist entry '{}'", s);
                None
            }
        }).collect();
        Self {
            limit,
            whitelist,
            windows: Cache::builder().max_capacity(65_536).time_to_live(window).build(),
        }
    }

    /// True when this request exceeds the limit and must be dropped.
    pub fn is_ratelimited(&self, ip: IpAddr) -> bool {
        if self.limit == 0 || self.whitelist.contains(&ip) { return false; }
        let counter = self.windows.get_with(ip, || Arc::new(AtomicU32::new(0)));
        counter.fetch_add(1, Ordering::Relaxed) >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_per_client() {
        let rl = RateLimiter::new(3, &["127.0.0.1".to_string()]);
        let client: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!rl.is_ratelimited(client));
        assert!(!rl.is_ratelimited(client));
        assert!(!rl.is_ratelimited(client));
        assert!(rl.is_ratelimited(client));
        assert!(!rl.is_ratelimited("10.0.0.2".parse().unwrap()));

        let local: IpAddr = "127.0.0.1".parse().unwrap();
        assert!((0..10).all(|_| !rl.is_ratelimited(local)));
    }

    #[test]
    fn window_expires() {
        let rl = RateLimiter::with_window(1, &[], Duration::from_millis(50));
        let client: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!rl.is_ratelimited(client));
        assert!(rl.is_ratelimited(client));
        std::thread::sleep(Duration::from_millis(120));
        assert!(!rl.is_ratelimited(client));
    }

    #[test]
    fn disabled() {
        let rl = RateLimiter::new(0, &[]);
        assert!((0..100).all(|_| !rl.is_ratelimited("10.0.0.1".parse().unwrap())));
    }
}
