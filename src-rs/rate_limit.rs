use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Sliding-window counter per key; state is process-local.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_and_count(&self, key: &str) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut buckets = self.buckets.lock();
        if buckets.len() > 50_000 {
            buckets.retain(|_, bucket| bucket.back().is_some_and(|last| *last >= cutoff));
        }
        let bucket = buckets.entry(key.to_string()).or_default();

        while bucket.front().is_some_and(|front| *front < cutoff) {
            bucket.pop_front();
        }

        if bucket.len() >= self.max_requests {
            return false;
        }

        bucket.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_each_key_independently() {
        let limiter = InMemoryRateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.check_and_count("a"));
        assert!(limiter.check_and_count("a"));
        assert!(!limiter.check_and_count("a"));
        assert!(limiter.check_and_count("b"));
    }

    #[test]
    fn window_slides() {
        let limiter = InMemoryRateLimiter::new(Duration::from_millis(20), 1);
        assert!(limiter.check_and_count("a"));
        assert!(!limiter.check_and_count("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check_and_count("a"));
    }
}
