use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Keyed token bucket. Refill is continuous at `per_minute / 60` tokens per
/// second up to `burst`; a request costing more tokens than are available is
/// rejected with the number of whole seconds until it would be admitted.
#[derive(Debug)]
pub struct RateLimiter<K: Eq + Hash + Clone> {
    buckets: Mutex<HashMap<K, Bucket>>,
    per_minute: f64,
    burst: f64,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            per_minute: f64::from(per_minute.max(1)),
            burst: f64::from(burst.max(1)),
        }
    }

    pub fn try_acquire(&self, key: &K, cost: u32) -> Result<(), u64> {
        self.try_acquire_at(key, cost, Instant::now())
    }

    fn try_acquire_at(&self, key: &K, cost: u32, now: Instant) -> Result<(), u64> {
        let cost = f64::from(cost.max(1));
        let refill_per_second = self.per_minute / 60.0;

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.clone()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return Ok(());
        }

        let deficit = cost - bucket.tokens;
        let wait_seconds = (deficit / refill_per_second).ceil().max(1.0) as u64;
        Err(wait_seconds)
    }

    /// Drops buckets refilled back to capacity; called opportunistically so
    /// the map does not grow with one entry per historical subject.
    pub fn prune_full(&self) {
        let now = Instant::now();
        let refill_per_second = self.per_minute / 60.0;
        let burst = self.burst;
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens + elapsed * refill_per_second < burst
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_is_admitted_then_rejected() {
        let limiter: RateLimiter<String> = RateLimiter::new(60, 3);
        let key = "producer".to_string();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.try_acquire_at(&key, 1, now).is_ok());
        }
        let wait = limiter.try_acquire_at(&key, 1, now).unwrap_err();
        assert!(wait >= 1);
    }

    #[test]
    fn sustained_rate_below_refill_never_limits() {
        // 60/min = one token per second; one request per second stays level.
        let limiter: RateLimiter<String> = RateLimiter::new(60, 5);
        let key = "steady".to_string();
        let mut now = Instant::now();
        for _ in 0..50 {
            assert!(limiter.try_acquire_at(&key, 1, now).is_ok());
            now += Duration::from_secs(1);
        }
    }

    #[test]
    fn refill_restores_capacity() {
        let limiter: RateLimiter<String> = RateLimiter::new(60, 2);
        let key = "bursty".to_string();
        let now = Instant::now();
        assert!(limiter.try_acquire_at(&key, 2, now).is_ok());
        assert!(limiter.try_acquire_at(&key, 1, now).is_err());
        assert!(limiter
            .try_acquire_at(&key, 1, now + Duration::from_secs(2))
            .is_ok());
    }

    #[test]
    fn batch_cost_counts_each_sample() {
        let limiter: RateLimiter<String> = RateLimiter::new(100, 120);
        let key = "batch".to_string();
        let now = Instant::now();
        assert!(limiter.try_acquire_at(&key, 120, now).is_ok());
        let wait = limiter.try_acquire_at(&key, 10, now).unwrap_err();
        assert!(wait >= 1);
    }

    #[test]
    fn prune_drops_idle_buckets() {
        let limiter: RateLimiter<String> = RateLimiter::new(6000, 1);
        let key = "idle".to_string();
        let now = Instant::now();
        assert!(limiter.try_acquire_at(&key, 1, now).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        limiter.prune_full();
        let buckets = limiter.buckets.lock().unwrap();
        assert!(buckets.is_empty());
    }
}
