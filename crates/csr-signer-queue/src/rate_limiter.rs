//! Retry delay policies for the work queue
//!
//! A [`RateLimiter`] answers "how long should this item wait before it is
//! retried?" and tracks per-item failure history so it can be reset once the
//! item succeeds.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Base delay of the default per-item backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Cap of the default per-item backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Refill rate of the default global token bucket (tokens per second)
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;

/// Size of the default global token bucket
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Computes retry delays for queue items
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` should be processed again; records a failure
    fn when(&self, item: &K) -> Duration;

    /// Drop all failure history for `item`
    fn forget(&self, item: &K);

    /// Number of failures recorded for `item`
    fn num_requeues(&self, item: &K) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialFailureRateLimiter<K> {
    /// Create a limiter with the given base delay and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Send + Sync> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        if exp >= 64 {
            return self.max;
        }
        match self.base.as_nanos().checked_mul(1u128 << exp) {
            Some(nanos) if nanos < self.max.as_nanos() => Duration::from_nanos(nanos as u64),
            _ => self.max,
        }
    }

    fn forget(&self, item: &K) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Global token bucket shared by all items
///
/// Every call reserves one token. Reservations may drive the bucket negative;
/// the returned delay is the time until the reserved token is refilled.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Create a full bucket refilling at `qps` tokens per second up to `burst`
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters; the longest delay wins
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    /// Create a combined limiter
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// The controller's retry policy: per-item backoff 200ms..1000s combined with
/// a 10 qps / 100 burst global bucket
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::new(
            DEFAULT_BUCKET_QPS,
            DEFAULT_BUCKET_BURST,
        )),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(2));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(4));
        assert_eq!(limiter.when(&"one"), Duration::from_millis(8));
        assert_eq!(limiter.num_requeues(&"one"), 4);
    }

    #[test]
    fn exponential_backoff_is_monotonic_then_capped() {
        let limiter = ItemExponentialFailureRateLimiter::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY);
        let mut previous = Duration::ZERO;
        for _ in 0..200 {
            let delay = limiter.when(&"flaky");
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= DEFAULT_MAX_DELAY);
            previous = delay;
        }
        assert_eq!(previous, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn exponential_backoff_is_per_item() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        assert_eq!(limiter.when(&"b"), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 1);
    }

    #[test]
    fn forget_resets_backoff() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let limiter = BucketRateLimiter::new(10.0, 100);
        for _ in 0..100 {
            assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
        }
        let delay = RateLimiter::<&str>::when(&limiter, &"x");
        assert!(delay > Duration::from_millis(50), "{delay:?}");
        assert!(delay <= Duration::from_millis(100), "{delay:?}");

        // The next reservation queues behind the previous one.
        let next = RateLimiter::<&str>::when(&limiter, &"y");
        assert!(next > delay);
    }

    #[test]
    fn max_of_takes_longest_delay() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(10),
            )),
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_secs(10),
            )),
        ]);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&"a"), 2);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[test]
    fn default_limiter_starts_fast() {
        let limiter = default_controller_rate_limiter::<String>();
        let key = "csr-a".to_string();
        assert_eq!(limiter.when(&key), DEFAULT_BASE_DELAY);
        assert_eq!(limiter.when(&key), DEFAULT_BASE_DELAY * 2);
    }
}
