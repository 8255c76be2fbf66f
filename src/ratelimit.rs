//! Per-client token bucket rate limiter
//!
//! Each client key (authenticated user or remote IP) gets an independent
//! bucket that refills continuously using integer-only arithmetic. Idle
//! buckets are cleaned up periodically so the map stays bounded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Duration after which an idle bucket is eligible for cleanup.
const BUCKET_EXPIRY_SECS: u64 = 300;

/// Minimum interval between cleanup sweeps.
const CLEANUP_INTERVAL_SECS: u64 = 60;

/// Per-client token state.
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Thread-safe per-client token bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<RateLimiterInner>,
    tokens_per_min: u32,
}

struct RateLimiterInner {
    map: HashMap<String, Bucket>,
    last_cleanup: Instant,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given per-minute token count.
    pub fn new(tokens_per_min: u32) -> Self {
        Self {
            buckets: Mutex::new(RateLimiterInner {
                map: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            tokens_per_min,
        }
    }

    /// Checks and consumes one token for the given client key.
    ///
    /// Returns false when the bucket is empty and the client must wait.
    pub fn check(&self, key: &str) -> bool {
        let Ok(mut inner) = self.buckets.lock() else {
            // A poisoned lock should not lock every client out
            return true;
        };

        let now = Instant::now();
        self.maybe_cleanup(&mut inner, now);

        let tokens_per_min = self.tokens_per_min;
        let bucket = inner.map.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: tokens_per_min,
            last_refill: now,
        });

        refill_bucket(bucket, tokens_per_min, now);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Removes expired buckets to prevent unbounded memory growth.
    fn maybe_cleanup(&self, inner: &mut RateLimiterInner, now: Instant) {
        let elapsed = now.duration_since(inner.last_cleanup).as_secs();
        if elapsed < CLEANUP_INTERVAL_SECS {
            return;
        }

        inner.last_cleanup = now;
        inner.map.retain(|_, bucket| {
            let idle = now.duration_since(bucket.last_refill).as_secs();
            idle < BUCKET_EXPIRY_SECS
        });
    }

    /// Number of currently tracked clients; for monitoring and tests.
    pub fn tracked_clients(&self) -> usize {
        self.buckets
            .lock()
            .map(|inner| inner.map.len())
            .unwrap_or(0)
    }
}

/// Refills a bucket based on elapsed time since the last refill.
///
/// Integer-only: `refill = elapsed_ms * tokens_per_min / 60_000`.
fn refill_bucket(bucket: &mut Bucket, tokens_per_min: u32, now: Instant) {
    let elapsed_ms = now.duration_since(bucket.last_refill).as_millis();
    if elapsed_ms == 0 {
        return;
    }

    // Cap to keep the multiplication well inside u64
    let capped_ms: u64 = if elapsed_ms > 600_000 {
        600_000
    } else {
        elapsed_ms as u64
    };

    let refill = capped_ms.saturating_mul(tokens_per_min as u64) / 60_000;
    if refill > 0 {
        let new_tokens = (bucket.tokens as u64)
            .saturating_add(refill)
            .min(tokens_per_min as u64);
        bucket.tokens = new_tokens as u32;
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn allows_up_to_limit() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));
    }

    #[test]
    fn different_clients_independent() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));

        assert!(limiter.check("bob"));
        assert!(limiter.check("bob"));
    }

    #[test]
    fn tokens_refill_after_time() {
        // 600/min = 10/sec, one token per 100ms
        let limiter = RateLimiter::new(600);
        for _ in 0..600 {
            let _ = limiter.check("alice");
        }
        assert!(!limiter.check("alice"));

        thread::sleep(Duration::from_millis(200));
        assert!(limiter.check("alice"));
    }

    #[test]
    fn tracked_clients_count() {
        let limiter = RateLimiter::new(10);
        assert_eq!(limiter.tracked_clients(), 0);
        let _ = limiter.check("alice");
        let _ = limiter.check("bob");
        assert_eq!(limiter.tracked_clients(), 2);
    }
}
