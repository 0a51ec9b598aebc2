//! Per-host circuit breaker
//!
//! Each host gets a saturating failure counter with a fixed bucket capacity
//! and a separate error threshold. The error handler records a failure for
//! every backend-error terminal; once the count reaches the threshold,
//! `allow` rejects the host until the periodic reset task clears every
//! bucket. There is no half-open state: the reset tick is the only way back
//! to closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::structure::ShardedMap;

pub const DEFAULT_BUCKET: usize = 10;
pub const DEFAULT_MAX_ERROR: usize = 5;
pub const DEFAULT_RESET_SECS: u64 = 60;

/// Failure bucket for a single host.
pub struct BreakerBucket {
    capacity: usize,
    threshold: usize,
    errors: AtomicUsize,
}

impl BreakerBucket {
    fn new(capacity: usize, threshold: usize) -> Self {
        Self {
            // The threshold must stay reachable even when the configured
            // bucket is smaller.
            capacity: capacity.max(threshold),
            threshold,
            errors: AtomicUsize::new(0),
        }
    }

    fn open(&self) -> bool {
        self.errors.load(Ordering::Relaxed) >= self.threshold
    }

    /// Saturating increment; returns false once the bucket is full.
    fn push(&self) -> bool {
        self.errors
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_ok()
    }

    fn reset(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Process-global breaker table.
pub struct Breaker {
    buckets: ShardedMap<Arc<BreakerBucket>>,
    bucket_size: usize,
    max_error: usize,
    reset_period: Duration,
}

impl Breaker {
    pub fn new(bucket_size: usize, max_error: usize, reset_period: Duration) -> Self {
        Self {
            buckets: ShardedMap::new(),
            bucket_size: if bucket_size == 0 {
                DEFAULT_BUCKET
            } else {
                bucket_size
            },
            max_error: if max_error == 0 {
                DEFAULT_MAX_ERROR
            } else {
                max_error
            },
            reset_period,
        }
    }

    fn bucket_for(&self, host: &str) -> Arc<BreakerBucket> {
        self.buckets.get_or_insert_with(host, || {
            Arc::new(BreakerBucket::new(self.bucket_size, self.max_error))
        })
    }

    /// True when the host is admitted. A first-seen host gets a fresh bucket
    /// and is always admitted.
    pub fn allow(&self, host: &str) -> bool {
        if self.bucket_for(host).open() {
            info!(host, "breaker is open");
            return false;
        }
        true
    }

    /// Record an upstream failure against the host.
    pub fn record_failure(&self, host: &str) {
        self.bucket_for(host).push();
    }

    /// Clear every bucket. Called by the reset task; exposed for tests.
    pub fn reset_all(&self) {
        self.buckets.range(|host, bucket| {
            bucket.reset();
            debug!(host, "breaker bucket reset");
            true
        });
    }

    /// Spawn the periodic reset task.
    pub fn start_reset_task(self: &Arc<Self>) {
        let breaker = Arc::clone(self);
        let period = breaker.reset_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                breaker.reset_all();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_host_is_admitted() {
        let breaker = Breaker::new(3, 3, Duration::from_secs(60));
        assert!(breaker.allow("fresh.example"));
    }

    #[test]
    fn test_breaker_opens_at_threshold() {
        let breaker = Breaker::new(3, 3, Duration::from_secs(60));
        assert!(breaker.allow("down.example"));

        breaker.record_failure("down.example");
        assert!(breaker.allow("down.example"));
        breaker.record_failure("down.example");
        assert!(breaker.allow("down.example"));
        breaker.record_failure("down.example");

        // Third failure reaches the threshold.
        assert!(!breaker.allow("down.example"));
        // Further failures do not grow the counter past the bucket capacity.
        breaker.record_failure("down.example");
        assert!(!breaker.allow("down.example"));
    }

    #[test]
    fn test_bucket_capacity_caps_counter() {
        // Capacity 4 with threshold 2: the counter saturates at 4, and a
        // single reset still fully closes the breaker.
        let breaker = Breaker::new(4, 2, Duration::from_secs(60));
        for _ in 0..10 {
            breaker.record_failure("down.example");
        }
        assert!(!breaker.allow("down.example"));
        breaker.reset_all();
        assert!(breaker.allow("down.example"));
        breaker.record_failure("down.example");
        assert!(breaker.allow("down.example"));
    }

    #[test]
    fn test_reset_closes_breaker() {
        let breaker = Breaker::new(10, 2, Duration::from_secs(60));
        breaker.record_failure("down.example");
        breaker.record_failure("down.example");
        assert!(!breaker.allow("down.example"));

        breaker.reset_all();
        assert!(breaker.allow("down.example"));
    }

    #[test]
    fn test_hosts_are_independent() {
        let breaker = Breaker::new(10, 1, Duration::from_secs(60));
        breaker.record_failure("a.example");
        assert!(!breaker.allow("a.example"));
        assert!(breaker.allow("b.example"));
    }

    #[test]
    fn test_zero_config_falls_back_to_defaults() {
        let breaker = Breaker::new(0, 0, Duration::from_secs(60));
        for _ in 0..DEFAULT_MAX_ERROR - 1 {
            breaker.record_failure("h.example");
        }
        assert!(breaker.allow("h.example"));
        breaker.record_failure("h.example");
        assert!(!breaker.allow("h.example"));
    }
}
