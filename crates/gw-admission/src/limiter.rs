//! Sliding-window request limiter and in-flight concurrency limiter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const MAX_KEYS: usize = 100_000;
const EVICT_BATCH: usize = 1_000;

/// Outcome of a `record` call, carrying the metadata a response needs
/// regardless of whether the request was allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: u64,
}

struct Bucket {
    timestamps: VecDeque<Instant>,
}

/// A per-key sliding-window request counter.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn prune(bucket: &mut Bucket, now: Instant, window: Duration) {
        while let Some(front) = bucket.timestamps.front() {
            if now.duration_since(*front) > window {
                bucket.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn outcome_for(&self, bucket: &Bucket, now: Instant, allowed: bool) -> LimitOutcome {
        let count = bucket.timestamps.len() as u32;
        let remaining = self.limit.saturating_sub(count);
        let reset_ms = match bucket.timestamps.front() {
            Some(oldest) => (*oldest + self.window)
                .saturating_duration_since(now)
                .as_millis() as u64,
            None => self.window.as_millis() as u64,
        };
        LimitOutcome {
            allowed,
            limit: self.limit,
            remaining,
            reset_ms,
        }
    }

    /// Reports current usage for `key` without mutating it.
    pub fn check(&self, key: &str) -> LimitOutcome {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(key) {
            Some(bucket) => {
                Self::prune(bucket, now, self.window);
                let allowed = (bucket.timestamps.len() as u32) < self.limit;
                self.outcome_for(bucket, now, allowed)
            }
            None => LimitOutcome {
                allowed: true,
                limit: self.limit,
                remaining: self.limit,
                reset_ms: self.window.as_millis() as u64,
            },
        }
    }

    /// Prunes expired timestamps for `key`, then admits or rejects `now`.
    pub fn record(&self, key: &str) -> LimitOutcome {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        self.enforce_cap(&mut buckets, now);

        let bucket = buckets
            .entry(key.to_owned())
            .or_insert_with(|| Bucket {
                timestamps: VecDeque::new(),
            });
        Self::prune(bucket, now, self.window);

        if bucket.timestamps.len() as u32 >= self.limit {
            return self.outcome_for(bucket, now, false);
        }
        bucket.timestamps.push_back(now);
        self.outcome_for(bucket, now, true)
    }

    /// Bounds total key-space memory. Prunes everything first; if still
    /// over cap, evicts the oldest `EVICT_BATCH` keys by insertion order.
    fn enforce_cap(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) {
        if buckets.len() < MAX_KEYS {
            return;
        }
        for bucket in buckets.values_mut() {
            Self::prune(bucket, now, self.window);
        }
        if buckets.len() >= MAX_KEYS {
            let victims: Vec<String> = buckets.keys().take(EVICT_BATCH).cloned().collect();
            for key in victims {
                buckets.remove(&key);
            }
        }
    }
}

/// A per-key in-flight request counter with a fixed cap.
pub struct ConcurrencyLimiter {
    cap: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl ConcurrencyLimiter {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `false` without mutating state when `key` is already at cap.
    pub fn acquire(&self, key: &str) -> bool {
        let mut counts = self.counts.lock();
        let entry = counts.entry(key.to_owned()).or_insert(0);
        if *entry >= self.cap {
            return false;
        }
        *entry += 1;
        true
    }

    /// Decrements the counter for `key`, removing the entry at zero.
    /// A no-op if `key` is absent.
    pub fn release(&self, key: &str) {
        let mut counts = self.counts.lock();
        if let Some(entry) = counts.get_mut(key) {
            *entry -= 1;
            if *entry == 0 {
                counts.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_admits_up_to_limit_then_rejects() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.record("a").allowed);
        assert!(limiter.record("a").allowed);
        let third = limiter.record("a");
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[test]
    fn sliding_window_tracks_keys_independently() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.record("a").allowed);
        assert!(limiter.record("b").allowed);
    }

    #[test]
    fn check_does_not_mutate() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").allowed);
        assert!(limiter.check("a").allowed);
        assert!(limiter.record("a").allowed);
        assert!(!limiter.check("a").allowed);
    }

    #[test]
    fn concurrency_limiter_enforces_cap_and_releases() {
        let limiter = ConcurrencyLimiter::new(1);
        assert!(limiter.acquire("k"));
        assert!(!limiter.acquire("k"));
        limiter.release("k");
        assert!(limiter.acquire("k"));
    }

    #[test]
    fn concurrency_release_on_absent_key_is_noop() {
        let limiter = ConcurrencyLimiter::new(1);
        limiter.release("missing");
        assert!(limiter.acquire("missing"));
    }
}
