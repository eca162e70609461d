//! Quota windows and rate-limit buckets.
//!
//! Pure state machines over explicit timestamps; backends own the
//! persistence and atomicity. Buckets refill on read from elapsed time,
//! so no ticker is needed anywhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hoist_core::tenant::RatePolicy;

/// Traffic direction for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Enqueue,
    Dequeue,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Dequeue => "dequeue",
        }
    }
}

/// Rolling window counter over a fixed set of buckets.
///
/// An hour window uses 60 one-minute buckets, a day window 24 one-hour
/// buckets. Advancing zeroes buckets that fell out of the window, so the
/// sum is the count over the trailing window within one bucket's
/// resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowCounter {
    bucket_secs: i64,
    buckets: Vec<u64>,
    /// Absolute bucket index of the most recent increment.
    cursor: i64,
}

impl WindowCounter {
    pub fn hourly() -> Self {
        Self::new(60, 60)
    }

    pub fn daily() -> Self {
        Self::new(3_600, 24)
    }

    pub fn new(bucket_secs: i64, bucket_count: usize) -> Self {
        Self {
            bucket_secs,
            buckets: vec![0; bucket_count],
            cursor: 0,
        }
    }

    fn advance(&mut self, now: DateTime<Utc>) -> usize {
        let abs = now.timestamp().div_euclid(self.bucket_secs);
        let len = self.buckets.len() as i64;
        if abs > self.cursor {
            let stale = (abs - self.cursor).min(len);
            for i in 0..stale {
                let idx = ((self.cursor + 1 + i).rem_euclid(len)) as usize;
                self.buckets[idx] = 0;
            }
            self.cursor = abs;
        }
        (abs.rem_euclid(len)) as usize
    }

    pub fn incr(&mut self, now: DateTime<Utc>, n: u64) {
        let idx = self.advance(now);
        self.buckets[idx] += n;
    }

    pub fn sum(&mut self, now: DateTime<Utc>) -> u64 {
        self.advance(now);
        self.buckets.iter().sum()
    }
}

/// Token bucket with elapsed-time refill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenBucket {
    tokens: f64,
    last_refill_ms: i64,
}

impl TokenBucket {
    pub fn full(policy: &RatePolicy, now: DateTime<Utc>) -> Self {
        Self {
            tokens: policy.burst.max(1) as f64,
            last_refill_ms: now.timestamp_millis(),
        }
    }

    /// Take `n` tokens, refilling from elapsed time first. On exhaustion
    /// returns the time until enough tokens accrue.
    pub fn try_take(
        &mut self,
        policy: &RatePolicy,
        now: DateTime<Utc>,
        n: f64,
    ) -> Result<(), u64> {
        if policy.is_unlimited() {
            return Ok(());
        }
        let cap = policy.burst.max(1) as f64;
        let rate_per_ms = policy.rps as f64 / 1_000.0;
        let now_ms = now.timestamp_millis();
        let elapsed = (now_ms - self.last_refill_ms).max(0) as f64;
        self.tokens = (self.tokens + elapsed * rate_per_ms).min(cap);
        self.last_refill_ms = now_ms;

        if self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            let deficit = n - self.tokens;
            Err((deficit / rate_per_ms).ceil() as u64)
        }
    }
}

/// Per-tenant rolling usage, kept by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantUsage {
    pub hour: WindowCounter,
    pub day: WindowCounter,
    pub storage_bytes: u64,
}

impl Default for TenantUsage {
    fn default() -> Self {
        Self {
            hour: WindowCounter::hourly(),
            day: WindowCounter::daily(),
            storage_bytes: 0,
        }
    }
}

/// Soft-threshold fraction at which quota warnings are emitted.
pub const QUOTA_WARN_FRACTION: f64 = 0.8;

/// True when `used` crosses the warning threshold for `limit`.
pub fn at_soft_threshold(used: u64, limit: u64) -> bool {
    limit > 0 && (used as f64) >= (limit as f64) * QUOTA_WARN_FRACTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn window_counts_within_the_window() {
        let mut w = WindowCounter::hourly();
        w.incr(at(0), 5);
        w.incr(at(120), 3);
        assert_eq!(w.sum(at(130)), 8);
    }

    #[test]
    fn window_forgets_old_buckets() {
        let mut w = WindowCounter::hourly();
        w.incr(at(0), 5);
        // 61 minutes later the first bucket has rolled out.
        assert_eq!(w.sum(at(61 * 60)), 0);
    }

    #[test]
    fn window_partial_expiry() {
        let mut w = WindowCounter::new(60, 3);
        w.incr(at(0), 1);
        w.incr(at(60), 2);
        w.incr(at(120), 4);
        assert_eq!(w.sum(at(125)), 7);
        // Advancing one bucket drops the oldest.
        assert_eq!(w.sum(at(185)), 6);
    }

    #[test]
    fn bucket_enforces_rate() {
        let policy = RatePolicy::new(10, 2);
        let mut b = TokenBucket::full(&policy, at(0));
        assert!(b.try_take(&policy, at(0), 1.0).is_ok());
        assert!(b.try_take(&policy, at(0), 1.0).is_ok());
        let wait = b.try_take(&policy, at(0), 1.0).unwrap_err();
        assert_eq!(wait, 100); // 1 token at 10 rps

        // After the wait the take succeeds.
        assert!(b
            .try_take(&policy, at(0) + chrono::Duration::milliseconds(100), 1.0)
            .is_ok());
    }

    #[test]
    fn unlimited_policy_never_throttles() {
        let policy = RatePolicy::default();
        let mut b = TokenBucket::full(&policy, at(0));
        for _ in 0..10_000 {
            assert!(b.try_take(&policy, at(0), 1.0).is_ok());
        }
    }

    #[test]
    fn soft_threshold() {
        assert!(!at_soft_threshold(79, 100));
        assert!(at_soft_threshold(80, 100));
        assert!(!at_soft_threshold(5, 0));
    }
}
