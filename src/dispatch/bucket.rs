//! Per-endpoint token-bucket admission.
//!
//! Lazy refill-on-take with burst headroom, plus a coarse per-minute window
//! counter kept only for the status view. Admission decisions use the
//! continuous bucket alone. The mutex never wraps any I/O.

use super::state::UnixNanos;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;
const NANOS_PER_MIN: i64 = 60 * 1_000_000_000;

#[derive(Debug)]
pub struct TokenBucket {
    rate_per_min: i32,
    burst: i32,
    inner: Mutex<BucketInner>,
    // Minute window, observability only.
    window_start_min: AtomicI64,
    window_count: AtomicI64,
}

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last_refill: UnixNanos,
}

impl TokenBucket {
    /// Bucket starts full.
    pub fn new(rate_per_min: i32, burst: i32, now: UnixNanos) -> Self {
        let bucket = Self {
            rate_per_min,
            burst,
            inner: Mutex::new(BucketInner {
                tokens: 0.0,
                last_refill: now,
            }),
            window_start_min: AtomicI64::new(0),
            window_count: AtomicI64::new(0),
        };
        bucket.inner.lock().unwrap_or_else(|e| e.into_inner()).tokens = bucket.capacity();
        bucket
    }

    /// `rate + burst`, falling back to `rate` when burst is non-positive,
    /// floored at zero.
    pub fn capacity(&self) -> f64 {
        let capacity = (self.rate_per_min + self.burst) as f64;
        let capacity = if capacity <= 0.0 {
            self.rate_per_min as f64
        } else {
            capacity
        };
        capacity.max(0.0)
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.rate_per_min as f64 / 60.0
    }

    /// Refill for the elapsed time, then take one token. A zero rate admits
    /// unconditionally without touching the bucket.
    pub fn try_take(&self, now: UnixNanos) -> bool {
        if self.rate_per_min <= 0 {
            return true;
        }
        let capacity = self.capacity();
        let refill_per_sec = self.refill_per_sec();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if refill_per_sec > 0.0 {
            let elapsed_secs = (now - inner.last_refill) as f64 / NANOS_PER_SEC;
            if elapsed_secs > 0.0 {
                inner.tokens = (inner.tokens + elapsed_secs * refill_per_sec).min(capacity);
                inner.last_refill = now;
            }
        }

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Bump the minute window after an admitted take; the counter is
    /// replaced, not accumulated, when the minute rolls over.
    pub fn bump_window(&self, now: UnixNanos) {
        let now_min = now / NANOS_PER_MIN;
        if self.window_start_min.load(Ordering::Acquire) != now_min {
            self.window_start_min.store(now_min, Ordering::Release);
            self.window_count.store(0, Ordering::Release);
        }
        self.window_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn tokens_remaining(&self) -> f64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).tokens
    }

    /// (window start in unix minutes, admitted count in that window)
    pub fn window(&self) -> (i64, i64) {
        (
            self.window_start_min.load(Ordering::Acquire),
            self.window_count.load(Ordering::Acquire),
        )
    }
}
