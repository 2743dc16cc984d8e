//! Per-source token bucket.
//!
//! Refills continuously at `base_rate` tokens/second up to a `max_rate`
//! ceiling, and starts full so a freshly configured source gets its burst.
//! Denial is not an error: the caller skips the source for this tick.

use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    base_rate: u32,
    max_rate: u32,
    tokens: f64,
    last_refill: Instant,
}

pub struct Limiter {
    bucket: Mutex<Bucket>,
}

fn normalize(base_rate: u32, max_rate: u32) -> (u32, u32) {
    let base = base_rate.max(1);
    let max = max_rate.max(base);
    (base, max)
}

impl Limiter {
    pub fn new(base_rate: u32, max_rate: u32) -> Self {
        let (base, max) = normalize(base_rate, max_rate);
        Self {
            bucket: Mutex::new(Bucket {
                base_rate: base,
                max_rate: max,
                tokens: f64::from(max),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(b.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            b.tokens = (b.tokens + elapsed * f64::from(b.base_rate)).min(f64::from(b.max_rate));
            b.last_refill = now;
        }

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            return true;
        }
        false
    }

    /// Hot-update the rates; stored tokens are clamped to the new ceiling.
    pub fn update(&self, base_rate: u32, max_rate: u32) {
        let (base, max) = normalize(base_rate, max_rate);
        let mut b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        b.base_rate = base;
        b.max_rate = max;
        b.tokens = b.tokens.min(f64::from(max));
    }

    /// Current rates, for status views.
    pub fn snapshot(&self) -> (u32, u32) {
        let b = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        (b.base_rate, b.max_rate)
    }
}
