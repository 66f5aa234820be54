/// Token bucket rate limiting for connection accepts and client messages
use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter.
///
/// Refills continuously at `rate` tokens per second up to `burst`. Each
/// `allow` spends one token.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Option<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate,
            burst,
            bucket: Some(Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Rate `r` per second with a burst of `r`
    pub fn per_second(rate: f64) -> Self {
        Self::new(rate, rate.ceil() as u32)
    }

    /// A limiter that never rejects
    pub fn unlimited() -> Self {
        Self {
            rate: f64::INFINITY,
            burst: f64::INFINITY,
            bucket: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let Some(bucket) = &self.bucket else {
            return true;
        };

        let mut bucket = bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
