//! Shared bandwidth limiter.
//!
//! A token bucket measured in bytes. Every chunk worker of every file in
//! the session draws from the same bucket, so the cap applies to the
//! aggregate outbound throughput. The burst capacity is one second's
//! worth of tokens.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// A token bucket rate limiter shared across download tasks.
pub struct RateLimiter {
    state: Mutex<TokenBucket>,
}

struct TokenBucket {
    /// Maximum number of tokens (bytes) the bucket can hold.
    capacity: u64,
    /// Tokens currently available.
    tokens: u64,
    /// Refill rate in tokens per second.
    rate: u64,
    /// Last refill instant.
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `rate_bytes_per_sec` bytes per second,
    /// with a burst of one second's worth.
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = rate_bytes_per_sec.max(1);
        Self {
            state: Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                rate: rate_bytes_per_sec.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `amount` tokens from the bucket, sleeping until enough have
    /// accumulated. Requests larger than the burst capacity are clamped so
    /// they can always eventually be served.
    pub async fn acquire(&self, amount: u64) {
        if amount == 0 {
            return;
        }

        loop {
            let mut bucket = self.state.lock().await;
            bucket.refill();

            let amount = amount.min(bucket.capacity);
            if bucket.tokens >= amount {
                bucket.tokens -= amount;
                return;
            }

            let needed = amount - bucket.tokens;
            let wait = Duration::from_secs_f64(needed as f64 / bucket.rate as f64);

            // The lock must not be held across the sleep.
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let new_tokens = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_refill = now;
        }
    }
}
