//! Per-direction bandwidth limiting: a token bucket gating transfers, and a
//! sliding-window tracker reporting the instantaneous transfer speed.
pub mod speed;

pub use speed::SpeedTracker;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket with capacity equal to one second's worth of the configured
/// rate. A rate of zero means unlimited and short-circuits every check.
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    inner: Mutex<Inner>,
}

struct Inner {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let rate = rate_bytes_per_sec as f64;
        Self { rate_bytes_per_sec: rate, inner: Mutex::new(Inner { tokens: rate, last_refill: Instant::now() }) }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_bytes_per_sec == 0.0
    }

    /// Blocks until `bytes` worth of tokens are available, then consumes
    /// them. Unlimited buckets return immediately.
    pub async fn acquire(&self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }
        let bytes = bytes as f64;
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let elapsed = inner.last_refill.elapsed().as_secs_f64();
                inner.tokens = (inner.tokens + elapsed * self.rate_bytes_per_sec).min(self.rate_bytes_per_sec);
                inner.last_refill = Instant::now();

                if inner.tokens >= bytes {
                    inner.tokens -= bytes;
                    None
                } else {
                    let deficit = bytes - inner.tokens;
                    Some(deficit / self.rate_bytes_per_sec)
                }
            };
            match wait {
                None => return,
                Some(seconds) => tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn unlimited_bucket_never_waits() {
        let bucket = TokenBucket::new(0);
        let start = Instant::now();
        bucket.acquire(10_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn bucket_admits_a_transfer_within_capacity_immediately() {
        let bucket = TokenBucket::new(1024);
        let start = Instant::now();
        bucket.acquire(512).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_delays_a_transfer_exceeding_capacity() {
        let bucket = TokenBucket::new(100);
        bucket.acquire(100).await; // drain the initial full bucket
        let start = Instant::now();
        bucket.acquire(50).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
