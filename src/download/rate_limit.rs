//! Token-bucket bandwidth limiting for the download manager.

use tokio::time::{sleep, Duration, Instant};

/// A token bucket with capacity equal to the configured rate (one second's
/// worth of bytes), refilled continuously.
pub struct TokenBucket {
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u64) -> Self {
        Self { rate_per_sec: rate_per_sec as f64, tokens: rate_per_sec as f64, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        self.last_refill = now;
    }

    /// Waits until `n` bytes worth of tokens are available, then consumes
    /// them.
    pub async fn acquire(&mut self, n: u64) {
        loop {
            self.refill();
            if self.tokens >= n as f64 {
                self.tokens -= n as f64;
                return;
            }
            let deficit = n as f64 - self.tokens;
            let wait_secs = deficit / self.rate_per_sec;
            sleep(Duration::from_secs_f64(wait_secs.max(0.001))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_under_capacity_is_immediate() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        bucket.acquire(1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_over_capacity_waits() {
        let mut bucket = TokenBucket::new(1000);
        bucket.acquire(1000).await;
        let start = Instant::now();
        bucket.acquire(500).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
