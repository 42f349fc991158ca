//! Token-bucket rate limiter guarding the pool's request rate, independent
//! of the concurrency limiter's in-flight bound.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::config::RateLimitConfig;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Limits the rate of requests issued through the pool to
/// `requests_per_minute`, allowing bursts up to `burst_capacity`.
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.burst_capacity as f64;
        Self {
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    fn refill_rate_per_sec(&self) -> f64 {
        self.config.requests_per_minute as f64 / 60.0
    }

    /// Suspends until a token is available, then consumes one.
    pub async fn acquire(&self) {
        if !self.config.enabled {
            return;
        }
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_rate_per_sec())
                    .min(self.config.burst_capacity as f64);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_rate_per_sec()))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let bucket = self.bucket.lock().unwrap();
        RateLimiterStats {
            tokens_available: bucket.tokens,
            burst_capacity: self.config.burst_capacity,
            enabled: self.config.enabled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub tokens_available: f64,
    pub burst_capacity: u32,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 1,
            burst_capacity: 1,
            enabled: false,
        });
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn burst_capacity_is_consumed_immediately() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst_capacity: 5,
            enabled: true,
        });
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(limiter.stats().tokens_available < 1.0);
    }
}
