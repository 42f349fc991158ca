//! Semaphore-based concurrency limiter enforcing the pool's degree of
//! parallelism (DOP).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::config::ConcurrencyConfig;

/// Bounds the number of clients concurrently acquired from the pool.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    config: ConcurrencyConfig,
    acquired: Arc<AtomicU64>,
    waited: Arc<AtomicU64>,
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let permits = if config.enabled {
            config.dop.max(1)
        } else {
            1_000_000
        };
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            acquired: Arc::new(AtomicU64::new(0)),
            waited: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Acquire a permit, suspending until one is free.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        if self.semaphore.available_permits() == 0 {
            self.waited.fetch_add(1, Ordering::Relaxed);
            debug!("concurrency limiter: waiting for a permit (dop={})", self.dop());
        }
        let permit = self.semaphore.clone().acquire_owned().await.unwrap();
        self.acquired.fetch_add(1, Ordering::Relaxed);
        permit
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                Some(permit)
            }
            Err(_) => None,
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn dop(&self) -> usize {
        self.config.dop
    }

    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            available_permits: self.available_permits(),
            dop: self.config.dop,
            acquired: self.acquired.load(Ordering::Relaxed),
            waited: self.waited.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyStats {
    pub available_permits: usize,
    pub dop: usize,
    pub acquired: u64,
    pub waited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limits_to_configured_dop() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig {
            dop: 2,
            enabled: true,
        });

        let p1 = limiter.try_acquire();
        let p2 = limiter.try_acquire();
        let p3 = limiter.try_acquire();

        assert!(p1.is_some());
        assert!(p2.is_some());
        assert!(p3.is_none());
    }

    #[tokio::test]
    async fn releasing_a_permit_frees_capacity() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig {
            dop: 1,
            enabled: true,
        });
        let p1 = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        drop(p1);
        assert!(limiter.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_a_released_permit() {
        let limiter = ConcurrencyLimiter::new(ConcurrencyConfig {
            dop: 1,
            enabled: true,
        });
        let permit = limiter.acquire().await;
        let limiter2 = limiter.clone();
        let handle = tokio::spawn(async move {
            let _p = limiter2.acquire().await;
        });
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        drop(permit);
        tokio::time::timeout(tokio::time::Duration::from_millis(200), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
