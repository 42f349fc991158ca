//! Resilience configuration: retry, rate-limit, and concurrency knobs for
//! the connection pool, assembled through the same builder shape used
//! elsewhere in this crate for layered defaults-plus-overrides config.

use std::time::Duration;

/// Global resilience configuration for pool-mediated operations.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyConfig {
    /// Degree of parallelism: the pool's bound on concurrently acquired
    /// clients.
    pub dop: usize,
    pub enabled: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 600,
            burst_capacity: 30,
            enabled: true,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            dop: 20,
            enabled: true,
        }
    }
}

impl ResilienceConfig {
    pub fn builder() -> ResilienceConfigBuilder {
        ResilienceConfigBuilder::new()
    }

    /// Conservative config for production migrations against a shared
    /// environment.
    pub fn conservative() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                ..RetryConfig::default()
            },
            rate_limit: RateLimitConfig {
                requests_per_minute: 300,
                burst_capacity: 15,
                enabled: true,
            },
            concurrency: ConcurrencyConfig {
                dop: 10,
                enabled: true,
            },
        }
    }

    /// No retry, no throttling — for deterministic tests.
    pub fn disabled() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 1,
                base_delay: Duration::from_millis(0),
                max_delay: Duration::from_millis(0),
                backoff_multiplier: 1.0,
                jitter: false,
            },
            rate_limit: RateLimitConfig {
                requests_per_minute: u32::MAX,
                burst_capacity: u32::MAX,
                enabled: false,
            },
            concurrency: ConcurrencyConfig {
                dop: usize::MAX,
                enabled: false,
            },
        }
    }
}

/// Builder for [`ResilienceConfig`].
#[derive(Debug, Default)]
pub struct ResilienceConfigBuilder {
    config: ResilienceConfig,
}

impl ResilienceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ResilienceConfig::default(),
        }
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn dop(mut self, dop: usize) -> Self {
        self.config.concurrency.dop = dop;
        self
    }

    pub fn requests_per_minute(mut self, rpm: u32) -> Self {
        self.config.rate_limit.requests_per_minute = rpm;
        self
    }

    pub fn build(self) -> ResilienceConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ResilienceConfig::default();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.rate_limit.requests_per_minute, 600);
        assert_eq!(config.concurrency.dop, 20);
    }

    #[test]
    fn builder_overrides_apply() {
        let config = ResilienceConfig::builder()
            .max_retries(2)
            .dop(8)
            .requests_per_minute(120)
            .build();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.concurrency.dop, 8);
        assert_eq!(config.rate_limit.requests_per_minute, 120);
    }

    #[test]
    fn disabled_config_has_no_limits() {
        let config = ResilienceConfig::disabled();
        assert_eq!(config.retry.max_attempts, 1);
        assert!(!config.rate_limit.enabled);
        assert!(!config.concurrency.enabled);
    }
}
