/*
 *
 *  *
 *  *      Copyright (c) 2018-2025, SnackCloud All rights reserved.
 *  *
 *  *   Redistribution and use in source and binary forms, with or without
 *  *   modification, are permitted provided that the following conditions are met:
 *  *
 *  *   Redistributions of source code must retain the above copyright notice,
 *  *   this list of conditions and the following disclaimer.
 *  *   Redistributions in binary form must reproduce the above copyright
 *  *   notice, this list of conditions and the following disclaimer in the
 *  *   documentation and/or other materials provided with the distribution.
 *  *   Neither the name of the www.snackcloud.cn developer nor the names of its
 *  *   contributors may be used to endorse or promote products derived from
 *  *   this software without specific prior written permission.
 *  *   Author: SnackCloud
 *  *
 *
 */
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{StorageLockError, StorageLockResult};

pub const DEFAULT_LEASE_EXPIRE_AFTER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_KEY_PREFIX: &str = "storage_lock:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategyConfig {
    Linear,
    Exponential,
    Fixed,
}

impl Default for BackoffStrategyConfig {
    fn default() -> Self {
        Self::Exponential
    }
}

/// How a contender waits between acquisition attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategyConfig,
    pub initial_backoff: Duration,
    /// Upper bound for a single pause. Clamped to the refresh interval by the engine.
    pub max_backoff: Duration,
    /// Random spread added to or removed from each pause
    pub jitter: Duration,
    /// Optional cap on attempts; the deadline always applies.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategyConfig::Exponential,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            jitter: Duration::from_millis(20),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategyConfig::Fixed,
            initial_backoff: delay,
            max_backoff: delay,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Pause before attempt `attempt + 1`, before jitter. `attempt` starts at 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let step = attempt.max(1) - 1;
        let delay = match self.strategy {
            BackoffStrategyConfig::Fixed => self.initial_backoff,
            BackoffStrategyConfig::Linear => self.initial_backoff.saturating_mul(step + 1),
            BackoffStrategyConfig::Exponential => {
                self.initial_backoff.saturating_mul(2u32.saturating_pow(step.min(16)))
            }
        };
        delay.min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLockOptions {
    /// Name of the guarded resource, the row key in storage
    pub lock_id: String,
    /// Lease length granted on every acquire and renew
    pub lease_expire_after: Duration,
    /// Renewal period, strictly shorter than the lease
    pub lease_refresh_interval: Duration,
    /// Default deadline for `lock`
    pub wait_timeout: Duration,
    /// Bound on a single renew round trip. Defaults to the refresh interval, capped
    /// at half of the slack between refresh and expiry.
    pub renew_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl Default for StorageLockOptions {
    fn default() -> Self {
        Self {
            lock_id: String::new(),
            lease_expire_after: DEFAULT_LEASE_EXPIRE_AFTER,
            lease_refresh_interval: DEFAULT_LEASE_REFRESH_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            renew_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl StorageLockOptions {
    pub fn new(lock_id: &str) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> StorageLockResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_lock_id(mut self, lock_id: &str) -> Self {
        self.lock_id = lock_id.to_string();
        self
    }

    pub fn with_lease_expire_after(mut self, lease: Duration) -> Self {
        self.lease_expire_after = lease;
        self
    }

    pub fn with_lease_refresh_interval(mut self, interval: Duration) -> Self {
        self.lease_refresh_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_renew_timeout(mut self, timeout: Duration) -> Self {
        self.renew_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn effective_renew_timeout(&self) -> Duration {
        self.renew_timeout.unwrap_or_else(|| {
            let slack = self.lease_expire_after.saturating_sub(self.lease_refresh_interval);
            self.lease_refresh_interval.min(slack / 2)
        })
    }

    pub fn validate(&self) -> StorageLockResult<()> {
        if self.lock_id.is_empty() {
            return Err(StorageLockError::ConfigError("Lock id cannot be empty".to_string()));
        }
        if self.lease_expire_after.is_zero() {
            return Err(StorageLockError::ConfigError(
                "Lease expire time cannot be zero".to_string(),
            ));
        }
        if self.lease_refresh_interval.is_zero() {
            return Err(StorageLockError::ConfigError(
                "Lease refresh interval cannot be zero".to_string(),
            ));
        }
        if self.lease_refresh_interval >= self.lease_expire_after {
            return Err(StorageLockError::ConfigError(format!(
                "Lease refresh interval {:?} must be shorter than the lease {:?}",
                self.lease_refresh_interval, self.lease_expire_after
            )));
        }
        // A renew that starts on the tick has to settle before the lease runs out
        let renew_timeout = self.effective_renew_timeout();
        if renew_timeout.is_zero() {
            return Err(StorageLockError::ConfigError(
                "Renew timeout cannot be zero".to_string(),
            ));
        }
        if self.lease_refresh_interval.saturating_add(renew_timeout) >= self.lease_expire_after {
            return Err(StorageLockError::ConfigError(format!(
                "Lease refresh interval {:?} plus renew timeout {:?} must be shorter than the lease {:?}",
                self.lease_refresh_interval, renew_timeout, self.lease_expire_after
            )));
        }
        if self.retry.initial_backoff.is_zero() {
            return Err(StorageLockError::ConfigError(
                "Initial backoff cannot be zero".to_string(),
            ));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(StorageLockError::ConfigError(
                "Max backoff cannot be smaller than the initial backoff".to_string(),
            ));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(StorageLockError::ConfigError(
                "Max attempts must be at least one".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection settings for the Redis-backed lease table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStorageConfig {
    pub url: String,
    /// Prefix of every lease key, the "table name"
    pub key_prefix: String,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            pool_size: 8,
            connection_timeout: Duration::from_secs(3),
        }
    }
}

impl RedisStorageConfig {
    pub fn from_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}
