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
use deadpool::managed::Metrics;
use deadpool::Runtime;
use redis::aio::MultiplexedConnection;
use redis::{Client, IntoConnectionInfo};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::RedisStorageConfig;
use crate::errors::{StorageLockError, StorageLockResult};

type RedisPool = deadpool::managed::Pool<RedisPoolManager>;

/// A pooled multiplexed connection, usable wherever `redis::aio::ConnectionLike` is expected
pub type PooledConnection = deadpool::managed::Object<RedisPoolManager>;

pub struct RedisPoolManager {
    client: Client,
}

#[async_trait::async_trait]
impl deadpool::managed::Manager for RedisPoolManager {
    type Type = MultiplexedConnection;
    type Error = redis::RedisError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(&self, conn: &mut Self::Type, _metrics: &Metrics) -> deadpool::managed::RecycleResult<Self::Error> {
        // Check that the connection is still valid
        match redis::cmd("PING").query_async::<String>(conn).await {
            Ok(pong) if pong == "PONG" => Ok(()),
            Ok(_) => Err(deadpool::managed::RecycleError::Message("Invalid PONG response".into())),
            Err(e) => Err(deadpool::managed::RecycleError::Backend(e)),
        }
    }
}

/// Owns the connection pool of one Redis endpoint. Shared by every lock built on it.
pub struct RedisConnectionManager {
    url: String,
    pool: RedisPool,
    is_closed: AtomicBool,
}

impl RedisConnectionManager {
    pub fn new(config: &RedisStorageConfig) -> StorageLockResult<Self> {
        Self::validate_config(config)?;

        let conn_info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| StorageLockError::ConfigError(format!("invalid redis url: {}", e)))?;
        let client = Client::open(conn_info)?;

        let pool = deadpool::managed::Pool::builder(RedisPoolManager { client })
            .max_size(config.pool_size as usize)
            .timeouts(deadpool::managed::Timeouts {
                wait: Some(config.connection_timeout),
                create: Some(config.connection_timeout),
                recycle: Some(Duration::from_secs(5)),
            })
            .runtime(Runtime::Tokio1)
            .build()?;

        debug!(url = %config.url, pool_size = config.pool_size, "redis connection pool created");

        Ok(Self {
            url: config.url.clone(),
            pool,
            is_closed: AtomicBool::new(false),
        })
    }

    fn validate_config(config: &RedisStorageConfig) -> StorageLockResult<()> {
        if config.url.is_empty() {
            return Err(StorageLockError::ConfigError("Redis url cannot be empty".to_string()));
        }
        if config.pool_size == 0 {
            return Err(StorageLockError::ConfigError("Pool size cannot be zero".to_string()));
        }
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn get_connection(&self) -> StorageLockResult<PooledConnection> {
        if self.is_closed.load(Ordering::Acquire) {
            return Err(StorageLockError::StorageUnavailable(
                "Connection manager is closed".to_string(),
            ));
        }
        Ok(self.pool.get().await?)
    }

    pub fn close(&self) {
        if !self.is_closed.swap(true, Ordering::AcqRel) {
            self.pool.close();
            debug!(url = %self.url, "redis connection pool closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }
}
