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

use std::time::SystemTimeError;
use redis::RedisError;
use thiserror::Error;

pub type StorageLockResult<T> = std::result::Result<T, StorageLockError>;

#[derive(Error, Debug)]
pub enum StorageLockError {
    /// Transport, connectivity or query failure. Never used for a lost race.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Corrupt lease record: {0}")]
    CorruptRecord(String),

    #[error("System time error: {0}")]
    TimeError(#[from] SystemTimeError),

    #[error("Lock acquisition timeout")]
    TimeoutError,

    #[error("Lock acquisition cancelled")]
    Cancelled,

    #[error("Lock acquisition gave up after {0} attempts")]
    RetriesExhausted(u32),

    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Async runtime error: {0}")]
    AsyncError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StorageLockError {
    /// Whether the error came from the backend rather than from the lock protocol.
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            StorageLockError::StorageUnavailable(_) | StorageLockError::CorruptRecord(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StorageLockError::TimeoutError)
    }
}

impl From<RedisError> for StorageLockError {
    fn from(err: RedisError) -> Self {
        StorageLockError::StorageUnavailable(err.to_string())
    }
}

impl From<deadpool::managed::PoolError<RedisError>> for StorageLockError {
    fn from(err: deadpool::managed::PoolError<RedisError>) -> Self {
        StorageLockError::StorageUnavailable(err.to_string())
    }
}

impl From<deadpool::managed::BuildError> for StorageLockError {
    fn from(err: deadpool::managed::BuildError) -> Self {
        StorageLockError::ConfigError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageLockError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageLockError::AsyncError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageLockError {
    fn from(err: serde_json::Error) -> Self {
        StorageLockError::SerializationError(err.to_string())
    }
}
