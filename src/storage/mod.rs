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
mod memory;
mod redis_storage;

pub use memory::*;
pub use redis_storage::*;

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{StorageLockError, StorageLockResult};
use crate::util::system_now_millis;

/// One row of the lease table.
///
/// `version` is the fencing token: every successful write through
/// [`LockStorage::conditional_update`] must carry a larger version than the
/// row it replaced. Timestamps are epoch milliseconds on the storage clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub lock_id: String,
    /// Empty when the lease is free
    pub owner_id: String,
    pub version: u64,
    /// Reentry depth of the current owner
    pub lock_count: u32,
    pub expire_at: i64,
    pub updated_at: i64,
}

impl LeaseRecord {
    /// The row `try_insert` creates: nobody holds it, version zero.
    pub fn free(lock_id: &str, now: i64) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            owner_id: String::new(),
            version: 0,
            lock_count: 0,
            expire_at: 0,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expire_at
    }

    /// Free either explicitly or because the lease ran out.
    pub fn is_free(&self, now: i64) -> bool {
        self.owner_id.is_empty() || self.is_expired(now)
    }

    pub fn is_held_by(&self, owner_id: &str, now: i64) -> bool {
        !self.owner_id.is_empty() && self.owner_id == owner_id && !self.is_expired(now)
    }

    pub fn remaining(&self, now: i64) -> Duration {
        if self.is_free(now) {
            Duration::ZERO
        } else {
            Duration::from_millis((self.expire_at - now) as u64)
        }
    }

    pub(crate) fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("lock_id", self.lock_id.clone()),
            ("owner_id", self.owner_id.clone()),
            ("version", self.version.to_string()),
            ("lock_count", self.lock_count.to_string()),
            ("expire_at", self.expire_at.to_string()),
            ("updated_at", self.updated_at.to_string()),
        ]
    }

    /// Decode a row stored as a flat field map. Missing numeric fields are a schema error.
    pub(crate) fn from_fields(lock_id: &str, fields: &HashMap<String, String>) -> StorageLockResult<Self> {
        fn number<T: std::str::FromStr>(
            fields: &HashMap<String, String>,
            name: &str,
        ) -> StorageLockResult<T> {
            fields
                .get(name)
                .and_then(|value| value.parse::<T>().ok())
                .ok_or_else(|| StorageLockError::CorruptRecord(format!("missing or invalid field '{}'", name)))
        }

        Ok(Self {
            lock_id: fields.get("lock_id").cloned().unwrap_or_else(|| lock_id.to_string()),
            owner_id: fields.get("owner_id").cloned().unwrap_or_default(),
            version: number(fields, "version")?,
            lock_count: number(fields, "lock_count")?,
            expire_at: number(fields, "expire_at")?,
            updated_at: number(fields, "updated_at")?,
        })
    }
}

/// The four primitives every lease backend provides, plus its clock.
///
/// Contention is never an error: a lost race comes back as `Ok(false)`.
/// `Err` is reserved for the backend being unreachable or broken.
#[async_trait]
pub trait LockStorage: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &str;

    /// Prepare the lease table. Called once when a factory is built.
    async fn init(&self) -> StorageLockResult<()> {
        Ok(())
    }

    /// Current time on the storage clock, epoch milliseconds.
    async fn now_millis(&self) -> StorageLockResult<i64> {
        system_now_millis()
    }

    /// Insert a free row if none exists. At most one concurrent caller gets `true`.
    async fn try_insert(&self, lock_id: &str) -> StorageLockResult<bool>;

    /// Replace the row iff its stored version equals `expected_version`.
    async fn conditional_update(
        &self,
        lock_id: &str,
        expected_version: u64,
        record: &LeaseRecord,
    ) -> StorageLockResult<bool>;

    async fn read(&self, lock_id: &str) -> StorageLockResult<Option<LeaseRecord>>;

    /// Delete the row iff its stored version equals `expected_version`.
    async fn delete(&self, lock_id: &str, expected_version: u64) -> StorageLockResult<bool>;

    async fn list(&self) -> StorageLockResult<Vec<LeaseRecord>>;

    async fn close(&self) -> StorageLockResult<()> {
        Ok(())
    }
}
