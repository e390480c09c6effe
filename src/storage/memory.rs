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
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::{StorageLockError, StorageLockResult};
use crate::storage::{LeaseRecord, LockStorage};
use crate::util::{num_milliseconds, system_now_millis};

/// In-process lease table.
///
/// Every primitive runs under one mutex, which makes the version comparison
/// atomic. The clock is anchored to the wall clock at construction and then
/// advanced with `tokio::time::Instant`, so paused-time tests see leases expire
/// on the virtual clock.
pub struct MemoryStorage {
    records: Mutex<HashMap<String, LeaseRecord>>,
    epoch_millis: i64,
    started_at: Instant,
    skew: AtomicU64,
    unavailable: AtomicBool,
    update_delay: Mutex<Option<(String, Duration)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            epoch_millis: system_now_millis().unwrap_or_default(),
            started_at: Instant::now(),
            skew: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            update_delay: Mutex::new(None),
        }
    }

    /// Simulate an outage: every primitive fails with `StorageUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Move the storage clock forward without waiting.
    pub fn advance_clock(&self, by: Duration) {
        self.skew.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stall every conditional update that writes a row owned by `owner_id`.
    pub fn delay_updates_for(&self, owner_id: &str, delay: Duration) {
        *self.update_delay.lock() = Some((owner_id.to_string(), delay));
    }

    pub fn clear_update_delay(&self) {
        self.update_delay.lock().take();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Overwrite a row without any version check. Test hook for crashed or rogue writers.
    pub fn force_put(&self, record: LeaseRecord) {
        self.records.lock().insert(record.lock_id.clone(), record);
    }

    fn clock(&self) -> i64 {
        self.epoch_millis
            + num_milliseconds(&self.started_at.elapsed())
            + self.skew.load(Ordering::SeqCst) as i64
    }

    fn check_available(&self) -> StorageLockResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageLockError::StorageUnavailable(
                "memory storage is marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStorage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn now_millis(&self) -> StorageLockResult<i64> {
        self.check_available()?;
        Ok(self.clock())
    }

    async fn try_insert(&self, lock_id: &str) -> StorageLockResult<bool> {
        self.check_available()?;
        let now = self.clock();
        let mut records = self.records.lock();
        if records.contains_key(lock_id) {
            return Ok(false);
        }
        records.insert(lock_id.to_string(), LeaseRecord::free(lock_id, now));
        Ok(true)
    }

    async fn conditional_update(
        &self,
        lock_id: &str,
        expected_version: u64,
        record: &LeaseRecord,
    ) -> StorageLockResult<bool> {
        let delay = self
            .update_delay
            .lock()
            .as_ref()
            .filter(|(owner_id, _)| *owner_id == record.owner_id)
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_available()?;
        let mut records = self.records.lock();
        match records.get_mut(lock_id) {
            Some(current) if current.version == expected_version => {
                *current = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read(&self, lock_id: &str) -> StorageLockResult<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.records.lock().get(lock_id).cloned())
    }

    async fn delete(&self, lock_id: &str, expected_version: u64) -> StorageLockResult<bool> {
        self.check_available()?;
        let mut records = self.records.lock();
        match records.get(lock_id) {
            Some(current) if current.version == expected_version => {
                records.remove(lock_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self) -> StorageLockResult<Vec<LeaseRecord>> {
        self.check_available()?;
        let mut records: Vec<LeaseRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        Ok(records)
    }
}
