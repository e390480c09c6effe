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
use std::sync::Arc;
use async_trait::async_trait;
use tracing::debug;

use crate::config::RedisStorageConfig;
use crate::connection::RedisConnectionManager;
use crate::errors::StorageLockResult;
use crate::scripts;
use crate::storage::{LeaseRecord, LockStorage};

/// Lease table kept in Redis, one hash per lock id under `key_prefix`.
///
/// Insert, conditional update and conditional delete are Lua scripts, so the
/// version comparison and the write happen in one server-side step.
pub struct RedisStorage {
    connection_manager: Arc<RedisConnectionManager>,
    key_prefix: String,
}

impl RedisStorage {
    pub fn new(config: &RedisStorageConfig) -> StorageLockResult<Self> {
        let connection_manager = Arc::new(RedisConnectionManager::new(config)?);
        Ok(Self::from_connection_manager(connection_manager, &config.key_prefix))
    }

    pub fn from_url(url: &str) -> StorageLockResult<Self> {
        Self::new(&RedisStorageConfig::from_url(url))
    }

    /// Build on an existing pool, sharing its connections.
    pub fn from_connection_manager(connection_manager: Arc<RedisConnectionManager>, key_prefix: &str) -> Self {
        Self {
            connection_manager,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn connection_manager(&self) -> &Arc<RedisConnectionManager> {
        &self.connection_manager
    }

    fn key(&self, lock_id: &str) -> String {
        format!("{}{}", self.key_prefix, lock_id)
    }

    async fn read_key(&self, key: &str, lock_id: &str) -> StorageLockResult<Option<LeaseRecord>> {
        let mut conn = self.connection_manager.get_connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        LeaseRecord::from_fields(lock_id, &fields).map(Some)
    }
}

#[async_trait]
impl LockStorage for RedisStorage {
    fn name(&self) -> &str {
        "redis"
    }

    async fn init(&self) -> StorageLockResult<()> {
        let mut conn = self.connection_manager.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        debug!(url = %self.connection_manager.url(), prefix = %self.key_prefix, "redis lease storage ready");
        Ok(())
    }

    async fn now_millis(&self) -> StorageLockResult<i64> {
        let mut conn = self.connection_manager.get_connection().await?;
        let (secs, micros): (i64, i64) = redis::cmd("TIME").query_async(&mut *conn).await?;
        Ok(secs * 1_000 + micros / 1_000)
    }

    async fn try_insert(&self, lock_id: &str) -> StorageLockResult<bool> {
        let now = self.now_millis().await?;
        let mut conn = self.connection_manager.get_connection().await?;
        let inserted: i64 = scripts::TRY_INSERT_SCRIPT
            .key(self.key(lock_id))
            .arg(lock_id)
            .arg(now)
            .invoke_async(&mut *conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn conditional_update(
        &self,
        lock_id: &str,
        expected_version: u64,
        record: &LeaseRecord,
    ) -> StorageLockResult<bool> {
        let mut conn = self.connection_manager.get_connection().await?;
        let mut invocation = scripts::CONDITIONAL_UPDATE_SCRIPT.key(self.key(lock_id));
        invocation.arg(expected_version.to_string());
        for (_, value) in record.to_fields() {
            invocation.arg(value);
        }
        let updated: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(updated == 1)
    }

    async fn read(&self, lock_id: &str) -> StorageLockResult<Option<LeaseRecord>> {
        self.read_key(&self.key(lock_id), lock_id).await
    }

    async fn delete(&self, lock_id: &str, expected_version: u64) -> StorageLockResult<bool> {
        let mut conn = self.connection_manager.get_connection().await?;
        let deleted: i64 = scripts::CONDITIONAL_DELETE_SCRIPT
            .key(self.key(lock_id))
            .arg(expected_version.to_string())
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn list(&self) -> StorageLockResult<Vec<LeaseRecord>> {
        let pattern = format!("{}*", self.key_prefix);
        let mut keys = Vec::new();
        {
            let mut conn = self.connection_manager.get_connection().await?;
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut *conn)
                    .await?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let lock_id = key.strip_prefix(self.key_prefix.as_str()).unwrap_or(key.as_str()).to_string();
            if let Some(record) = self.read_key(&key, &lock_id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.lock_id.cmp(&b.lock_id));
        Ok(records)
    }

    async fn close(&self) -> StorageLockResult<()> {
        self.connection_manager.close();
        Ok(())
    }
}
