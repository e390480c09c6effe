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
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::StorageLockOptions;
use crate::errors::StorageLockResult;
use crate::lock::StorageLock;
use crate::storage::LockStorage;

/// Builds engines that share one initialized storage backend.
pub struct StorageLockFactory {
    storage: Arc<dyn LockStorage>,
    default_options: StorageLockOptions,
}

impl StorageLockFactory {
    /// Initializes the storage once; every lock created afterwards reuses it.
    pub async fn new(storage: Arc<dyn LockStorage>) -> StorageLockResult<Self> {
        storage.init().await?;
        info!(storage = %storage.name(), "lock storage initialized");
        Ok(Self {
            storage,
            default_options: StorageLockOptions::default(),
        })
    }

    /// Template for [`create_lock`](Self::create_lock). Its `lock_id` is ignored.
    pub fn with_default_options(mut self, options: StorageLockOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn default_options(&self) -> &StorageLockOptions {
        &self.default_options
    }

    pub fn storage(&self) -> &Arc<dyn LockStorage> {
        &self.storage
    }

    pub fn create_lock(&self, lock_id: &str) -> StorageLockResult<StorageLock> {
        self.create_lock_with_options(self.default_options.clone().with_lock_id(lock_id))
    }

    pub fn create_lock_with_options(&self, options: StorageLockOptions) -> StorageLockResult<StorageLock> {
        debug!(lock_id = %options.lock_id, storage = %self.storage.name(), "creating lock");
        StorageLock::new(self.storage.clone(), options)
    }

    /// Release the backend's connections. Locks created by this factory stop working.
    pub async fn shutdown(&self) -> StorageLockResult<()> {
        info!(storage = %self.storage.name(), "shutting down lock storage");
        self.storage.close().await
    }
}

/// Registry key identifying a live storage handle by pointer.
#[derive(Clone)]
pub struct StorageKey(Arc<dyn LockStorage>);

impl StorageKey {
    pub fn new(storage: Arc<dyn LockStorage>) -> Self {
        Self(storage)
    }

    pub fn storage(&self) -> &Arc<dyn LockStorage> {
        &self.0
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for StorageKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for StorageKey {}

impl Hash for StorageKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

/// One factory per connection identity, e.g. a DSN string or a [`StorageKey`].
///
/// The first caller for a key runs `init`; concurrent callers wait for it and
/// share the result. A failed `init` is not cached and the next caller runs its own.
pub struct FactoryRegistry<K> {
    cells: Mutex<HashMap<K, Arc<OnceCell<Arc<StorageLockFactory>>>>>,
}

impl<K: Eq + Hash + Clone> FactoryRegistry<K> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_init<F, Fut>(&self, key: K, init: F) -> StorageLockResult<Arc<StorageLockFactory>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StorageLockResult<StorageLockFactory>>,
    {
        let cell = self.cells.lock().entry(key.clone()).or_default().clone();
        match cell.get_or_try_init(|| async move { init().await.map(Arc::new) }).await {
            Ok(factory) => {
                // A waiter may have succeeded on a cell dropped after an earlier failure
                self.cells.lock().entry(key).or_insert_with(|| cell.clone());
                Ok(factory.clone())
            }
            Err(e) => {
                self.forget_failed(&key, &cell);
                Err(e)
            }
        }
    }

    // Drop the empty cell of a failed init so failing keys do not pile up.
    // A caller already waiting on it keeps its own reference and retries there.
    fn forget_failed(&self, key: &K, cell: &Arc<OnceCell<Arc<StorageLockFactory>>>) {
        let mut cells = self.cells.lock();
        let is_same = cells.get(key).map(|current| Arc::ptr_eq(current, cell)).unwrap_or(false);
        if is_same && !cell.initialized() {
            cells.remove(key);
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<StorageLockFactory>> {
        self.cells.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    /// Forget the factory for `key`. Callers still holding it keep it alive.
    pub fn remove(&self, key: &K) -> Option<Arc<StorageLockFactory>> {
        self.cells.lock().remove(key).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.cells.lock().values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for FactoryRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use crate::errors::StorageLockError;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_concurrent_init_runs_once() {
        let registry = Arc::new(FactoryRegistry::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..16).map(|_| {
            let registry = registry.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                registry
                    .get_or_init("memory://shared".to_string(), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        StorageLockFactory::new(Arc::new(MemoryStorage::new())).await
                    })
                    .await
            })
        });

        let factories: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(factories.iter().all(|f| Arc::ptr_eq(f, &factories[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() {
        let registry = FactoryRegistry::<String>::new();

        let failed = registry
            .get_or_init("redis://unreachable".to_string(), || async {
                Err(StorageLockError::StorageUnavailable("connection refused".to_string()))
            })
            .await;
        assert!(failed.is_err());
        assert!(registry.get(&"redis://unreachable".to_string()).is_none());
        assert!(registry.is_empty());
        assert!(registry.cells.lock().is_empty());

        let factory = registry
            .get_or_init("redis://unreachable".to_string(), || async {
                StorageLockFactory::new(Arc::new(MemoryStorage::new())).await
            })
            .await
            .unwrap();
        let cached = registry.get(&"redis://unreachable".to_string()).unwrap();
        assert!(Arc::ptr_eq(&factory, &cached));
    }

    #[tokio::test]
    async fn test_keyed_by_storage_handle() {
        let registry = FactoryRegistry::<StorageKey>::new();
        let first: Arc<dyn LockStorage> = Arc::new(MemoryStorage::new());
        let second: Arc<dyn LockStorage> = Arc::new(MemoryStorage::new());

        for storage in [&first, &first, &second] {
            let key = StorageKey::new(storage.clone());
            let storage = storage.clone();
            registry
                .get_or_init(key, || StorageLockFactory::new(storage))
                .await
                .unwrap();
        }
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(&StorageKey::new(first.clone())).unwrap();
        assert!(Arc::ptr_eq(removed.storage(), &first));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_create_lock_uses_defaults() {
        let factory = StorageLockFactory::new(Arc::new(MemoryStorage::new()))
            .await
            .unwrap()
            .with_default_options(
                StorageLockOptions::default()
                    .with_lease_expire_after(Duration::from_secs(20))
                    .with_lease_refresh_interval(Duration::from_secs(5)),
            );

        let lock = factory.create_lock("orders").unwrap();
        assert_eq!(lock.lock_id(), "orders");
        assert_eq!(lock.options().lease_expire_after, Duration::from_secs(20));

        let custom = factory
            .create_lock_with_options(StorageLockOptions::new("billing"))
            .unwrap();
        assert_eq!(custom.options().lease_expire_after, Duration::from_secs(300));

        assert!(factory.create_lock("").is_err());
        factory.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_keys_leave_nothing_behind() {
        let registry = FactoryRegistry::<String>::new();
        for port in 7000..7050 {
            let result = registry
                .get_or_init(format!("redis://127.0.0.1:{}", port), || async {
                    Err(StorageLockError::StorageUnavailable("connection refused".to_string()))
                })
                .await;
            assert!(result.is_err());
        }
        assert!(registry.cells.lock().is_empty());
    }
}
