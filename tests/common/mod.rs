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
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use storage_lock::{generate_owner_id, RetryPolicy, StorageLock, StorageLockOptions};

pub fn lease_options(lock_id: &str) -> StorageLockOptions {
    StorageLockOptions::new(lock_id)
        .with_lease_expire_after(Duration::from_secs(5))
        .with_lease_refresh_interval(Duration::from_secs(2))
        .with_wait_timeout(Duration::from_secs(120))
        .with_retry(RetryPolicy::fixed(Duration::from_millis(50)).with_jitter(Duration::from_millis(10)))
}

#[derive(Debug, Default)]
pub struct PlayReport {
    pub total: u64,
    pub max_overlap: usize,
    /// Fencing tokens in the order the critical sections ran
    pub tokens: Vec<u64>,
}

/// `players` owners each take the lock `rounds` times and bump a shared counter
/// with a read-yield-write that only survives under mutual exclusion.
pub async fn play(lock: StorageLock, players: usize, rounds: usize, hold: Duration) -> PlayReport {
    let counter = Arc::new(AtomicU64::new(0));
    let active = Arc::new(AtomicUsize::new(0));
    let max_overlap = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let tasks = (0..players).map(|_| {
        let lock = lock.clone();
        let counter = counter.clone();
        let active = active.clone();
        let max_overlap = max_overlap.clone();
        let tokens = tokens.clone();

        tokio::spawn(async move {
            let owner_id = generate_owner_id();
            for _ in 0..rounds {
                let handle = lock.lock(&owner_id).await.unwrap();

                let inside = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap.fetch_max(inside, Ordering::SeqCst);
                tokens.lock().push(handle.fencing_token());

                let seen = counter.load(Ordering::SeqCst);
                tokio::task::yield_now().await;
                if !hold.is_zero() {
                    tokio::time::sleep(hold).await;
                }
                counter.store(seen + 1, Ordering::SeqCst);

                active.fetch_sub(1, Ordering::SeqCst);
                assert!(lock.unlock(&owner_id).await.unwrap());
            }
        })
    });

    for joined in futures::future::join_all(tasks).await {
        joined.unwrap();
    }

    let tokens = tokens.lock().clone();
    PlayReport {
        total: counter.load(Ordering::SeqCst),
        max_overlap: max_overlap.load(Ordering::SeqCst),
        tokens,
    }
}

pub fn strictly_increasing(tokens: &[u64]) -> bool {
    tokens.windows(2).all(|pair| pair[0] < pair[1])
}
