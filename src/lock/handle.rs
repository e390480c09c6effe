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
use tokio::sync::watch;

use crate::lock::LockState;

/// Proof of a successful acquisition, handed to the protected section.
///
/// The handle does not release anything when dropped; call
/// [`StorageLock::unlock`](crate::StorageLock::unlock) or use
/// [`StorageLock::run_exclusive`](crate::StorageLock::run_exclusive).
#[derive(Debug, Clone)]
pub struct LeaseHandle {
    lock_id: String,
    owner_id: String,
    fencing_token: u64,
    lock_count: u32,
    state: watch::Receiver<LockState>,
}

impl LeaseHandle {
    pub(crate) fn new(
        lock_id: &str,
        owner_id: &str,
        fencing_token: u64,
        lock_count: u32,
        state: watch::Receiver<LockState>,
    ) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            owner_id: owner_id.to_string(),
            fencing_token,
            lock_count,
            state,
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Row version written by this acquisition. Later renewals only increase it.
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    /// Reentry depth right after this acquisition
    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    pub fn is_held(&self) -> bool {
        self.state().is_held()
    }

    /// Resolves once the lease can no longer be proven, returning the terminal state.
    pub async fn lost(&mut self) -> LockState {
        loop {
            let state = *self.state.borrow_and_update();
            if state.is_terminal() || state == LockState::Idle {
                return state;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }
}
