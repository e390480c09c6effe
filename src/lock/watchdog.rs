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

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

/// Periodic renewal task of one held lease.
///
/// The task calls `renew_func` every `renew_interval` until it returns `false`
/// or the watchdog is stopped. Dropping the watchdog aborts the task.
pub struct LeaseWatchdog {
    stop_tx: Option<watch::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl LeaseWatchdog {
    pub fn start<F, Fut>(renew_interval: Duration, renew_func: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            // The lease was just written, so the first renewal waits a full interval
            let mut interval = interval_at(Instant::now() + renew_interval, renew_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {
                        break;
                    }
                    _ = interval.tick() => {
                        if !renew_func().await {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            task_handle: Some(handle),
        }
    }

    /// Signal the task and wait for it, so no renewal is in flight once this returns.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for LeaseWatchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Local lease clock of one hold.
///
/// Calls `on_expire` whenever the deadline in `deadline` passes. The callback
/// returns `true` once the guard has nothing left to do, or `false` when the
/// deadline was moved forward in the meantime. Dropping the guard disarms it.
pub struct ExpiryGuard {
    task_handle: Option<JoinHandle<()>>,
}

impl ExpiryGuard {
    pub fn start<F>(mut deadline: watch::Receiver<Instant>, on_expire: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                let at = *deadline.borrow_and_update();
                tokio::select! {
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep_until(at) => {
                        if on_expire() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            task_handle: Some(handle),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ExpiryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
