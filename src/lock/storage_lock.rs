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
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::StorageLockOptions;
use crate::errors::{StorageLockError, StorageLockResult};
use crate::lock::transition::{self, AcquirePlan, LeaseRejection, ReleasePlan};
use crate::lock::{ExpiryGuard, LeaseHandle, LeaseWatchdog, LockState};
use crate::storage::{LeaseRecord, LockStorage};
use crate::util::jitter_delay;

struct HeldLease {
    version: u64,
    lock_count: u32,
}

/// Local bookkeeping of one owner's hold. Storage stays the authority; this only
/// remembers the fencing token to present on the next conditional write.
struct LeaseSession {
    owner_id: String,
    state: watch::Sender<LockState>,
    // Serializes renew, reentry and release of this hold
    op: TokioMutex<()>,
    lease: Mutex<HeldLease>,
    // Local instant at which the lease must be presumed gone. Never later than
    // the expiry storage wrote, since it is measured from before the write.
    deadline: watch::Sender<Instant>,
    watchdog: Mutex<Option<LeaseWatchdog>>,
    expiry: Mutex<Option<ExpiryGuard>>,
}

impl LeaseSession {
    fn acquiring(owner_id: &str) -> Self {
        let (state, _) = watch::channel(LockState::Acquiring);
        let (deadline, _) = watch::channel(Instant::now());
        Self {
            owner_id: owner_id.to_string(),
            state,
            op: TokioMutex::new(()),
            lease: Mutex::new(HeldLease { version: 0, lock_count: 0 }),
            deadline,
            watchdog: Mutex::new(None),
            expiry: Mutex::new(None),
        }
    }

    fn state(&self) -> LockState {
        *self.state.borrow()
    }

    fn version(&self) -> u64 {
        self.lease.lock().version
    }

    fn update_lease(&self, record: &LeaseRecord) {
        let mut lease = self.lease.lock();
        lease.version = record.version;
        lease.lock_count = record.lock_count;
    }

    /// `started` is taken before the write that stored the new expiry.
    fn extend_deadline(&self, started: Instant, lease: Duration) {
        self.deadline.send_replace(started + lease);
    }

    fn deadline(&self) -> Instant {
        *self.deadline.borrow()
    }

    /// Held -> Renewing in one step. `false` when release or failure got there first.
    fn begin_renew(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LockState::Held {
                *state = LockState::Renewing;
                true
            } else {
                false
            }
        })
    }

    fn finish_renew(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LockState::Renewing {
                *state = LockState::Held;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, terminal: LockState) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        });
    }

    /// Fails the hold once its local deadline has passed. `false` while the
    /// deadline still lies ahead.
    fn expire_locally(&self) -> bool {
        if self.deadline() > Instant::now() {
            return false;
        }
        let expired = self.state.send_if_modified(|state| {
            if state.is_held() {
                *state = LockState::Failed;
                true
            } else {
                false
            }
        });
        if expired {
            warn!(owner_id = %self.owner_id, version = self.version(), "lease deadline passed without a confirmed renewal");
        }
        true
    }

    fn handle(&self, lock_id: &str) -> LeaseHandle {
        let lease = self.lease.lock();
        LeaseHandle::new(lock_id, &self.owner_id, lease.version, lease.lock_count, self.state.subscribe())
    }

    async fn stop_tasks(&self) {
        // Dropping the guard disarms it
        self.expiry.lock().take();
        let watchdog = self.watchdog.lock().take();
        if let Some(watchdog) = watchdog {
            watchdog.stop().await;
        }
    }

    fn abandon(&self) {
        self.finish(LockState::Failed);
        // Dropping the watchdog aborts its task
        self.watchdog.lock().take();
        self.expiry.lock().take();
    }
}

/// Sessions of every owner on one engine, shared by its clones.
struct SessionTable {
    lock_id: String,
    sessions: Mutex<HashMap<String, Arc<LeaseSession>>>,
}

impl SessionTable {
    fn new(lock_id: &str) -> Self {
        Self {
            lock_id: lock_id.to_string(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, owner_id: &str) -> Option<Arc<LeaseSession>> {
        self.sessions.lock().get(owner_id).cloned()
    }

    /// The owner's session, or a fresh `Acquiring` one. `true` when created.
    fn get_or_insert(&self, owner_id: &str) -> (Arc<LeaseSession>, bool) {
        let mut sessions = self.sessions.lock();
        match sessions.get(owner_id) {
            Some(session) => (session.clone(), false),
            None => {
                let session = Arc::new(LeaseSession::acquiring(owner_id));
                sessions.insert(owner_id.to_string(), session.clone());
                (session, true)
            }
        }
    }

    fn remove(&self, session: &Arc<LeaseSession>) {
        let mut sessions = self.sessions.lock();
        let is_current = sessions
            .get(&session.owner_id)
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false);
        if is_current {
            sessions.remove(&session.owner_id);
        }
    }
}

impl Drop for SessionTable {
    fn drop(&mut self) {
        // Last engine clone gone: stop renewing so abandoned leases can expire
        for (owner_id, session) in self.sessions.get_mut().drain() {
            if session.state().is_held() {
                warn!(lock_id = %self.lock_id, owner_id = %owner_id, "lock dropped while held, lease left to expire");
            }
            session.abandon();
        }
    }
}

/// Removes a session that never got past `Acquiring`, including when the
/// acquiring future is dropped by a timeout or cancellation.
struct PendingSession<'a> {
    table: &'a SessionTable,
    session: Arc<LeaseSession>,
    armed: bool,
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.table.remove(&self.session);
        self.session.state.send_replace(LockState::Idle);
    }
}

/// A distributed lock on one lock id, shared by any number of owners.
///
/// Mutual exclusion comes only from conditional writes on the lease row; the
/// engine can crash at any point and the lease simply expires. Clones share the
/// same local sessions.
#[derive(Clone)]
pub struct StorageLock {
    storage: Arc<dyn LockStorage>,
    options: Arc<StorageLockOptions>,
    sessions: Arc<SessionTable>,
}

impl StorageLock {
    pub fn new(storage: Arc<dyn LockStorage>, options: StorageLockOptions) -> StorageLockResult<Self> {
        options.validate()?;
        Ok(Self {
            storage,
            sessions: Arc::new(SessionTable::new(&options.lock_id)),
            options: Arc::new(options),
        })
    }

    pub fn lock_id(&self) -> &str {
        &self.options.lock_id
    }

    pub fn options(&self) -> &StorageLockOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<dyn LockStorage> {
        &self.storage
    }

    /// Acquire for `owner_id`, waiting up to the configured `wait_timeout`.
    pub async fn lock(&self, owner_id: &str) -> StorageLockResult<LeaseHandle> {
        self.lock_with_timeout(owner_id, self.options.wait_timeout).await
    }

    pub async fn lock_with_timeout(&self, owner_id: &str, wait_time: Duration) -> StorageLockResult<LeaseHandle> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.lock_with_cancel(owner_id, wait_time, cancel_rx).await
    }

    /// Like [`lock_with_timeout`](Self::lock_with_timeout), but a timeout is `Ok(None)`.
    pub async fn try_lock(&self, owner_id: &str, wait_time: Duration) -> StorageLockResult<Option<LeaseHandle>> {
        match self.lock_with_timeout(owner_id, wait_time).await {
            Ok(handle) => Ok(Some(handle)),
            Err(StorageLockError::TimeoutError) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Acquire until success, `wait_time` elapses, or `cancel` turns `true`.
    pub async fn lock_with_cancel(
        &self,
        owner_id: &str,
        wait_time: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> StorageLockResult<LeaseHandle> {
        if owner_id.is_empty() {
            return Err(StorageLockError::ConfigError("Owner id cannot be empty".to_string()));
        }

        let deadline = Instant::now() + wait_time;
        tokio::select! {
            result = timeout_at(deadline, self.acquire(owner_id, deadline)) => match result {
                Ok(result) => result,
                Err(_) => {
                    debug!(lock_id = %self.lock_id(), owner_id = %owner_id, "lock acquisition timed out");
                    Err(StorageLockError::TimeoutError)
                }
            },
            _ = cancelled(&mut cancel) => {
                debug!(lock_id = %self.lock_id(), owner_id = %owner_id, "lock acquisition cancelled");
                Err(StorageLockError::Cancelled)
            }
        }
    }

    /// Release one level of `owner_id`'s hold.
    ///
    /// Returns `Ok(false)` when there is nothing to release: never acquired,
    /// already released, or the lease expired and changed hands. A hold that
    /// failed locally is still freed in storage if the row kept its version.
    pub async fn unlock(&self, owner_id: &str) -> StorageLockResult<bool> {
        let Some(session) = self.sessions.get(owner_id) else {
            return self.release_in_storage(owner_id, None).await;
        };

        let op = session.op.lock().await;
        match session.state() {
            LockState::Held | LockState::Renewing => {}
            LockState::Acquiring => return Ok(false),
            _ => {
                drop(op);
                return self.retire(&session).await;
            }
        }

        let (expected, lock_count) = {
            let lease = session.lease.lock();
            (lease.version, lease.lock_count)
        };

        if lock_count > 1 {
            let now = self.storage.now_millis().await?;
            let current = self.storage.read(self.lock_id()).await?;
            let rejection = match transition::plan_release(current.as_ref(), owner_id, Some(expected), now) {
                ReleasePlan::Decrement { expected_version, record } => {
                    if self.storage.conditional_update(self.lock_id(), expected_version, &record).await? {
                        session.update_lease(&record);
                        debug!(lock_id = %self.lock_id(), owner_id = %owner_id, lock_count = record.lock_count, "reentrant hold released");
                        return Ok(true);
                    }
                    Some(LeaseRejection::Contended)
                }
                // Expired in the meantime, fall through to a full release
                ReleasePlan::Free { .. } => None,
                ReleasePlan::NotHeld(rejection) => Some(rejection),
            };

            if let Some(rejection) = rejection {
                warn!(lock_id = %self.lock_id(), owner_id = %owner_id, "lease lost before release: {}", rejection);
                session.finish(LockState::Failed);
                drop(op);
                self.discard(&session).await;
                return Ok(false);
            }
        }

        session.finish(LockState::Released);
        drop(op);
        // The renewer is stopped before the row is freed, so no renewal can follow the release
        self.discard(&session).await;
        self.release_in_storage(owner_id, Some(expected)).await
    }

    /// Acquire, run `f`, and release on every exit path.
    ///
    /// If the lease is lost while `f` runs, `f` is dropped and `LeaseLost` is
    /// returned. A panic in `f` is resumed after the release.
    pub async fn run_exclusive<F, Fut, T>(&self, owner_id: &str, f: F) -> StorageLockResult<T>
    where
        F: FnOnce(LeaseHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.lock(owner_id).await?;
        let mut watcher = handle.clone();

        let outcome = tokio::select! {
            result = AssertUnwindSafe(f(handle)).catch_unwind() => Ok(result),
            state = watcher.lost() => Err(state),
        };

        let released = self.unlock(owner_id).await;
        match outcome {
            Ok(Ok(value)) => {
                if let Err(e) = released {
                    warn!(lock_id = %self.lock_id(), owner_id = %owner_id, "protected section finished but release failed: {}", e);
                }
                Ok(value)
            }
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(state) => Err(StorageLockError::LeaseLost(format!(
                "lock '{}' went {:?} while owner '{}' was inside the protected section",
                self.lock_id(),
                state,
                owner_id
            ))),
        }
    }

    /// Free the lease whoever holds it. The holder's renewer notices on its next tick.
    pub async fn force_unlock(&self) -> StorageLockResult<bool> {
        let now = self.storage.now_millis().await?;
        let current = self.storage.read(self.lock_id()).await?;
        let Some((expected_version, record)) = transition::plan_force_release(current.as_ref(), now) else {
            return Ok(false);
        };

        let released = self.storage.conditional_update(self.lock_id(), expected_version, &record).await?;
        if released {
            let previous_owner = current.map(|c| c.owner_id).unwrap_or_default();
            warn!(lock_id = %self.lock_id(), previous_owner = %previous_owner, "lock force released");
        }
        Ok(released)
    }

    /// Delete the lease row if nobody holds it.
    ///
    /// Only for retired lock ids: a later acquisition starts the fencing sequence over.
    pub async fn destroy(&self) -> StorageLockResult<bool> {
        let now = self.storage.now_millis().await?;
        let Some(current) = self.storage.read(self.lock_id()).await? else {
            return Ok(false);
        };
        if !current.is_free(now) {
            return Ok(false);
        }
        self.storage.delete(self.lock_id(), current.version).await
    }

    /// Whether any owner holds an unexpired lease right now.
    pub async fn is_locked(&self) -> StorageLockResult<bool> {
        Ok(self.current_lease().await?.is_some())
    }

    /// The live lease row, or `None` when the lock is free.
    pub async fn current_lease(&self) -> StorageLockResult<Option<LeaseRecord>> {
        let now = self.storage.now_millis().await?;
        let current = self.storage.read(self.lock_id()).await?;
        Ok(current.filter(|record| !record.is_free(now)))
    }

    pub async fn holder(&self) -> StorageLockResult<Option<String>> {
        Ok(self.current_lease().await?.map(|lease| lease.owner_id))
    }

    /// Local view of `owner_id`'s hold through this engine.
    pub fn state(&self, owner_id: &str) -> LockState {
        self.sessions
            .get(owner_id)
            .map(|session| session.state())
            .unwrap_or(LockState::Idle)
    }

    pub fn is_held_by(&self, owner_id: &str) -> bool {
        self.state(owner_id).is_held()
    }

    async fn acquire(&self, owner_id: &str, deadline: Instant) -> StorageLockResult<LeaseHandle> {
        loop {
            let (session, created) = self.sessions.get_or_insert(owner_id);

            if created {
                let mut pending = PendingSession {
                    table: &self.sessions,
                    session,
                    armed: true,
                };
                let (record, started) = self.claim_with_retry(owner_id, deadline).await?;
                pending.armed = false;
                return Ok(self.install(&pending.session, &record, started));
            }

            match session.state() {
                LockState::Acquiring => {
                    // Another task of the same owner is contending; reenter once it wins
                    let mut state = session.state.subscribe();
                    let _ = state.wait_for(|state| *state != LockState::Acquiring).await;
                    continue;
                }
                LockState::Held | LockState::Renewing => {
                    if let Some(handle) = self.reenter(&session).await? {
                        return Ok(handle);
                    }
                }
                _ => {}
            }

            if let Err(e) = self.retire(&session).await {
                warn!(lock_id = %self.lock_id(), owner_id = %owner_id, "could not free a failed hold before reacquiring: {}", e);
            }
        }
    }

    /// Returns the committed record and the instant its attempt started.
    async fn claim_with_retry(&self, owner_id: &str, deadline: Instant) -> StorageLockResult<(LeaseRecord, Instant)> {
        let retry = &self.options.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            match self.try_claim(owner_id).await {
                Ok(Some(record)) => return Ok((record, started)),
                Ok(None) => {}
                Err(e) if e.is_storage_error() => {
                    warn!(lock_id = %self.lock_id(), owner_id = %owner_id, attempt, "storage error while acquiring, will retry: {}", e);
                }
                Err(e) => return Err(e),
            }

            if let Some(max_attempts) = retry.max_attempts {
                if attempt >= max_attempts {
                    return Err(StorageLockError::RetriesExhausted(attempt));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StorageLockError::TimeoutError);
            }
            let backoff = retry.backoff_for(attempt).min(self.options.lease_refresh_interval);
            sleep(jitter_delay(backoff, retry.jitter).min(remaining)).await;
        }
    }

    /// One pass of read, plan, conditional write. `Ok(None)` means contended.
    async fn try_claim(&self, owner_id: &str) -> StorageLockResult<Option<LeaseRecord>> {
        let lock_id = self.lock_id();
        let mut current = self.storage.read(lock_id).await?;

        // At most one insert per pass
        for _ in 0..2 {
            let now = self.storage.now_millis().await?;
            match transition::plan_acquire(current.as_ref(), owner_id, now, self.options.lease_expire_after) {
                AcquirePlan::Insert => {
                    if self.storage.try_insert(lock_id).await? {
                        debug!(lock_id = %lock_id, storage = %self.storage.name(), "lease row created");
                    }
                    current = self.storage.read(lock_id).await?;
                }
                AcquirePlan::Claim { expected_version, record } => {
                    if self.storage.conditional_update(lock_id, expected_version, &record).await? {
                        return Ok(Some(record));
                    }
                    debug!(lock_id = %lock_id, owner_id = %owner_id, expected_version, "version miss while claiming lease");
                    return Ok(None);
                }
                AcquirePlan::Busy { holder, version, remaining } => {
                    debug!(lock_id = %lock_id, owner_id = %owner_id, holder = %holder, version, ?remaining, "lock is busy");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    // No await in here: once the claim is committed, the session is installed
    // even if the caller's future is dropped right after.
    fn install(&self, session: &Arc<LeaseSession>, record: &LeaseRecord, started: Instant) -> LeaseHandle {
        session.update_lease(record);
        session.extend_deadline(started, self.options.lease_expire_after);
        session.state.send_replace(LockState::Held);

        let watchdog = self.start_watchdog(session);
        *session.watchdog.lock() = Some(watchdog);
        let expiring = session.clone();
        let expiry = ExpiryGuard::start(session.deadline.subscribe(), move || expiring.expire_locally());
        *session.expiry.lock() = Some(expiry);

        info!(
            lock_id = %self.lock_id(),
            owner_id = %session.owner_id,
            version = record.version,
            lock_count = record.lock_count,
            "lock acquired"
        );
        session.handle(self.lock_id())
    }

    fn start_watchdog(&self, session: &Arc<LeaseSession>) -> LeaseWatchdog {
        let storage = self.storage.clone();
        let options = self.options.clone();
        let session = session.clone();

        LeaseWatchdog::start(self.options.lease_refresh_interval, move || {
            renew_lease(storage.clone(), options.clone(), session.clone())
        })
    }

    async fn reenter(&self, session: &Arc<LeaseSession>) -> StorageLockResult<Option<LeaseHandle>> {
        let _op = session.op.lock().await;
        if !session.state().is_held() {
            return Ok(None);
        }

        let started = Instant::now();
        let expected = session.version();
        let now = self.storage.now_millis().await?;
        let current = self.storage.read(self.lock_id()).await?;
        let rejection = match transition::plan_reenter(
            current.as_ref(),
            &session.owner_id,
            expected,
            now,
            self.options.lease_expire_after,
        ) {
            Ok(record) => {
                if self.storage.conditional_update(self.lock_id(), expected, &record).await? {
                    session.update_lease(&record);
                    session.extend_deadline(started, self.options.lease_expire_after);
                    if !session.state().is_held() {
                        // Expired locally while the write was in flight
                        return Ok(None);
                    }
                    debug!(lock_id = %self.lock_id(), owner_id = %session.owner_id, lock_count = record.lock_count, "lock reentered");
                    return Ok(Some(session.handle(self.lock_id())));
                }
                LeaseRejection::Contended
            }
            Err(rejection) => rejection,
        };

        warn!(lock_id = %self.lock_id(), owner_id = %session.owner_id, "lease lost before reentry: {}", rejection);
        session.finish(LockState::Failed);
        Ok(None)
    }

    async fn discard(&self, session: &Arc<LeaseSession>) {
        self.sessions.remove(session);
        session.stop_tasks().await;
    }

    /// Drop a session that is no longer held. A failed one still owns its row
    /// at the last version it wrote, unless somebody moved it since; free it.
    async fn retire(&self, session: &Arc<LeaseSession>) -> StorageLockResult<bool> {
        self.discard(session).await;
        if session.state() != LockState::Failed {
            return Ok(false);
        }
        self.release_in_storage(&session.owner_id, Some(session.version())).await
    }

    async fn release_in_storage(&self, owner_id: &str, expected_version: Option<u64>) -> StorageLockResult<bool> {
        let now = self.storage.now_millis().await?;
        let current = self.storage.read(self.lock_id()).await?;
        let (expected_version, record) = match transition::plan_release(current.as_ref(), owner_id, expected_version, now) {
            ReleasePlan::Free { expected_version, record } | ReleasePlan::Decrement { expected_version, record } => {
                (expected_version, record)
            }
            ReleasePlan::NotHeld(rejection) => {
                debug!(lock_id = %self.lock_id(), owner_id = %owner_id, "nothing to release: {}", rejection);
                return Ok(false);
            }
        };

        let released = self.storage.conditional_update(self.lock_id(), expected_version, &record).await?;
        if released {
            info!(lock_id = %self.lock_id(), owner_id = %owner_id, version = record.version, "lock released");
        } else {
            debug!(lock_id = %self.lock_id(), owner_id = %owner_id, "lease changed hands before release");
        }
        Ok(released)
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Nobody can cancel any more
            std::future::pending::<()>().await;
        }
    }
}

async fn renew_lease(storage: Arc<dyn LockStorage>, options: Arc<StorageLockOptions>, session: Arc<LeaseSession>) -> bool {
    let _op = session.op.lock().await;
    if !session.begin_renew() {
        return false;
    }

    // Never wait on storage past the point where the lease is presumed gone
    let started = Instant::now();
    let budget = options
        .effective_renew_timeout()
        .min(session.deadline().saturating_duration_since(started));
    let expected = session.version();
    let round = timeout(budget, renew_round(storage.as_ref(), &options, &session.owner_id, expected)).await;

    let lock_id = options.lock_id.as_str();
    match round {
        Ok(Ok(Ok(record))) => {
            session.update_lease(&record);
            session.extend_deadline(started, options.lease_expire_after);
            if !session.finish_renew() {
                debug!(lock_id = %lock_id, owner_id = %session.owner_id, version = record.version, "renewal committed after the hold was given up");
                return false;
            }
            debug!(lock_id = %lock_id, owner_id = %session.owner_id, version = record.version, "lease renewed");
            true
        }
        Ok(Ok(Err(rejection))) => {
            warn!(lock_id = %lock_id, owner_id = %session.owner_id, "lease lost during renewal: {}", rejection);
            session.finish(LockState::Failed);
            false
        }
        Ok(Err(e)) => {
            warn!(lock_id = %lock_id, owner_id = %session.owner_id, "renewal failed, lease can no longer be proven: {}", e);
            session.finish(LockState::Failed);
            false
        }
        Err(_) => {
            warn!(lock_id = %lock_id, owner_id = %session.owner_id, ?budget, "renewal timed out, lease can no longer be proven");
            session.finish(LockState::Failed);
            false
        }
    }
}

async fn renew_round(
    storage: &dyn LockStorage,
    options: &StorageLockOptions,
    owner_id: &str,
    expected_version: u64,
) -> StorageLockResult<Result<LeaseRecord, LeaseRejection>> {
    let now = storage.now_millis().await?;
    let current = storage.read(&options.lock_id).await?;
    let record = match transition::plan_renew(current.as_ref(), owner_id, expected_version, now, options.lease_expire_after) {
        Ok(record) => record,
        Err(rejection) => return Ok(Err(rejection)),
    };

    if storage.conditional_update(&options.lock_id, expected_version, &record).await? {
        Ok(Ok(record))
    } else {
        Ok(Err(LeaseRejection::Contended))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::storage::MemoryStorage;

    fn options(lock_id: &str) -> StorageLockOptions {
        StorageLockOptions::new(lock_id)
            .with_lease_expire_after(Duration::from_secs(5))
            .with_lease_refresh_interval(Duration::from_secs(2))
            .with_wait_timeout(Duration::from_secs(10))
            .with_retry(RetryPolicy::fixed(Duration::from_millis(100)).with_jitter(Duration::ZERO))
    }

    fn engine(storage: &Arc<MemoryStorage>, lock_id: &str) -> StorageLock {
        StorageLock::new(storage.clone(), options(lock_id)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentrant_lock() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "reentrant");

        let first = lock.lock("a").await.unwrap();
        let second = lock.lock("a").await.unwrap();
        assert_eq!(first.lock_count(), 1);
        assert_eq!(second.lock_count(), 2);
        assert!(second.fencing_token() > first.fencing_token());

        assert!(lock.unlock("a").await.unwrap());
        assert!(lock.is_locked().await.unwrap());
        assert!(lock.is_held_by("a"));

        assert!(lock.unlock("a").await.unwrap());
        assert!(!lock.is_locked().await.unwrap());
        assert_eq!(lock.state("a"), LockState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "idempotent");

        assert!(!lock.unlock("nobody").await.unwrap());

        lock.lock("a").await.unwrap();
        assert!(!lock.unlock("b").await.unwrap());
        assert!(lock.is_locked().await.unwrap());

        assert!(lock.unlock("a").await.unwrap());
        assert!(!lock.unlock("a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_outlives_lease() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "renewal");

        let handle = lock.lock("a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(lock.holder().await.unwrap().as_deref(), Some("a"));
        let lease = lock.current_lease().await.unwrap().unwrap();
        assert_eq!(lease.owner_id, "a");
        assert!(lease.version > handle.fencing_token());
        assert!(handle.is_held());

        let other = lock.try_lock("b", Duration::from_secs(1)).await.unwrap();
        assert!(other.is_none());
        assert!(lock.unlock("a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_outage_fails_lease() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "outage");

        let mut handle = lock.lock("a").await.unwrap();
        storage.set_unavailable(true);

        assert_eq!(handle.lost().await, LockState::Failed);
        assert_eq!(lock.state("a"), LockState::Failed);

        // The row still carries a's last version, so the release goes through
        storage.set_unavailable(false);
        assert!(lock.is_locked().await.unwrap());
        assert!(lock.unlock("a").await.unwrap());
        assert_eq!(lock.state("a"), LockState::Idle);
        assert!(!lock.is_locked().await.unwrap());
        assert!(!lock.unlock("a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_hold_is_freed_before_reacquiring() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "reacquire");

        let mut first = lock.lock("a").await.unwrap();
        storage.set_unavailable(true);
        assert_eq!(first.lost().await, LockState::Failed);
        storage.set_unavailable(false);

        let second = lock.lock("a").await.unwrap();
        assert_eq!(second.lock_count(), 1);
        assert!(second.fencing_token() > first.fencing_token());
        assert!(lock.unlock("a").await.unwrap());
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_hold_fails_at_local_deadline() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "stalled");
        let mut handle = lock.lock("a").await.unwrap();
        let started = Instant::now();

        // A reentry stuck in storage holds the hold's op lock, so no renewal can run
        storage.delay_updates_for("a", Duration::from_secs(100));
        let stuck = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.lock("a").await })
        };

        assert_eq!(handle.lost().await, LockState::Failed);
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert!(!lock.is_held_by("a"));

        stuck.abort();
        storage.clear_update_delay();
        let other = engine(&storage, "stalled");
        let next = other.lock("b").await.unwrap();
        assert!(next.fencing_token() > handle.fencing_token());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_clone_dropped_concurrently_abandons_holds() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "clones");
        let handle = lock.lock("a").await.unwrap();

        let clones: Vec<StorageLock> = (0..8).map(|_| lock.clone()).collect();
        drop(lock);
        let drops: Vec<_> = clones
            .into_iter()
            .map(|clone| tokio::task::spawn_blocking(move || drop(clone)))
            .collect();
        for joined in futures::future::join_all(drops).await {
            joined.unwrap();
        }

        assert_eq!(handle.state(), LockState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_unlock_is_noticed_by_holder() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "force");

        let mut handle = lock.lock("a").await.unwrap();
        assert!(lock.force_unlock().await.unwrap());
        assert!(!lock.force_unlock().await.unwrap());

        assert_eq!(handle.lost().await, LockState::Failed);
        let next = lock.lock("b").await.unwrap();
        assert!(next.fencing_token() > handle.fencing_token());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "cancel");
        lock.lock("a").await.unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.lock_with_cancel("b", Duration::from_secs(30), cancel_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel_tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StorageLockError::Cancelled)));
        assert_eq!(lock.state("b"), LockState::Idle);
        assert!(lock.is_held_by("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_owner_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "empty-owner");
        assert!(matches!(lock.lock("").await, Err(StorageLockError::ConfigError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "attempts");
        lock.lock("a").await.unwrap();

        let limited = StorageLock::new(
            storage.clone(),
            options("attempts").with_retry(RetryPolicy::fixed(Duration::from_millis(100)).with_max_attempts(3)),
        )
        .unwrap();
        assert!(matches!(
            limited.lock("b").await,
            Err(StorageLockError::RetriesExhausted(3))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_only_free_rows() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "destroy");
        assert!(!lock.destroy().await.unwrap());

        lock.lock("a").await.unwrap();
        assert!(!lock.destroy().await.unwrap());

        lock.unlock("a").await.unwrap();
        assert!(lock.destroy().await.unwrap());
        assert!(storage.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exclusive_releases_on_error() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "exclusive");

        let result: StorageLockResult<Result<(), String>> = lock
            .run_exclusive("a", |handle| async move {
                assert!(handle.is_held());
                Err("work failed".to_string())
            })
            .await;
        assert_eq!(result.unwrap(), Err("work failed".to_string()));
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exclusive_releases_on_panic() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "panic");

        let outcome = AssertUnwindSafe(lock.run_exclusive("a", |_| async { panic!("protected section failed") }))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exclusive_aborts_on_loss() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "loss");

        let outage = storage.clone();
        let result = lock
            .run_exclusive("a", |_| async move {
                outage.set_unavailable(true);
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert!(matches!(result, Err(StorageLockError::LeaseLost(_))));
        storage.set_unavailable(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_engine_lets_lease_expire() {
        let storage = Arc::new(MemoryStorage::new());
        let lock = engine(&storage, "dropped");
        let handle = lock.lock("a").await.unwrap();
        drop(lock);
        assert_eq!(handle.state(), LockState::Failed);

        let other = engine(&storage, "dropped");
        let started = Instant::now();
        let next = other.lock("b").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(next.fencing_token() > handle.fencing_token());
    }
}
