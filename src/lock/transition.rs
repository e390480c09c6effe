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
//! Pure planning of lease writes.
//!
//! Each function looks at the row read from storage and decides what to write
//! and under which expected version. Applying the plan (and retrying when the
//! conditional write loses) is the engine's job.

use std::fmt;
use std::time::Duration;

use crate::storage::LeaseRecord;
use crate::util::num_milliseconds;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquirePlan {
    /// No row yet, create the free one first
    Insert,
    /// Write `record` over the row currently at `expected_version`
    Claim { expected_version: u64, record: LeaseRecord },
    /// Somebody else holds an unexpired lease
    Busy { holder: String, version: u64, remaining: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleasePlan {
    /// Reentrant hold: drop one level, keep the lease
    Decrement { expected_version: u64, record: LeaseRecord },
    Free { expected_version: u64, record: LeaseRecord },
    NotHeld(LeaseRejection),
}

/// Why the caller can no longer prove it holds the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseRejection {
    Missing,
    Expired,
    OwnerChanged(String),
    VersionMoved { expected: u64, actual: u64 },
    /// The conditional write itself lost
    Contended,
}

impl fmt::Display for LeaseRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseRejection::Missing => write!(f, "lease row is gone"),
            LeaseRejection::Expired => write!(f, "lease expired"),
            LeaseRejection::OwnerChanged(owner) if owner.is_empty() => write!(f, "lease was freed"),
            LeaseRejection::OwnerChanged(owner) => write!(f, "lease now held by '{}'", owner),
            LeaseRejection::VersionMoved { expected, actual } => {
                write!(f, "lease version moved from {} to {}", expected, actual)
            }
            LeaseRejection::Contended => write!(f, "conditional write lost to a concurrent writer"),
        }
    }
}

pub fn plan_acquire(current: Option<&LeaseRecord>, owner_id: &str, now: i64, lease: Duration) -> AcquirePlan {
    let Some(current) = current else {
        return AcquirePlan::Insert;
    };

    let lock_count = if current.is_held_by(owner_id, now) {
        current.lock_count + 1
    } else if current.is_free(now) {
        1
    } else {
        return AcquirePlan::Busy {
            holder: current.owner_id.clone(),
            version: current.version,
            remaining: current.remaining(now),
        };
    };

    AcquirePlan::Claim {
        expected_version: current.version,
        record: LeaseRecord {
            lock_id: current.lock_id.clone(),
            owner_id: owner_id.to_string(),
            version: current.version + 1,
            lock_count,
            expire_at: now + num_milliseconds(&lease),
            updated_at: now,
        },
    }
}

fn check_ownership(
    current: Option<&LeaseRecord>,
    owner_id: &str,
    expected_version: u64,
    now: i64,
) -> Result<LeaseRecord, LeaseRejection> {
    let current = current.ok_or(LeaseRejection::Missing)?;
    if current.owner_id != owner_id {
        return Err(LeaseRejection::OwnerChanged(current.owner_id.clone()));
    }
    if current.version != expected_version {
        return Err(LeaseRejection::VersionMoved {
            expected: expected_version,
            actual: current.version,
        });
    }
    if current.is_expired(now) {
        return Err(LeaseRejection::Expired);
    }
    Ok(current.clone())
}

/// Push the expiry forward. An expired lease is never renewed, even if nobody claimed it.
pub fn plan_renew(
    current: Option<&LeaseRecord>,
    owner_id: &str,
    expected_version: u64,
    now: i64,
    lease: Duration,
) -> Result<LeaseRecord, LeaseRejection> {
    let current = check_ownership(current, owner_id, expected_version, now)?;
    Ok(LeaseRecord {
        version: current.version + 1,
        expire_at: now + num_milliseconds(&lease),
        updated_at: now,
        ..current
    })
}

/// Reentry by a holder that knows its fencing token.
pub fn plan_reenter(
    current: Option<&LeaseRecord>,
    owner_id: &str,
    expected_version: u64,
    now: i64,
    lease: Duration,
) -> Result<LeaseRecord, LeaseRejection> {
    let current = check_ownership(current, owner_id, expected_version, now)?;
    Ok(LeaseRecord {
        version: current.version + 1,
        lock_count: current.lock_count + 1,
        expire_at: now + num_milliseconds(&lease),
        updated_at: now,
        ..current
    })
}

/// Release one level of `owner_id`'s hold. With `expected_version` the row must
/// still carry that fencing token.
pub fn plan_release(
    current: Option<&LeaseRecord>,
    owner_id: &str,
    expected_version: Option<u64>,
    now: i64,
) -> ReleasePlan {
    let Some(current) = current else {
        return ReleasePlan::NotHeld(LeaseRejection::Missing);
    };
    if current.owner_id.is_empty() || current.owner_id != owner_id {
        return ReleasePlan::NotHeld(LeaseRejection::OwnerChanged(current.owner_id.clone()));
    }
    if let Some(expected) = expected_version {
        if expected != current.version {
            return ReleasePlan::NotHeld(LeaseRejection::VersionMoved {
                expected,
                actual: current.version,
            });
        }
    }

    if current.lock_count > 1 && !current.is_expired(now) {
        return ReleasePlan::Decrement {
            expected_version: current.version,
            record: LeaseRecord {
                version: current.version + 1,
                lock_count: current.lock_count - 1,
                updated_at: now,
                ..current.clone()
            },
        };
    }

    ReleasePlan::Free {
        expected_version: current.version,
        record: freed(current, now),
    }
}

/// Administrative release of whoever holds the row. `None` when already free.
pub fn plan_force_release(current: Option<&LeaseRecord>, now: i64) -> Option<(u64, LeaseRecord)> {
    let current = current?;
    if current.owner_id.is_empty() && current.lock_count == 0 {
        return None;
    }
    Some((current.version, freed(current, now)))
}

// Freeing keeps the row and bumps the version, so fencing tokens never repeat.
fn freed(current: &LeaseRecord, now: i64) -> LeaseRecord {
    LeaseRecord {
        lock_id: current.lock_id.clone(),
        owner_id: String::new(),
        version: current.version + 1,
        lock_count: 0,
        expire_at: 0,
        updated_at: now,
    }
}
