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
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use rand::Rng;
use uuid::Uuid;

use crate::errors::StorageLockResult;

/// Wall clock in epoch milliseconds.
pub fn system_now_millis() -> StorageLockResult<i64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(elapsed.as_millis() as i64)
}

pub fn num_milliseconds(duration: &Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// A fresh owner identity, unique per call
pub fn generate_owner_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn jitter_delay(base_delay: Duration, jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return base_delay;
    }
    let mut rng = rand::thread_rng();
    let offset = Duration::from_millis(rng.gen_range(0..=jitter_ms));
    if rng.gen_bool(0.5) {
        base_delay + offset
    } else {
        base_delay - offset.min(base_delay)
    }
}
