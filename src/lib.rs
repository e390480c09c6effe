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

//! Lease-based distributed locks on top of a shared storage table.
//!
//! A [`StorageLock`] guards one lock id. Owners acquire a time-bounded lease by
//! a version-checked conditional write, a background watchdog keeps renewing it,
//! and the row version doubles as a fencing token. Storage backends implement
//! [`LockStorage`]; [`MemoryStorage`] and [`RedisStorage`] ship with the crate.

mod config;
mod errors;
mod util;
mod storage;
mod scripts;
mod connection;
mod lock;
mod factory;

pub use config::*;
pub use errors::*;
pub use util::*;
pub use storage::*;
pub use scripts::*;
pub use connection::*;
pub use lock::*;
pub use factory::*;
