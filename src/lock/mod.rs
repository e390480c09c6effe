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
mod handle;
mod storage_lock;
mod watchdog;
pub mod transition;

pub use handle::*;
pub use storage_lock::*;
pub use watchdog::*;

/// Lifecycle of one owner's hold on a lock.
///
/// `Released` and `Failed` are terminal. The renewer may only move
/// `Held -> Renewing -> Held`; anything that observes `Failed` must stop
/// treating the resource as exclusively owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Renewing,
    Released,
    Failed,
}

impl LockState {
    pub fn is_held(self) -> bool {
        matches!(self, LockState::Held | LockState::Renewing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LockState::Released | LockState::Failed)
    }
}
