// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel-internal code passes `abi::KernError` around in ordinary `Result`s
//! and lets `?` do the plumbing. The C-style surface in `syscalls` is where
//! errors collapse into the classic integer-plus-errno shape; the helpers
//! here do that collapsing in one place so the wrappers stay thin.

use abi::KernError;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::sched;

/// Errno storage used before the scheduler has a current thread (early boot
/// runs on the bootstrap stack, which has no control block).
static BOOT_ERRNO: AtomicI32 = AtomicI32::new(0);

/// Records `err` in the calling thread's errno slot.
pub fn set_last_error(err: KernError) {
    set_errno(err.errno());
}

/// Records a raw errno value in the calling thread's errno slot.
pub fn set_errno(errno: i32) {
    match sched::try_current_thread() {
        Some(thread) => critical_section::with(|cs| {
            thread.set_errno(cs, errno);
        }),
        None => BOOT_ERRNO.store(errno, Ordering::Relaxed),
    }
}

/// Reads the calling thread's errno slot.
pub fn get_last_error() -> i32 {
    match sched::try_current_thread() {
        Some(thread) => {
            critical_section::with(|cs| thread.errno(cs))
        }
        None => BOOT_ERRNO.load(Ordering::Relaxed),
    }
}

/// Collapses a kernel result into the C convention: `0` on success, `-1`
/// plus errno on failure.
pub fn status_from(r: Result<(), KernError>) -> i32 {
    match r {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// As `status_from`, but for calls that produce a meaningful non-negative
/// integer.
pub fn value_from(r: Result<i32, KernError>) -> i32 {
    match r {
        Ok(v) => v,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// Collapses a handle-producing result into handle-or-`-1`.
pub fn handle_from(r: Result<abi::Handle, KernError>) -> abi::Handle {
    match r {
        Ok(h) => h,
        Err(e) => {
            set_last_error(e);
            abi::Handle::INVALID
        }
    }
}
