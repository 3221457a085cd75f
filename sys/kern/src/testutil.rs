// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for host-side unit tests.
//!
//! The kernel's state -- the current-thread pointer, the object registry,
//! the fake clock -- is process-wide, and the test harness runs tests on
//! multiple threads. Tests that touch that state take the serialization
//! lock here for their whole body.

use alloc::sync::Arc;
use std::sync::{Mutex, MutexGuard};

use abi::{DetachState, Handle, ObjectType, Priority, ThreadState};

use crate::object;
use crate::sched;
use crate::thread::ThreadCb;

static SERIAL: Mutex<()> = Mutex::new(());

/// Claims exclusive use of the kernel's global state for the duration of
/// the returned guard.
pub(crate) fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

extern "C" fn nop_entry(_arg: *mut core::ffi::c_void) {}

/// Builds a minimal thread with an initialized (fake) stack context.
pub(crate) fn mkthread(name: &str, pri: i8) -> Arc<ThreadCb> {
    let t = ThreadCb::new(name, Priority(pri), DetachState::Detached, 1024)
        .unwrap();
    t.initialize_stack(nop_entry, core::ptr::null_mut());
    t
}

/// Serialization guard plus an installed, registered current thread;
/// dropping it uninstalls the thread and frees its handle before releasing
/// the lock.
pub(crate) struct CurrentGuard {
    pub thread: Arc<ThreadCb>,
    handle: Handle,
    _serial: MutexGuard<'static, ()>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        sched::clear_current_thread();
        object::free_object_handle(self.handle, ObjectType::Thread);
    }
}

/// Takes the lock and installs a fresh thread as the running one, the way
/// most sync-primitive tests want to start. The thread is registered so it
/// has a real handle, like anything `spawn_thread` produces.
pub(crate) fn install_current(name: &str, pri: i8) -> CurrentGuard {
    let serial = serial();
    let thread = mkthread(name, pri);
    let handle = object::register_object(thread.clone()).unwrap();
    critical_section::with(|cs| {
        thread.set_state(cs, ThreadState::Running);
        sched::set_current_thread(&thread);
    });
    CurrentGuard {
        thread,
        handle,
        _serial: serial,
    }
}
