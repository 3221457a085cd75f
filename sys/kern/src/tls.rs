// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread-local storage slots.
//!
//! A process-wide table allocates slot keys and remembers an optional
//! destructor per slot; each thread carries its own value array. Values are
//! only ever read and written by their owning thread, so those accesses need
//! no gate at all -- the gate only guards the slot table itself.

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr;

use abi::KernError;

use crate::irq::GateCell;
use crate::sched;
use crate::thread::ThreadCb;

/// Number of TLS slots per thread.
pub const TLS_SLOTS: usize = 64;

pub type TlsDestructor = extern "C" fn(*mut c_void);

struct SlotTable {
    /// Bit n set = slot n allocated.
    used: u64,
    destructors: [Option<TlsDestructor>; TLS_SLOTS],
}

static SLOTS: GateCell<SlotTable> = GateCell::new(SlotTable {
    used: 0,
    destructors: [None; TLS_SLOTS],
});

/// Per-thread TLS value block, embedded in the control block.
pub(crate) struct ThreadTls {
    values: UnsafeCell<[*mut c_void; TLS_SLOTS]>,
}

// Safety: values are accessed only by the owning thread (and by the exit
// path running *as* that thread).
unsafe impl Sync for ThreadTls {}
unsafe impl Send for ThreadTls {}

impl ThreadTls {
    pub(crate) fn new() -> Self {
        Self {
            values: UnsafeCell::new([ptr::null_mut(); TLS_SLOTS]),
        }
    }

    fn get(&self, key: usize) -> *mut c_void {
        // Safety: owner-thread-only access; see type comment.
        unsafe { (*self.values.get())[key] }
    }

    fn set(&self, key: usize, value: *mut c_void) {
        // Safety: as above.
        unsafe {
            (*self.values.get())[key] = value;
        }
    }
}

/// Allocates a TLS slot, optionally with a destructor to run at thread
/// exit.
pub fn tls_alloc(
    destructor: Option<TlsDestructor>,
) -> Result<usize, KernError> {
    critical_section::with(|cs| {
        // Safety: single-borrow discipline.
        unsafe {
            SLOTS.with_mut(cs, |table| {
                let key = (!table.used).trailing_zeros() as usize;
                if key >= TLS_SLOTS {
                    return Err(KernError::OutOfMemory);
                }
                table.used |= 1 << key;
                table.destructors[key] = destructor;
                Ok(key)
            })
        }
    })
}

/// Releases a slot key. Values other threads still hold under this key are
/// abandoned, as in the original system.
pub fn tls_free(key: usize) -> Result<(), KernError> {
    critical_section::with(|cs| {
        // Safety: single-borrow discipline.
        unsafe {
            SLOTS.with_mut(cs, |table| {
                if key >= TLS_SLOTS || table.used & (1 << key) == 0 {
                    return Err(KernError::InvalidArgument);
                }
                table.used &= !(1 << key);
                table.destructors[key] = None;
                Ok(())
            })
        }
    })
}

fn check_key(key: usize) -> Result<(), KernError> {
    let used = critical_section::with(|cs| {
        // Safety: single-borrow discipline.
        unsafe { SLOTS.with_mut(cs, |table| table.used) }
    });
    if key < TLS_SLOTS && used & (1 << key) != 0 {
        Ok(())
    } else {
        Err(KernError::InvalidArgument)
    }
}

/// Stores `value` in the calling thread's slot `key`.
pub fn tls_set(key: usize, value: *mut c_void) -> Result<(), KernError> {
    check_key(key)?;
    sched::current_thread().tls().set(key, value);
    Ok(())
}

/// Reads the calling thread's slot `key`. Unallocated keys read as null.
pub fn tls_get(key: usize) -> *mut c_void {
    if key >= TLS_SLOTS {
        return ptr::null_mut();
    }
    sched::current_thread().tls().get(key)
}

/// Runs the destructors for every slot holding a non-null value in
/// `thread`. Called on the exiting thread's own stack, before it becomes a
/// zombie.
pub(crate) fn run_destructors(thread: &ThreadCb) {
    for key in 0..TLS_SLOTS {
        let dtor = critical_section::with(|cs| {
            // Safety: single-borrow discipline.
            unsafe {
                SLOTS.with_mut(cs, |table| {
                    if table.used & (1 << key) != 0 {
                        table.destructors[key]
                    } else {
                        None
                    }
                })
            }
        });
        if let Some(dtor) = dtor {
            let value = thread.tls().get(key);
            if !value.is_null() {
                thread.tls().set(key, ptr::null_mut());
                // Destructors run with the mask down; they may allocate,
                // block, whatever.
                dtor(value);
            }
        }
    }
}
