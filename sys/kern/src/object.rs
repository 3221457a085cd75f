// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named kernel objects and the registry that hands out their handles.
//!
//! Every object a handle can refer to -- thread, semaphore, mutex,
//! condition variable -- embeds an [`ObjectBase`]: a fixed-size name, a type
//! tag, the object's first handle, a count of live handles, and the wait
//! queue of threads blocked on it. The registry is one process-wide handle
//! table storing `Arc`s; an object lives as long as some handle *or* some
//! direct reference does.
//!
//! Deleting an object's last handle is its logical death: the wait queue is
//! drained with each node's `target_deleted` flag set, so every blocked
//! syscall comes back with `InvalidArgument` (spec'd behavior, and the only
//! way out of a wait besides satisfaction, timeout, or a signal). Threads
//! that were already woken by something else race us harmlessly: their node
//! is gone from the queue, and they still hold an `Arc`, so the memory
//! stays put until they're done looking at it.

use alloc::sync::Arc;
use core::any::Any;

use abi::{Handle, KernError, ObjectType};

use crate::irq::GateCell;
use crate::sched;
use crate::wait::WaitQueue;

/// Magic word stamped into every live object; `debug_validate` checks it to
/// catch stray writes before they propagate.
const OBJECT_MAGIC: u32 = 0x4b4f_424a;

/// State common to all named kernel objects.
pub struct ObjectBase {
    magic: u32,
    name: abi::ObjectName,
    object_type: ObjectType,
    /// First handle registered for this object, so the object knows its own
    /// identity (threads report it from `get_thread_id`).
    handle: GateCell<Handle>,
    /// Number of live handles in the registry referring to this object.
    handle_count: GateCell<u32>,
    /// Threads currently blocked on this object.
    pub(crate) wait_queue: GateCell<WaitQueue>,
}

impl ObjectBase {
    pub fn new(name: &str, object_type: ObjectType) -> Self {
        let mut stored = abi::ObjectName::new();
        for c in name.chars() {
            if stored.try_push(c).is_err() {
                break;
            }
        }
        Self {
            magic: OBJECT_MAGIC,
            name: stored,
            object_type,
            handle: GateCell::new(Handle::INVALID),
            handle_count: GateCell::new(0),
            wait_queue: GateCell::new(WaitQueue::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn handle(&self, cs: critical_section::CriticalSection<'_>) -> Handle {
        self.handle.get(cs)
    }

    /// Panics if the object's magic has been stomped.
    pub fn debug_validate(&self) {
        if self.magic != OBJECT_MAGIC {
            panic!("kernel object overwritten");
        }
    }

    /// Marks every queued waiter `target_deleted` and makes it runnable.
    /// Called when the object's last handle goes away, and again (as a
    /// no-op on an empty queue) when the object is physically dropped.
    pub(crate) fn notify_deleted(&self) {
        let need_switch = critical_section::with(|cs| {
            sched::with_sched(cs, |sched| {
                // Safety: single-borrow discipline; `wake_all_deleted` does
                // not reach back into this cell.
                unsafe {
                    self.wait_queue.with_mut(cs, |q| {
                        sched.wake_all_deleted(cs, q)
                    })
                }
            })
        });
        if need_switch {
            crate::arch::request_context_switch();
        }
    }
}

impl Drop for ObjectBase {
    fn drop(&mut self) {
        self.debug_validate();
        self.notify_deleted();
    }
}

/// Capability set of a registered kernel object.
pub trait KernelObject: Send + Sync + 'static {
    fn base(&self) -> &ObjectBase;
    /// Upcast for handle-to-concrete-type recovery; every implementation is
    /// the one-liner `self`.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// The process-wide registry of every handle-named object.
static OBJECTS: GateCell<kerncore::handles::HandleTable<Arc<dyn KernelObject>>> =
    GateCell::new(kerncore::handles::HandleTable::new());

/// Allocates a handle for `obj` and publishes it in the registry. The
/// object's recorded identity is set by its first registration; further
/// registrations (`duplicate_*`) add handles without changing it.
pub fn register_object(
    obj: Arc<dyn KernelObject>,
) -> Result<Handle, KernError> {
    obj.base().debug_validate();
    loop {
        // Top the spare pool up from the heap, with the mask down.
        let needs = critical_section::with(|cs| {
            // Safety: single-borrow discipline.
            unsafe { OBJECTS.with_mut(cs, |t| t.needs_refill()) }
        });
        if needs {
            let spares = kerncore::handles::HandleTable::new_spares();
            let excess = critical_section::with(|cs| {
                // Safety: as above.
                unsafe { OBJECTS.with_mut(cs, |t| t.refill(spares)) }
            });
            // Dropped here, outside the masked region.
            drop(excess);
        }

        let outcome = critical_section::with(|cs| {
            // Safety: as above; the nested cells are distinct.
            unsafe {
                OBJECTS.with_mut(cs, |t| {
                    t.try_alloc().map(|raw| {
                        let handle = Handle(raw as i32);
                        let base = obj.base();
                        if base.handle.get(cs) == Handle::INVALID {
                            base.handle.set(cs, handle);
                        }
                        base.handle_count.update(cs, |n| n + 1);
                        t.set(raw, obj.clone());
                        handle
                    })
                })
            }
        });
        match outcome {
            Ok(handle) => return Ok(handle),
            Err(kerncore::handles::AllocError::NeedSpares) => continue,
            Err(kerncore::handles::AllocError::Exhausted) => {
                return Err(KernError::OutOfMemory)
            }
        }
    }
}

/// Resolves a handle to the object it names, with no type expectations.
pub fn get_object(handle: Handle) -> Option<Arc<dyn KernelObject>> {
    if !handle.is_valid() {
        return None;
    }
    let obj = critical_section::with(|cs| {
        // Safety: single-borrow discipline.
        unsafe { OBJECTS.with_mut(cs, |t| t.get(handle.0 as u32)) }
    })?;
    obj.base().debug_validate();
    Some(obj)
}

/// Resolves a handle and checks its type tag, recovering the concrete
/// object type.
pub fn get_object_of<T: KernelObject>(
    handle: Handle,
    expected: ObjectType,
) -> Option<Arc<T>> {
    let obj = get_object(handle)?;
    if obj.base().object_type() != expected {
        return None;
    }
    obj.as_any().downcast::<T>().ok()
}

/// Frees one handle, after checking its type tag. Returns false for a free,
/// out-of-range, or wrong-type handle. If this was the object's last
/// handle, its waiters are released with `target_deleted` set.
pub fn free_object_handle(handle: Handle, expected: ObjectType) -> bool {
    if !handle.is_valid() {
        return false;
    }
    let removed = critical_section::with(|cs| {
        // Safety: single-borrow discipline; nested cells are distinct.
        unsafe {
            OBJECTS.with_mut(cs, |t| {
                let raw = handle.0 as u32;
                match t.get(raw) {
                    Some(obj) if obj.base().object_type() == expected => {
                        let removed = t.remove(raw);
                        if removed.is_some() {
                            obj.base().handle_count.update(cs, |n| n - 1);
                        }
                        removed.map(|r| {
                            (r, obj.base().handle_count.get(cs) == 0)
                        })
                    }
                    _ => None,
                }
            })
        }
    });

    // Everything evicted from the table -- the object reference, any
    // emptied trie blocks -- is dropped here with the mask released.
    match removed {
        Some((removed, was_last_handle)) => {
            if was_last_handle {
                if let Some(obj) = removed.into_value() {
                    obj.base().notify_deleted();
                }
            }
            true
        }
        None => false,
    }
}

/// Walks the registry in handle order, returning the first object after
/// `prev` that satisfies `pred`.
pub fn get_next_object(
    prev: Option<Handle>,
    mut pred: impl FnMut(&Arc<dyn KernelObject>) -> bool,
) -> Option<(Handle, Arc<dyn KernelObject>)> {
    let prev = match prev {
        Some(h) if h.is_valid() => Some(h.0 as u32),
        Some(_) => None,
        None => None,
    };
    critical_section::with(|cs| {
        // Safety: single-borrow discipline. `pred` must not reach the
        // registry, which no caller in this kernel does.
        unsafe {
            OBJECTS.with_mut(cs, |t| {
                t.get_next(prev, &mut pred)
                    .map(|(raw, obj)| (Handle(raw as i32), obj))
            })
        }
    })
}

/// Resolves `handle` as a `T`, then runs `op` on it. The template for every
/// thin syscall wrapper: on a bad or mistyped handle the result is
/// `InvalidArgument` without `op` running.
pub fn forward_to_handle<T: KernelObject, R>(
    handle: Handle,
    expected: ObjectType,
    op: impl FnOnce(&Arc<T>) -> Result<R, KernError>,
) -> Result<R, KernError> {
    match get_object_of::<T>(handle, expected) {
        Some(obj) => op(&obj),
        None => Err(KernError::InvalidArgument),
    }
}

/// Number of live handles in the registry; used by tests and debug tooling.
pub fn live_handle_count() -> u32 {
    critical_section::with(|cs| {
        // Safety: single-borrow discipline.
        unsafe { OBJECTS.with_mut(cs, |t| t.live_handles()) }
    })
}
