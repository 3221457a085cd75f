// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public syscall surface.
//!
//! There is no trap instruction behind these: the system runs in one flat,
//! privileged address space, so a "syscall" is an ordinary function call.
//! The wrappers are deliberately thin -- resolve the handle, check the type
//! tag, forward to the object -- and uniform about errors: `-1` (or an
//! invalid handle) comes back with the reason in the calling thread's
//! errno. The real work lives in `sched` and `sync`.
//!
//! Thread lifecycle calls (`spawn_thread`, `wait_thread`, the snoozes) are
//! implemented here directly; they are scheduler operations with no object
//! method to forward to.

use alloc::sync::Arc;
use core::ffi::c_void;

use abi::{
    DetachState, Handle, KernError, ObjectType, Priority, SigAction,
    SigMaskHow, SignalSet, ThreadState, THREAD_PRIORITY_MAX,
    THREAD_PRIORITY_MIN,
};

use crate::err::{handle_from, status_from, value_from};
use crate::object::{self, forward_to_handle, KernelObject};
use crate::sched;
use crate::signal;
use crate::sync::{CondVar, Mutex, Semaphore};
use crate::thread::{ThreadCb, ThreadEntryPoint};
use crate::time::Timestamp;
use crate::tls;
use crate::wait::WaitNode;

/// Shorthand for the blocking-call epilogue: deliver any signal handlers
/// the interruption was for, then surface the error.
fn interrupted<T>(e: KernError) -> Result<T, KernError> {
    if e == KernError::Interrupted {
        signal::process_pending_signals();
    }
    Err(e)
}

// --- Threads ---------------------------------------------------------------

/// Creates a thread and makes it runnable. Returns its handle, or
/// `Handle::INVALID` with errno set.
pub fn spawn_thread(
    name: &str,
    entry: ThreadEntryPoint,
    priority: i32,
    args: *mut c_void,
    joinable: bool,
    stack_size: usize,
) -> Handle {
    handle_from(spawn_thread_inner(
        name, entry, priority, args, joinable, stack_size,
    ))
}

fn spawn_thread_inner(
    name: &str,
    entry: ThreadEntryPoint,
    priority: i32,
    args: *mut c_void,
    joinable: bool,
    stack_size: usize,
) -> Result<Handle, KernError> {
    let priority = Priority(
        priority.clamp(THREAD_PRIORITY_MIN, THREAD_PRIORITY_MAX) as i8,
    );
    let detach = if joinable {
        DetachState::Joinable
    } else {
        DetachState::Detached
    };
    let thread = ThreadCb::new(name, priority, detach, stack_size)?;
    thread.initialize_stack(entry, args);
    let handle = object::register_object(thread.clone())?;
    let need_switch = critical_section::with(|cs| {
        sched::with_sched(cs, |s| s.make_ready(cs, &thread));
        thread.priority_level(cs) > sched::current_priority_level(cs)
    });
    if need_switch {
        crate::arch::request_context_switch();
    }
    Ok(handle)
}

/// Terminates the calling thread. TLS destructors run first, on the dying
/// thread's own stack; the control block and stack are reclaimed later, by
/// the init thread (detached) or the joiner (joinable).
pub fn exit_thread(return_code: i32) -> ! {
    let thread = sched::current_thread();
    tls::run_destructors(thread);
    critical_section::with(|cs| {
        thread.set_return_value(cs, return_code);
        thread.set_state(cs, ThreadState::Zombie);
    });
    crate::arch::request_context_switch();
    // The switch fires as soon as the mask is down (it is). Running any
    // further means the scheduler resumed a zombie.
    panic!("exit_thread() survived a context switch");
}

/// Waits for `handle`'s thread to exit and collects its return code; frees
/// the handle on success.
pub fn wait_thread(handle: Handle) -> i32 {
    value_from(wait_thread_inner(handle))
}

fn wait_thread_inner(handle: Handle) -> Result<i32, KernError> {
    let thread = sched::current_thread();
    loop {
        let child = sched::get_thread(handle)
            .ok_or(KernError::InvalidArgument)?;

        let node = WaitNode::new(thread);
        let queued = critical_section::with(|cs| {
            match child.state(cs) {
                ThreadState::Deleted => {
                    // Another joiner beat us to the corpse.
                    return Err(KernError::InvalidArgument);
                }
                ThreadState::Zombie => return Ok(false),
                _ => {}
            }
            // Safety: single-borrow discipline; fresh node.
            unsafe {
                child
                    .base()
                    .wait_queue
                    .with_mut(cs, |q| q.push_back((&node).into()));
            }
            thread.set_blocking_object(cs, handle);
            thread.set_state(cs, ThreadState::Waiting);
            crate::arch::request_context_switch();
            Ok(true)
        })?;

        if queued {
            // Suspended until the child exits (or is deleted, or a signal
            // lands).
            let (deleted, zombie) = critical_section::with(|cs| {
                node.detach(cs);
                thread.set_blocking_object(cs, Handle::INVALID);
                (
                    node.target_deleted()
                        || child.state(cs) == ThreadState::Deleted,
                    child.state(cs) == ThreadState::Zombie,
                )
            });
            if deleted {
                return Err(KernError::InvalidArgument);
            }
            if !zombie {
                // Interrupted or spurious.
                if critical_section::with(|cs| thread.wants_restart(cs)) {
                    continue;
                }
                return interrupted(KernError::Interrupted);
            }
        }

        let return_code =
            critical_section::with(|cs| child.return_value(cs));
        critical_section::with(|cs| {
            child.set_state(cs, ThreadState::Deleted);
        });
        object::free_object_handle(handle, ObjectType::Thread);
        return Ok(return_code);
    }
}

/// Makes a sleeping thread (and, optionally, one blocked on an object)
/// runnable early. Its blocking call returns `Interrupted` or restarts, per
/// its signal dispositions.
pub fn wakeup_thread(handle: Handle, include_waiting: bool) -> i32 {
    status_from(sched::wakeup_thread(handle, include_waiting))
}

/// Handle of the calling thread.
pub fn get_thread_id() -> Handle {
    critical_section::with(|cs| sched::current_thread().handle(cs))
}

/// Round-robin courtesy: asks for a context switch and returns.
pub fn thread_yield() -> i32 {
    crate::arch::request_context_switch();
    0
}

/// Application-visible priority of `handle`'s thread.
pub fn get_thread_priority(handle: Handle) -> i32 {
    value_from(
        forward_to_handle(handle, ObjectType::Thread, |t: &Arc<ThreadCb>| {
            Ok(critical_section::with(|cs| t.priority(cs).0 as i32))
        }),
    )
}

/// Re-prioritizes `handle`'s thread, re-queueing it if it's on a ready
/// list.
pub fn set_thread_priority(handle: Handle, priority: i32) -> i32 {
    let clamped = Priority(
        priority.clamp(THREAD_PRIORITY_MIN, THREAD_PRIORITY_MAX) as i8,
    );
    status_from(forward_to_handle(
        handle,
        ObjectType::Thread,
        |t: &Arc<ThreadCb>| {
            critical_section::with(|cs| {
                sched::with_sched(cs, |s| {
                    s.requeue_ready(cs, t, clamped.level())
                });
            });
            Ok(())
        },
    ))
}

/// Walks the thread table in handle order; `Handle::INVALID` starts over.
/// Returns the next live thread's handle, or `INVALID` when the walk is
/// done.
pub fn get_next_thread(prev: Handle) -> Handle {
    let prev = if prev == Handle::INVALID { None } else { Some(prev) };
    object::get_next_object(prev, |obj| {
        obj.base().object_type() == ObjectType::Thread
    })
    .map(|(h, _)| h)
    .unwrap_or(Handle::INVALID)
}

/// Bytes of stack left below the calling thread's stack pointer.
pub fn get_remaining_stack() -> i32 {
    let thread = sched::current_thread();
    let sp = crate::arch::thread_stack_pointer();
    sp.saturating_sub(thread.stack_limit())
        .min(i32::MAX as usize) as i32
}

/// Panics if the calling thread is within 100 bytes of overflow. Sprinkled
/// through deep driver call paths during bring-up.
pub fn check_stack_overflow() {
    if get_remaining_stack() < 100 {
        panic!("stack overflow imminent in '{}'", sched::current_thread().name());
    }
}

// --- Sleeping --------------------------------------------------------------

/// Suspends the calling thread for at least `nanos` nanoseconds.
pub fn snooze(nanos: u64) -> i32 {
    snooze_until_timestamp(crate::arch::now().saturating_add_nanos(nanos))
}

/// Suspends the calling thread until the monotonic clock reads at least
/// `deadline` nanoseconds.
pub fn snooze_until(deadline: u64) -> i32 {
    snooze_until_timestamp(Timestamp::from(deadline))
}

fn snooze_until_timestamp(deadline: Timestamp) -> i32 {
    status_from(snooze_inner(deadline))
}

fn snooze_inner(deadline: Timestamp) -> Result<(), KernError> {
    let thread = sched::current_thread();
    let node = WaitNode::new(thread);
    node.set_resume_time(deadline);

    critical_section::with(|cs| {
        sched::with_sched(cs, |s| s.add_to_sleep_queue(cs, &node));
        thread.set_state(cs, ThreadState::Sleeping);
        crate::arch::request_context_switch();
    });
    // Suspended until the deadline tick, or an early wake.
    critical_section::with(|cs| node.detach(cs));
    if crate::arch::now() >= deadline {
        Ok(())
    } else {
        // Early wake: wakeup_thread or a signal got us. Either way the
        // caller learns the sleep was cut short.
        interrupted(KernError::Interrupted)
    }
}

// --- Semaphores ------------------------------------------------------------

/// Creates a counting semaphore. `recursive` lets the holding thread
/// re-acquire without permits.
pub fn create_semaphore(
    name: &str,
    initial_count: u32,
    recursive: bool,
) -> Handle {
    handle_from(object::register_object(Semaphore::new(
        name,
        initial_count,
        recursive,
    )))
}

/// Registers a second handle for an existing semaphore.
pub fn duplicate_semaphore(handle: Handle) -> Handle {
    handle_from(duplicate_inner::<Semaphore>(handle, ObjectType::Semaphore))
}

fn duplicate_inner<T: KernelObject>(
    handle: Handle,
    ty: ObjectType,
) -> Result<Handle, KernError> {
    let obj = object::get_object_of::<T>(handle, ty)
        .ok_or(KernError::InvalidArgument)?;
    object::register_object(obj)
}

/// Drops one handle; the semaphore dies with its last handle, waking any
/// waiters with `EINVAL`.
pub fn delete_semaphore(handle: Handle) -> i32 {
    status_from(delete_inner(handle, ObjectType::Semaphore))
}

fn delete_inner(handle: Handle, ty: ObjectType) -> Result<(), KernError> {
    if object::free_object_handle(handle, ty) {
        Ok(())
    } else {
        Err(KernError::InvalidArgument)
    }
}

pub fn acquire_semaphore(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Semaphore,
        |s: &Arc<Semaphore>| s.acquire().or_else(interrupted),
    ))
}

pub fn acquire_semaphore_timeout(handle: Handle, nanos: u64) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Semaphore,
        |s: &Arc<Semaphore>| s.acquire_timeout(nanos).or_else(interrupted),
    ))
}

pub fn acquire_semaphore_deadline(handle: Handle, deadline: u64) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Semaphore,
        |s: &Arc<Semaphore>| {
            s.acquire_deadline(Timestamp::from(deadline))
                .or_else(interrupted)
        },
    ))
}

pub fn try_acquire_semaphore(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Semaphore,
        |s: &Arc<Semaphore>| s.try_acquire(),
    ))
}

pub fn release_semaphore(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Semaphore,
        |s: &Arc<Semaphore>| s.release(),
    ))
}

/// Current permit count, for diagnostics.
pub fn get_semaphore_count(handle: Handle) -> i32 {
    value_from(forward_to_handle(
        handle,
        ObjectType::Semaphore,
        |s: &Arc<Semaphore>| Ok(s.count().min(i32::MAX as u32) as i32),
    ))
}

// --- Mutexes ---------------------------------------------------------------

pub fn create_mutex(name: &str, recursive: bool) -> Handle {
    handle_from(object::register_object(Mutex::new(name, recursive)))
}

pub fn duplicate_mutex(handle: Handle) -> Handle {
    handle_from(duplicate_inner::<Mutex>(handle, ObjectType::Mutex))
}

pub fn delete_mutex(handle: Handle) -> i32 {
    status_from(delete_inner(handle, ObjectType::Mutex))
}

pub fn lock_mutex(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.lock().or_else(interrupted),
    ))
}

pub fn lock_mutex_timeout(handle: Handle, nanos: u64) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.lock_timeout(nanos).or_else(interrupted),
    ))
}

pub fn lock_mutex_deadline(handle: Handle, deadline: u64) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| {
            m.lock_deadline(Timestamp::from(deadline)).or_else(interrupted)
        },
    ))
}

pub fn try_lock_mutex(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.try_lock(),
    ))
}

pub fn unlock_mutex(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.unlock(),
    ))
}

pub fn lock_mutex_shared(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.lock_shared().or_else(interrupted),
    ))
}

pub fn lock_mutex_shared_timeout(handle: Handle, nanos: u64) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.lock_shared_timeout(nanos).or_else(interrupted),
    ))
}

pub fn lock_mutex_shared_deadline(handle: Handle, deadline: u64) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| {
            m.lock_shared_deadline(Timestamp::from(deadline))
                .or_else(interrupted)
        },
    ))
}

pub fn try_lock_mutex_shared(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.try_lock_shared(),
    ))
}

pub fn unlock_mutex_shared(handle: Handle) -> i32 {
    status_from(forward_to_handle(
        handle,
        ObjectType::Mutex,
        |m: &Arc<Mutex>| m.unlock_shared(),
    ))
}

// --- Condition variables ---------------------------------------------------

pub fn create_condition_variable(name: &str) -> Handle {
    handle_from(object::register_object(CondVar::new(name)))
}

pub fn duplicate_condition_variable(handle: Handle) -> Handle {
    handle_from(duplicate_inner::<CondVar>(
        handle,
        ObjectType::ConditionVariable,
    ))
}

pub fn delete_condition_variable(handle: Handle) -> i32 {
    status_from(delete_inner(handle, ObjectType::ConditionVariable))
}

fn with_cv_and_mutex(
    cv_handle: Handle,
    mutex_handle: Handle,
    op: impl FnOnce(&Arc<CondVar>, &Arc<Mutex>) -> Result<(), KernError>,
) -> Result<(), KernError> {
    let cv = object::get_object_of::<CondVar>(
        cv_handle,
        ObjectType::ConditionVariable,
    )
    .ok_or(KernError::InvalidArgument)?;
    let mutex = object::get_object_of::<Mutex>(mutex_handle, ObjectType::Mutex)
        .ok_or(KernError::InvalidArgument)?;
    op(&cv, &mutex)
}

pub fn cv_wait(cv_handle: Handle, mutex_handle: Handle) -> i32 {
    status_from(with_cv_and_mutex(cv_handle, mutex_handle, |cv, m| {
        cv.wait(m, None).or_else(interrupted)
    }))
}

pub fn cv_wait_timeout(
    cv_handle: Handle,
    mutex_handle: Handle,
    nanos: u64,
) -> i32 {
    status_from(with_cv_and_mutex(cv_handle, mutex_handle, |cv, m| {
        cv.wait_timeout(m, nanos).or_else(interrupted)
    }))
}

pub fn cv_wait_deadline(
    cv_handle: Handle,
    mutex_handle: Handle,
    deadline: u64,
) -> i32 {
    status_from(with_cv_and_mutex(cv_handle, mutex_handle, |cv, m| {
        cv.wait(m, Some(Timestamp::from(deadline))).or_else(interrupted)
    }))
}

pub fn cv_notify_one(cv_handle: Handle) -> i32 {
    status_from(forward_to_handle(
        cv_handle,
        ObjectType::ConditionVariable,
        |cv: &Arc<CondVar>| cv.notify_one(),
    ))
}

pub fn cv_notify_all(cv_handle: Handle) -> i32 {
    status_from(forward_to_handle(
        cv_handle,
        ObjectType::ConditionVariable,
        |cv: &Arc<CondVar>| cv.notify_all(),
    ))
}

// --- Signals ---------------------------------------------------------------

pub fn send_signal(handle: Handle, signum: u32) -> i32 {
    status_from(signal::send_signal(handle, signum))
}

pub fn send_signal_value(handle: Handle, signum: u32, value: usize) -> i32 {
    status_from(signal::send_signal_value(handle, signum, value))
}

/// Adjusts the calling thread's blocked-signal mask; the previous mask is
/// written through `old` when provided.
pub fn set_signal_mask(
    how: SigMaskHow,
    set: SignalSet,
    old: Option<&mut SignalSet>,
) -> i32 {
    status_from(signal::set_signal_mask(how, set).map(|prev| {
        if let Some(old) = old {
            *old = prev;
        }
    }))
}

/// Installs a per-thread signal action; the previous action is written
/// through `old` when provided.
pub fn set_signal_action(
    signum: u32,
    action: SigAction,
    old: Option<&mut SigAction>,
) -> i32 {
    status_from(signal::set_signal_action(signum, action).map(|prev| {
        if let Some(old) = old {
            *old = prev;
        }
    }))
}

// --- Thread-local storage --------------------------------------------------

/// Allocates a TLS key; returns the key or `-1`.
pub fn tls_alloc(destructor: Option<tls::TlsDestructor>) -> i32 {
    value_from(tls::tls_alloc(destructor).map(|k| k as i32))
}

pub fn tls_free(key: usize) -> i32 {
    status_from(tls::tls_free(key))
}

pub fn tls_set(key: usize, value: *mut c_void) -> i32 {
    status_from(tls::tls_set(key, value))
}

pub fn tls_get(key: usize) -> *mut c_void {
    tls::tls_get(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::err::get_last_error;
    use crate::testutil::install_current;

    #[test]
    fn semaphore_surface_round_trip() {
        let _cur = install_current("cur", 0);
        let h = create_semaphore("s", 1, false);
        assert!(h.is_valid());
        assert_eq!(try_acquire_semaphore(h), 0);
        assert_eq!(get_semaphore_count(h), 0);
        assert_eq!(try_acquire_semaphore(h), -1);
        assert_eq!(get_last_error(), abi::EWOULDBLOCK);
        assert_eq!(release_semaphore(h), 0);
        assert_eq!(get_semaphore_count(h), 1);
        assert_eq!(delete_semaphore(h), 0);
        // Gone now.
        assert_eq!(release_semaphore(h), -1);
        assert_eq!(get_last_error(), abi::EINVAL);
    }

    #[test]
    fn type_tags_are_enforced() {
        let _cur = install_current("cur", 0);
        let sem = create_semaphore("s", 0, false);
        let mtx = create_mutex("m", false);
        // Cross-type operations are refused with EINVAL.
        assert_eq!(lock_mutex(sem), -1);
        assert_eq!(get_last_error(), abi::EINVAL);
        assert_eq!(release_semaphore(mtx), -1);
        assert_eq!(get_last_error(), abi::EINVAL);
        // And so is cross-type deletion.
        assert_eq!(delete_mutex(sem), -1);
        assert_eq!(delete_semaphore(sem), 0);
        assert_eq!(delete_mutex(mtx), 0);
    }

    #[test]
    fn duplicate_keeps_object_alive_until_last_handle() {
        let _cur = install_current("cur", 0);
        let h1 = create_semaphore("s", 3, false);
        let h2 = duplicate_semaphore(h1);
        assert!(h2.is_valid());
        assert_ne!(h1, h2);
        // Both handles reach the same counter.
        assert_eq!(try_acquire_semaphore(h1), 0);
        assert_eq!(get_semaphore_count(h2), 2);
        // Dropping one handle leaves the object reachable via the other.
        assert_eq!(delete_semaphore(h1), 0);
        assert_eq!(get_semaphore_count(h2), 2);
        assert_eq!(delete_semaphore(h2), 0);
        assert_eq!(get_semaphore_count(h2), -1);
    }

    #[test]
    fn mutex_surface_enforces_ownership() {
        let _cur = install_current("cur", 0);
        let h = create_mutex("m", false);
        assert_eq!(unlock_mutex(h), -1);
        assert_eq!(get_last_error(), abi::EPERM);
        assert_eq!(try_lock_mutex(h), 0);
        assert_eq!(unlock_mutex(h), 0);
        assert_eq!(delete_mutex(h), 0);
    }

    #[test]
    fn registry_round_trip_restores_handle_population() {
        let _cur = install_current("cur", 0);
        let before = object::live_handle_count();
        let h = create_semaphore("s", 0, false);
        assert_eq!(object::live_handle_count(), before + 1);
        assert_eq!(delete_semaphore(h), 0);
        assert_eq!(object::live_handle_count(), before);
    }

    #[test]
    fn deleting_object_with_queued_waiter_fails_it_with_einval() {
        let cur = install_current("cur", 0);
        let h = create_semaphore("s", 0, false);
        let sem = object::get_object_of::<Semaphore>(
            h,
            ObjectType::Semaphore,
        )
        .unwrap();

        // Stand in for a blocked acquirer.
        let waiter = crate::testutil::mkthread("w", 0);
        let node = WaitNode::new(&waiter);
        critical_section::with(|cs| {
            waiter.set_state(cs, ThreadState::Waiting);
            // Safety: mimics the blocking path's enqueue.
            unsafe {
                sem.base()
                    .wait_queue
                    .with_mut(cs, |q| q.push_back((&node).into()));
            }
        });

        assert_eq!(delete_semaphore(h), 0);
        critical_section::with(|cs| {
            assert!(node.target_deleted());
            assert_eq!(waiter.state(cs), ThreadState::Ready);
            // Pull the waiter back off the global ready list.
            unsafe {
                kerncore::list::Link::detach(&*waiter);
            }
        });
        drop(sem);
        drop(cur);
    }

    #[test]
    fn snooze_zero_is_satisfied_immediately() {
        let _cur = install_current("cur", 0);
        crate::arch::set_time(Timestamp::from(7_000_000));
        // Deadline already reached: the sleep "expires" on the spot once
        // the (host-simulated) suspension falls through.
        assert_eq!(snooze_until(7_000_000), 0);
    }

    #[test]
    fn tls_round_trip_with_bad_key_checks() {
        let _cur = install_current("cur", 0);
        let key = tls_alloc(None);
        assert!(key >= 0);
        let mut value = 0xabcdu32;
        assert_eq!(
            tls_set(key as usize, &mut value as *mut u32 as *mut c_void),
            0
        );
        assert_eq!(
            tls_get(key as usize),
            &mut value as *mut u32 as *mut c_void
        );
        assert_eq!(tls_free(key as usize), 0);
        assert_eq!(tls_set(key as usize, core::ptr::null_mut()), -1);
        assert_eq!(get_last_error(), abi::EINVAL);
    }
}
