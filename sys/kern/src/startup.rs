// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler startup, and the two threads the kernel runs for itself.
//!
//! The boot path plays one trick worth understanding: the idle thread is
//! installed as "current" before any thread has actually run, so the very
//! first context switch has a place to dump the bootstrap CPU context --
//! the idle thread's brand-new stack, whose contents nobody needs. The
//! init thread, which that first switch lands in, then rewrites the idle
//! thread's stack with a real entry context before anyone could possibly
//! schedule it (init outranks idle by construction). From then on nothing
//! is special: idle spins in WFI at the bottom priority, init reaps
//! zombies.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use abi::{ObjectType, Priority, ThreadState, THREAD_PRIORITY_MIN};
use kerncore::list::List;
use unwrap_lite::UnwrapLite;

use crate::object;
use crate::sched;
use crate::syscalls;
use crate::thread::ThreadCb;

/// The idle thread does nothing but WFI; it needs stack for one exception
/// frame and change.
const IDLE_STACK_SIZE: usize = 1024;

extern "C" {
    /// Application entry point, called on the main thread once the kernel
    /// is up. Supplied by the application crate.
    fn application_main();
}

/// The idle thread, kept here so init can rebuild its stack at boot.
static IDLE_THREAD: AtomicPtr<ThreadCb> = AtomicPtr::new(ptr::null_mut());

extern "C" fn idle_thread_entry(_args: *mut c_void) {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

extern "C" fn main_thread_entry(_args: *mut c_void) {
    // Safety: the application promises to define this; the linker enforces
    // it.
    unsafe {
        application_main();
    }
    // Falling out of the entry point lands in the exit trampoline.
}

extern "C" fn init_thread_entry(_args: *mut c_void) {
    let thread = sched::current_thread();

    // We are the first thread ever scheduled, which means the bootstrap
    // context was just dumped on the idle thread's stack. Replace it with
    // idle's real entry context before idle can run (it can't -- we
    // outrank it).
    let idle = IDLE_THREAD.load(Ordering::Relaxed);
    // Safety: set once during startup, pinned forever by the handle table.
    let idle = unsafe { idle.as_ref() }.unwrap_lite();
    idle.initialize_stack(idle_thread_entry, ptr::null_mut());

    let main_stack = sched::MAIN_STACK_SIZE.load(Ordering::Relaxed);
    let main = syscalls::spawn_thread(
        "main_thread",
        main_thread_entry,
        0,
        ptr::null_mut(),
        false,
        main_stack,
    );
    uassert!(main.is_valid());
    klog!("kernel up, main thread spawned");

    // Reap detached zombies forever.
    loop {
        let mut doomed: List<ThreadCb> = List::new();
        critical_section::with(|cs| {
            sched::with_sched(cs, |s| s.drain_zombies(&mut doomed));
        });
        loop {
            // Safety: `doomed` is ours alone; nothing else links or walks
            // these control blocks once they left the zombie list.
            let Some(z) = (unsafe { doomed.pop_front() }) else {
                break;
            };
            // Safety: still pinned by the handle table until the free
            // below.
            let z = unsafe { z.as_ref() };
            let handle = critical_section::with(|cs| {
                z.set_state(cs, ThreadState::Deleted);
                z.handle(cs)
            });
            // Dropping the last handle releases the control block and its
            // stack, out here where the allocator is fair game.
            object::free_object_handle(handle, ObjectType::Thread);
        }
        critical_section::with(|cs| {
            sched::with_sched(cs, |s| {
                if !s.has_zombies() {
                    thread.set_state(cs, ThreadState::Waiting);
                    crate::arch::request_context_switch();
                }
            });
        });
        // If we parked above, we resume here when the next zombie arrives.
    }
}

/// Brings the scheduler up and never returns. `core_frequency_hz` drives
/// the 1 kHz tick; `main_stack_size` (0 = default) sizes the main thread's
/// stack, on which `application_main` will run.
pub fn start_scheduler(core_frequency_hz: u32, main_stack_size: usize) -> ! {
    klog!("starting scheduler");
    sched::MAIN_STACK_SIZE.store(main_stack_size, Ordering::Relaxed);

    let idle = ThreadCb::new(
        "idle",
        Priority(THREAD_PRIORITY_MIN as i8),
        abi::DetachState::Detached,
        IDLE_STACK_SIZE,
    )
    .expect_lite("out of memory booting the scheduler");
    object::register_object(idle.clone())
        .expect_lite("out of memory booting the scheduler");

    // The bootstrap fiction: idle is "running" so the first switch can
    // save the doomed boot context into it. Its stack is rebuilt by init
    // before it ever actually runs.
    critical_section::with(|cs| {
        idle.set_state(cs, ThreadState::Running);
    });
    sched::set_current_thread(&idle);
    IDLE_THREAD.store(
        &*idle as *const _ as *mut ThreadCb,
        Ordering::Relaxed,
    );

    let init_handle = syscalls::spawn_thread(
        "init",
        init_thread_entry,
        0,
        ptr::null_mut(),
        false,
        0,
    );
    uassert!(init_handle.is_valid());
    let init = sched::get_thread(init_handle).unwrap_lite();
    sched::set_init_thread(&init);

    let tick_reload = core_frequency_hz / 1_000 - 1;
    crate::arch::start_first_thread(tick_reload, idle.stack_top());
}
