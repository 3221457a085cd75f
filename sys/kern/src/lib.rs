// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel core: scheduler, handle-named kernel objects, and synchronization.
//!
//! This crate is the part of the operating system that juggles the three
//! concurrency domains of a small ARM-M system: preemptible threads,
//! interrupt handlers, and the PendSV context-switch trampoline that runs
//! with the kernel interrupt band masked.
//!
//! # Design principles
//!
//! 1. Threads, stacks, and kernel objects are dynamic: they come from the
//!    heap at spawn/create time, and handles name them through a sparse
//!    table. But the heap is *never* touched while the interrupt mask is
//!    raised -- everything that must happen under the mask runs on
//!    pre-allocated storage (intrusive lists through stack-resident wait
//!    nodes, a topped-up spare-block pool in the handle table).
//! 2. One door to shared state. All kernel data structures are reached
//!    through `critical_section::with`, whose implementation here raises
//!    BASEPRI to the normal-latency ceiling. Low-latency interrupts stay
//!    live and simply may not touch kernel structures.
//! 3. A preference for simple and clear algorithms over fast and clever
//!    ones. Ready queues are per-priority FIFOs; the sleep queue is a sorted
//!    linear list; the context switch is the textbook PendSV sequence.
//! 4. Portability for testability: everything outside `arch` also compiles
//!    for the host, where `arch::fake` supplies a settable clock and
//!    recorded context-switch requests so the scheduler and the sync
//!    primitives can be unit tested off target.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

#[macro_use]
pub mod arch;

pub mod err;
pub mod fail;
pub mod irq;
pub mod object;
pub mod sched;
pub mod signal;
pub mod startup;
pub mod sync;
pub mod syscalls;
#[cfg(test)]
mod testutil;
pub mod thread;
pub mod time;
pub mod tls;
pub mod wait;
