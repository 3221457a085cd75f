// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the architecture layer, used to unit test the portable
//! kernel off target.
//!
//! Actual mutual exclusion on the host comes from the `critical-section`
//! crate's `std` implementation (enabled by the dev-dependency); the mask
//! functions here just track state so introspection and nesting logic can be
//! exercised. The clock is a settable variable, and context-switch requests
//! are counted instead of performed so tests can assert on them.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::irq::IrqEnableState;
use crate::thread::ThreadEntryPoint;
use crate::time::Timestamp;

macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($v1:expr, $v2:expr) => {
        assert_eq!($v1, $v2)
    };
}

/// Raw mask value meaning "everything enabled".
pub const MASK_RAW_ENABLED: u32 = 0;

static MASK_STATE: AtomicU32 = AtomicU32::new(MASK_RAW_ENABLED);
static NOW_NANOS: AtomicU64 = AtomicU64::new(0);
static SWITCH_REQUESTS: AtomicUsize = AtomicUsize::new(0);

pub fn interrupt_mask_raw() -> u32 {
    MASK_STATE.load(Ordering::Relaxed)
}

pub fn classify_mask(raw: u32) -> IrqEnableState {
    match raw {
        0 => IrqEnableState::Enabled,
        1 => IrqEnableState::NormalLatencyDisabled,
        _ => IrqEnableState::LowLatencyDisabled,
    }
}

pub fn disable_interrupts() -> u32 {
    MASK_STATE.swap(1, Ordering::Relaxed)
}

pub fn disable_low_latency_interrupts() -> u32 {
    MASK_STATE.swap(2, Ordering::Relaxed)
}

pub fn restore_interrupts(state: u32) {
    MASK_STATE.store(state, Ordering::Relaxed);
}

/// Records the request; tests observe it via
/// [`take_context_switch_requests`].
pub fn request_context_switch() {
    SWITCH_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

/// Returns and clears the number of context switches requested since the
/// last call.
pub fn take_context_switch_requests() -> usize {
    SWITCH_REQUESTS.swap(0, Ordering::Relaxed)
}

pub fn now() -> Timestamp {
    Timestamp::from(NOW_NANOS.load(Ordering::Relaxed))
}

/// Sets the fake clock.
pub fn set_time(t: Timestamp) {
    NOW_NANOS.store(t.into(), Ordering::Relaxed);
}

/// Advances the fake clock.
pub fn advance_time(nanos: u64) {
    NOW_NANOS.fetch_add(nanos, Ordering::Relaxed);
}

/// No synthetic frame on the host; a "suspended" fake thread just remembers
/// its stack top.
pub fn initialize_stack(
    stack_top: usize,
    _entry: ThreadEntryPoint,
    _arg: *mut c_void,
) -> usize {
    stack_top
}

pub fn start_first_thread(_tick_reload: u32, _bootstrap_sp: usize) -> ! {
    panic!("context switching is not available on the host");
}

/// There is no process stack pointer on the host; report "plenty of room"
/// so stack checks stay quiet in tests.
pub fn thread_stack_pointer() -> usize {
    usize::MAX
}

pub fn wait_for_interrupt() {
    std::thread::yield_now();
}
