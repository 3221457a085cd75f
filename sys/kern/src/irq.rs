// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interrupt-mask gate.
//!
//! Every critical section in the kernel raises the minimum interrupt
//! priority the CPU will accept, rather than disabling interrupts outright:
//! the "normal-latency" band (kernel entry points and ordinary device IRQs)
//! goes quiet while the "low-latency" band (hard real-time IRQs) keeps
//! running. The corollary is that low-latency handlers may not touch kernel
//! data structures; the type-level enforcement of that rule is that all such
//! structures are only reachable with a `CriticalSection` token, and only
//! the gate here produces one.
//!
//! Three doors in:
//!
//! - `critical_section::with(|cs| ...)` -- the normal one. The
//!   `critical-section` implementation installed below raises the mask to
//!   the normal-latency ceiling and restores on exit, nesting included.
//! - [`InterruptGuard`] -- scoped, movable guard for code whose critical
//!   region doesn't nest lexically.
//! - [`disable_interrupts`] / [`restore_interrupts`] -- the raw pair,
//!   re-exported from `arch` for the rare paths (startup, context switch)
//!   that manage the mask by hand.

use core::cell::UnsafeCell;

pub use crate::arch::{
    disable_interrupts, disable_low_latency_interrupts, restore_interrupts,
};

/// Coarse classification of the current interrupt mask, for introspection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqEnableState {
    /// All interrupt bands delivered.
    Enabled,
    /// Normal-latency band masked; low-latency interrupts still delivered.
    /// This is the state inside every kernel critical section.
    NormalLatencyDisabled,
    /// Everything maskable masked. Only used by hard real-time driver code.
    LowLatencyDisabled,
}

/// Reports the current mask state.
pub fn interrupt_enabled_state() -> IrqEnableState {
    crate::arch::classify_mask(crate::arch::interrupt_mask_raw())
}

/// Scoped interrupt masking: acquires on construction, restores on drop,
/// on every exit path. Moving the guard transfers the restore obligation;
/// there is deliberately no way to copy one.
pub struct InterruptGuard {
    prev: u32,
}

impl InterruptGuard {
    /// Masks the normal-latency band.
    pub fn new() -> Self {
        Self {
            prev: disable_interrupts(),
        }
    }

    /// Masks the low-latency band as well. For kernel code this is never
    /// necessary; it exists for drivers with sub-tick deadlines.
    pub fn low_latency() -> Self {
        Self {
            prev: disable_low_latency_interrupts(),
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        restore_interrupts(self.prev);
    }
}

/// The `critical-section` implementation: BASEPRI-based, band-aware.
///
/// `acquire` returns whether this section is the outermost one. Inner
/// sections observe the mask already at (or above) the kernel ceiling and
/// leave it alone, so nesting costs two register reads.
#[cfg(target_os = "none")]
struct KernelCriticalSection;

#[cfg(target_os = "none")]
critical_section::set_impl!(KernelCriticalSection);

#[cfg(target_os = "none")]
unsafe impl critical_section::Impl for KernelCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        let raw = crate::arch::interrupt_mask_raw();
        match crate::arch::classify_mask(raw) {
            IrqEnableState::Enabled => {
                disable_interrupts();
                true
            }
            // Already at least as strict as the kernel ceiling.
            _ => false,
        }
    }

    unsafe fn release(outermost: critical_section::RawRestoreState) {
        if outermost {
            restore_interrupts(crate::arch::MASK_RAW_ENABLED);
        }
    }
}

/// A cell whose contents may only be touched with the interrupt mask
/// raised, i.e. inside `critical_section::with`.
///
/// On this single-core system, holding a `CriticalSection` token means
/// nothing else -- no thread, no kernel-band interrupt -- can be mid-access,
/// which is what makes the shared-access methods sound. What the token can
/// *not* rule out is the same call stack borrowing one cell twice, so the
/// exclusive accessor is `unsafe` and the kernel observes a single-borrow
/// discipline: each entry point touches each cell at most once at a time.
pub(crate) struct GateCell<T>(UnsafeCell<T>);

// Safety: access requires a CriticalSection token, which serializes all
// accessors on this single-core system.
unsafe impl<T: Send> Sync for GateCell<T> {}

impl<T> GateCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Direct access through exclusive ownership; no token needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }

    /// Runs `body` with exclusive access to the contents.
    ///
    /// # Safety
    ///
    /// The caller must not re-enter `with_mut` (or call `get`/`set`) on this
    /// same cell from inside `body`.
    pub unsafe fn with_mut<R>(
        &self,
        _cs: critical_section::CriticalSection<'_>,
        body: impl FnOnce(&mut T) -> R,
    ) -> R {
        body(unsafe { &mut *self.0.get() })
    }
}

impl<T: Copy> GateCell<T> {
    pub fn get(&self, _cs: critical_section::CriticalSection<'_>) -> T {
        // Safety: the token serializes accessors; `with_mut`'s contract
        // forbids overlapping a borrow with this read.
        unsafe { *self.0.get() }
    }

    pub fn set(&self, _cs: critical_section::CriticalSection<'_>, value: T) {
        // Safety: as for `get`.
        unsafe {
            *self.0.get() = value;
        }
    }

    pub fn update(
        &self,
        cs: critical_section::CriticalSection<'_>,
        f: impl FnOnce(T) -> T,
    ) {
        self.set(cs, f(self.get(cs)));
    }
}
