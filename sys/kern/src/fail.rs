// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel failures where a debugger can find them.
//!
//! Invariant violations in this kernel are fatal: there is no unwinding and
//! no recovery, because a broken ready list or a dangling wait node cannot
//! be reasoned about after the fact. What we *can* do is leave a legible
//! note. This module defines two symbols for tooling:
//!
//! - `KERNEL_HAS_FAILED`: a `bool`, cleared at boot, set on the way down.
//! - `KERNEL_EPITAPH`: a fixed buffer receiving as much of the panic message
//!   (as UTF-8) as fits; trailing NULs pad the rest.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

/// One-stop flag for triage tooling.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 128;

#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: this function is reached at most once per boot outside of a
    // recursive panic, which the flag check below turns into a parked loop
    // instead of an overwrite.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Panic during panic reporting; stop making things worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: the flag ensures a single execution gets here, so the mutable
    // reference is exclusive.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` and parks the system. This is the terminal stop for every
/// kernel invariant violation.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut chiseler = Chiseler { dest: buf };
    write!(chiseler, "{msg}").ok();

    loop {
        // Platform-independent NOP.
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// `fmt::Write` sink that fills the epitaph buffer and silently discards
/// overflow.
struct Chiseler {
    dest: &'static mut [u8],
}

impl Write for Chiseler {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
