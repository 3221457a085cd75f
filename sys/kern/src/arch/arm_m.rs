// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv{6,7,8}-M.
//!
//! # Interrupt priority bands
//!
//! The interrupt-mask gate does not disable interrupts globally. NVIC
//! priorities are split into two bands: a low-latency band (numerically 1
//! through 3) reserved for hard real-time handlers that never touch kernel
//! state, and a normal-latency band for everything else, with the kernel's
//! own entry points (PendSV, SysTick) at the very bottom of it. A critical
//! section raises BASEPRI to the top of the normal-latency band, so the
//! low-latency handlers keep their worst-case latency no matter what the
//! kernel is doing. ARMv6-M has no BASEPRI; there the gate falls back to
//! PRIMASK and the low-latency band does not exist.
//!
//! The BASEPRI write is bracketed by PRIMASK and followed by DSB/ISB so the
//! new boundary is architecturally visible before the section's first
//! access.
//!
//! # Context switching
//!
//! Threads never switch synchronously. Every path that wants a switch --
//! syscall-level blocking, the tick, a wakeup from an interrupt -- sets the
//! PendSV pending bit and keeps going; the switch happens when PendSV fires,
//! which, because it is configured at the lowest priority, is only after all
//! other interrupt activity has drained and the mask is fully lowered. This
//! is the standard Cortex-M discipline, and it is what makes "request a
//! switch from inside a critical section" safe and idempotent.
//!
//! PendSV itself saves the registers the hardware didn't (r4-r11, the
//! EXC_RETURN value, and s16-s31 when the interrupted thread was using the
//! FPU) onto the *thread* stack, asks `select_thread` for the stack pointer
//! of the next runnable thread, and unstacks from there. A thread's entire
//! suspended state is thus its stack plus one saved stack-pointer word in
//! its control block.
//!
//! # The kernel clock
//!
//! The system tick timer is only good for periodic interrupts -- its counter
//! is small and counts down -- so the real timestamp lives in the `TICKS`
//! pair below, advanced by one at each 1 kHz SysTick. Readers go through a
//! critical section, which holds SysTick off and makes the two-word read
//! atomic in practice.

use core::arch::global_asm;
use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use unwrap_lite::UnwrapLite;
use zerocopy::IntoBytes as _;
use zerocopy_derive::{Immutable, IntoBytes, KnownLayout};

use crate::irq::IrqEnableState;
use crate::thread::ThreadEntryPoint;
use crate::time::{Timestamp, NANOS_PER_TICK};

/// At the moment, there are two (architecture-specific) ways to log: via
/// semihosting (the "klog-semihosting" feature) or via the ITM (the
/// "klog-itm" feature). If neither is enabled, klog! is stubbed out.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($v1:expr, $v2:expr) => {
        if !($v1 == $v2) {
            panic!("Assertion failed!");
        }
    };
}

/// Number of implemented NVIC priority bits. STM32H7-class parts have 4;
/// select the `prio-bits-3` feature for parts (e.g. ATSAME70) with 3.
#[cfg(feature = "prio-bits-3")]
const NVIC_PRIO_BITS: u32 = 3;
#[cfg(not(feature = "prio-bits-3"))]
const NVIC_PRIO_BITS: u32 = 4;

/// Most urgent priority of the low-latency band.
const IRQ_PRI_LOW_LATENCY_MAX: u32 = 1;
/// Most urgent priority of the normal-latency band; this is the level
/// BASEPRI is raised to inside a critical section.
const IRQ_PRI_NORMAL_LATENCY_MAX: u32 = 4;
/// Priority of the kernel's own entry points (PendSV, SysTick): the bottom
/// of the normal-latency band, which is the least urgent configurable
/// level.
const IRQ_PRI_KERNEL: u32 = (1 << NVIC_PRIO_BITS) - 1;

/// The band boundaries as raw 8-bit register values.
const fn prio_raw(prio: u32) -> u32 {
    prio << (8 - NVIC_PRIO_BITS)
}

/// Raw mask value meaning "everything enabled".
pub const MASK_RAW_ENABLED: u32 = 0;

cfg_if::cfg_if! {
    if #[cfg(any(armv7m, armv8m))] {
        /// Reads the current raw mask state (BASEPRI).
        pub fn interrupt_mask_raw() -> u32 {
            let raw;
            // Safety: reading BASEPRI has no side effects.
            unsafe {
                core::arch::asm!(
                    "mrs {}, BASEPRI",
                    out(reg) raw,
                    options(nomem, nostack, preserves_flags),
                );
            }
            raw
        }

        fn set_mask_raw(raw: u32) {
            // The PRIMASK bracket makes the BASEPRI update atomic with
            // respect to interrupts, and the barriers make the new boundary
            // take effect before the caller's next access.
            unsafe {
                core::arch::asm!(
                    "cpsid i",
                    "msr BASEPRI, {}",
                    "dsb",
                    "isb",
                    "cpsie i",
                    in(reg) raw,
                    options(nomem, nostack, preserves_flags),
                );
            }
        }

        pub fn classify_mask(raw: u32) -> IrqEnableState {
            if raw == 0 {
                IrqEnableState::Enabled
            } else if raw <= prio_raw(IRQ_PRI_LOW_LATENCY_MAX) {
                IrqEnableState::LowLatencyDisabled
            } else if raw <= prio_raw(IRQ_PRI_NORMAL_LATENCY_MAX) {
                IrqEnableState::NormalLatencyDisabled
            } else {
                // A mask below the kernel band keeps all kernel interrupts
                // deliverable, which is "enabled" as far as the gate cares.
                IrqEnableState::Enabled
            }
        }

        /// Masks the normal-latency band. Returns the prior raw state for
        /// `restore_interrupts`.
        pub fn disable_interrupts() -> u32 {
            let old = interrupt_mask_raw();
            set_mask_raw(prio_raw(IRQ_PRI_NORMAL_LATENCY_MAX));
            old
        }

        /// Masks the low-latency band as well.
        pub fn disable_low_latency_interrupts() -> u32 {
            let old = interrupt_mask_raw();
            set_mask_raw(prio_raw(IRQ_PRI_LOW_LATENCY_MAX));
            old
        }

        pub fn restore_interrupts(state: u32) {
            set_mask_raw(state);
        }
    } else if #[cfg(armv6m)] {
        // No BASEPRI on v6-M: the gate degrades to PRIMASK and the raw
        // state is the prior PRIMASK bit.

        pub fn interrupt_mask_raw() -> u32 {
            let raw: u32;
            unsafe {
                core::arch::asm!(
                    "mrs {}, PRIMASK",
                    out(reg) raw,
                    options(nomem, nostack, preserves_flags),
                );
            }
            raw & 1
        }

        pub fn classify_mask(raw: u32) -> IrqEnableState {
            if raw == 0 {
                IrqEnableState::Enabled
            } else {
                IrqEnableState::NormalLatencyDisabled
            }
        }

        pub fn disable_interrupts() -> u32 {
            let old = interrupt_mask_raw();
            cortex_m::interrupt::disable();
            old
        }

        pub fn disable_low_latency_interrupts() -> u32 {
            disable_interrupts()
        }

        pub fn restore_interrupts(state: u32) {
            if state == 0 {
                // Safety: the caller owned the matching disable.
                unsafe {
                    cortex_m::interrupt::enable();
                }
            }
        }
    } else {
        compile_error!("missing mask support for ARM profile");
    }
}

/// Sets the PendSV pending bit. The switch itself happens once every
/// higher-priority interrupt has drained *and* the caller's critical
/// section, if any, has released the mask. Calling this multiple times
/// before the switch runs is fine; PendSV fires once.
pub fn request_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
    cortex_m::asm::dsb();
}

pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Kernel global tracking the current time in ticks.
///
/// This is a pair of `AtomicU32` because (1) we want the interior mutability
/// of the atomic types but (2) ARMv7-M doesn't have any 64-bit atomic
/// operations. `TICKS[0]` is the least significant half. The SysTick
/// handler is the only writer, and readers hold the mask (which holds
/// SysTick off), so the halves can't be observed mid-update.
static TICKS: [AtomicU32; 2] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const ZERO: AtomicU32 = AtomicU32::new(0);
    [ZERO; 2]
};

/// Reads the kernel clock.
pub fn now() -> Timestamp {
    critical_section::with(|_| {
        let t0 = TICKS[0].load(Ordering::Relaxed);
        let t1 = TICKS[1].load(Ordering::Relaxed);
        let ticks = u64::from(t0) | u64::from(t1) << 32;
        Timestamp::from(ticks * NANOS_PER_TICK)
    })
}

/// Handler that gets linked into the vector table for the System Tick Timer
/// overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    // Advance the kernel's notion of time by adding 1. Laboriously.
    let t0 = TICKS[0].load(Ordering::Relaxed);
    let t1 = TICKS[1].load(Ordering::Relaxed);
    let (t0, t1) = if let Some(t0p) = t0.checked_add(1) {
        TICKS[0].store(t0p, Ordering::Relaxed);
        (t0p, t1)
    } else {
        // Low half rolled over. Checked addition on the high half because
        // overflow there, 584 million years in, would indicate state
        // corruption we'd like to hear about.
        TICKS[0].store(0, Ordering::Relaxed);
        TICKS[1].store(t1 + 1, Ordering::Relaxed);
        (0, t1 + 1)
    };
    let now = Timestamp::from(
        (u64::from(t0) | u64::from(t1) << 32) * NANOS_PER_TICK,
    );

    critical_section::with(|cs| {
        crate::sched::handle_tick(cs, now);
    });

    // Unconditionally take the round-robin lap: equal-priority threads
    // time-slice at tick granularity, and expired sleepers get their shot.
    request_context_switch();
}

/// The Rust side of the PendSV handler: given the stack pointer the
/// interrupted thread was saved at, pick a successor and return its saved
/// stack pointer for the assembly below to unstack.
#[no_mangle]
unsafe extern "C" fn select_thread(current_sp: *mut u32) -> *mut u32 {
    critical_section::with(|cs| {
        crate::sched::select_next(cs, current_sp as usize) as *mut u32
    })
}

cfg_if::cfg_if! {
    if #[cfg(any(armv7m, armv8m))] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, psp
                isb

                @ Bit 4 of EXC_RETURN is clear when the interrupted thread
                @ had an active FPU context; its high registers are ours to
                @ save.
                tst lr, #0x10
                it eq
                vstmdbeq r0!, {{s16-s31}}

                @ High core registers plus EXC_RETURN itself.
                stmdb r0!, {{r4-r11, lr}}

                @ Pick the next thread; r0 in = old SP, r0 out = new SP.
                bl select_thread

                ldmia r0!, {{r4-r11, lr}}

                tst lr, #0x10
                it eq
                vldmiaeq r0!, {{s16-s31}}

                msr psp, r0
                isb
                bx lr
            ",
        }
    } else if #[cfg(armv6m)] {
        global_asm!{"
            .section .text.PendSV
            .globl PendSV
            .type PendSV,function
            PendSV:
                mrs r0, psp
                @ Reserve the 9-word save area: r4-r7, r8-r11, EXC_RETURN.
                subs r0, #36
                mov r1, r0
                stmia r1!, {{r4-r7}}
                mov r4, r8
                mov r5, r9
                mov r6, r10
                mov r7, r11
                stmia r1!, {{r4-r7}}
                mov r4, lr
                stmia r1!, {{r4}}

                bl select_thread

                @ Restore high registers and EXC_RETURN first, while r4-r7
                @ are still free as scratch.
                mov r1, r0
                adds r1, #16
                ldmia r1!, {{r4-r7}}
                mov r8, r4
                mov r9, r5
                mov r10, r6
                mov r11, r7
                ldmia r1!, {{r4}}
                mov lr, r4
                ldmia r0!, {{r4-r7}}
                adds r0, #20
                msr psp, r0
                bx lr
            ",
        }
    } else {
        compile_error!("missing PendSV impl for ARM profile.");
    }
}

/// Stuff the hardware pushes at exception entry (the basic, FPU-less
/// flavor; new threads start without an FPU context).
#[derive(IntoBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// The software-saved area PendSV expects below the hardware frame.
#[derive(IntoBytes, Immutable, KnownLayout, Default)]
#[repr(C)]
struct SavedContext {
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    exc_return: u32,
}

/// Initially we just set the Thumb Mode bit, the minimum required.
const INITIAL_PSR: u32 = 1 << 24;

/// EXC_RETURN for entering a thread: thread mode, process stack, basic
/// (FPU-less) frame. Threads that later touch the FPU grow an extended
/// frame, which PendSV detects per-switch from bit 4.
const EXC_RETURN_CONST: u32 = 0xFFFF_FFFD;

/// Pre-fills a fresh thread stack with a synthetic suspended context, so
/// that the first context switch *into* the thread is indistinguishable from
/// any other: PendSV unstacks our fabricated registers and "returns" into
/// the entry trampoline with the entry point and argument in r0/r1.
///
/// Returns the stack-pointer value to record as the thread's saved SP.
pub fn initialize_stack(
    stack_top: usize,
    entry: ThreadEntryPoint,
    arg: *mut c_void,
) -> usize {
    // The hardware requires 8-byte stack alignment at exception boundaries.
    uassert!(stack_top & 0x7 == 0);

    let frame = BaseExceptionFrame {
        r0: entry as usize as u32,
        r1: arg as u32,
        pc: crate::thread::thread_entry_trampoline as usize as u32,
        // Returning from the trampoline would be a bug; park the LR on an
        // address that faults.
        lr: 0xFFFF_FFFF,
        xpsr: INITIAL_PSR,
        ..BaseExceptionFrame::default()
    };
    let save = SavedContext {
        exc_return: EXC_RETURN_CONST,
        ..SavedContext::default()
    };

    let frame_size = core::mem::size_of::<BaseExceptionFrame>();
    let save_size = core::mem::size_of::<SavedContext>();
    uassert!(stack_top >= frame_size + save_size);
    let sp = stack_top - frame_size - save_size;

    // Safety: the caller owns `[sp, stack_top)` as fresh stack memory; no
    // other reference to it exists yet.
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(
            sp as *mut u8,
            save_size + frame_size,
        )
    };
    save.write_to(&mut bytes[..save_size]).unwrap_lite();
    frame.write_to(&mut bytes[save_size..]).unwrap_lite();
    sp
}

/// Reads the thread (process) stack pointer.
pub fn thread_stack_pointer() -> usize {
    let psp: u32;
    // Safety: reading PSP has no side effects.
    unsafe {
        core::arch::asm!(
            "mrs {}, PSP",
            out(reg) psp,
            options(nomem, nostack, preserves_flags),
        );
    }
    psp as usize
}

/// Drops the kernel entry points to the bottom of the normal-latency band
/// so they never delay device interrupts.
unsafe fn set_kernel_irq_priorities() {
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    cfg_if::cfg_if! {
        if #[cfg(any(armv7m, armv8m))] {
            // System handler priority registers are byte-indexed from
            // exception 4; PendSV is exception 14, SysTick 15.
            unsafe {
                scb.shpr[10].write(prio_raw(IRQ_PRI_KERNEL) as u8);
                scb.shpr[11].write(prio_raw(IRQ_PRI_KERNEL) as u8);
            }
        } else if #[cfg(armv6m)] {
            // v6-M exposes two bits of priority in the top of each byte of
            // SHPR3; set PendSV and SysTick to 3, the least urgent.
            unsafe {
                scb.shpr[1].modify(|x| x | 0b11 << 22 | 0b11 << 30);
            }
        } else {
            compile_error!("missing priority setup for ARM profile");
        }
    }
}

/// Arms the tick timer and swaps the CPU from the bootstrap context onto
/// the scheduler: resets MSP to the vector-table value (reclaiming the boot
/// stack for interrupt use), points PSP at `bootstrap_sp` (scratch space on
/// the idle thread's stack, whose contents the first switch will clobber
/// and the init thread will rebuild), enables interrupts, and pends the
/// first context switch. Never returns; the switch lands in the init
/// thread.
pub fn start_first_thread(tick_reload: u32, bootstrap_sp: usize) -> ! {
    unsafe {
        set_kernel_irq_priorities();
    }

    // Safety: this is safe in practice but unsafe in API.
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_reload);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt, processor clock.
        syst.csr.modify(|v| v | 0b111);
    }

    restore_interrupts(MASK_RAW_ENABLED);

    cfg_if::cfg_if! {
        if #[cfg(any(armv7m, armv8m))] {
            unsafe {
                core::arch::asm!("
                    ldr r0, ={vtor}
                    ldr r0, [r0]
                    ldr r0, [r0]        @ original stack top from the vector table
                    msr MSP, r0
                    msr PSP, {psp}
                    dsb
                    isb
                    cpsie f
                    cpsie i
                    ldr r0, ={icsr}
                    ldr r1, ={pendsvset}
                    str r1, [r0]        @ pend the first context switch
                    dsb
                0:  wfi
                    b 0b
                    ",
                    psp = in(reg) bootstrap_sp,
                    vtor = const 0xE000_ED08u32,
                    icsr = const 0xE000_ED04u32,
                    pendsvset = const 1u32 << 28,
                    options(noreturn),
                )
            }
        } else if #[cfg(armv6m)] {
            unsafe {
                core::arch::asm!("
                    ldr r0, ={vtor}
                    ldr r0, [r0]
                    ldr r0, [r0]
                    msr MSP, r0
                    msr PSP, {psp}
                    dsb
                    isb
                    cpsie i
                    ldr r0, ={icsr}
                    ldr r1, ={pendsvset}
                    str r1, [r0]
                    dsb
                0:  wfi
                    b 0b
                    ",
                    psp = in(reg) bootstrap_sp,
                    vtor = const 0xE000_ED08u32,
                    icsr = const 0xE000_ED04u32,
                    pendsvset = const 1u32 << 28,
                    options(noreturn),
                )
            }
        } else {
            compile_error!("missing bootstrap sequence for ARM profile");
        }
    }
}
