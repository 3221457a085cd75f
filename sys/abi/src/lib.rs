// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.
//!
//! Everything in here is deliberately small and `Copy`-friendly: these types
//! cross the syscall boundary by value, and several of them are read by
//! debuggers straight out of RAM.

#![no_std]

use zerocopy_derive::{FromBytes, Immutable, IntoBytes, Unaligned};

/// Number of bytes reserved for an object name, terminator included. Longer
/// names are silently truncated at creation.
pub const OBJECT_NAME_LEN: usize = 32;

/// Fixed-capacity storage for the name of a named object. This never touches
/// the heap, which matters because names are copied around while the
/// interrupt mask is raised.
pub type ObjectName = arrayvec::ArrayString<OBJECT_NAME_LEN>;

/// An opaque integer naming a kernel object through the handle table.
///
/// Handles are 24-bit values issued by the handle table; the remaining bits
/// are zero for any valid handle. `Handle::INVALID` (all ones) is the
/// conventional "no handle" value returned by failed `create_*` calls.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Handle(pub i32);

impl Handle {
    /// The reserved "no such object" handle, `-1` on the C surface.
    pub const INVALID: Self = Self(-1);

    /// Number of bits of real handle space.
    pub const BITS: u32 = 24;

    /// Checks that this handle is in the issued range. This does not imply
    /// the handle is (still) allocated, just that it could be.
    pub fn is_valid(self) -> bool {
        self.0 >= 0 && self.0 < (1 << Self::BITS)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Type tag distinguishing the kinds of object a handle can refer to.
///
/// This enumeration is closed: the registry rejects any handle/tag mismatch,
/// so adding a variant here means auditing every `forward_to_handle` caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ObjectType {
    Thread = 1,
    Semaphore = 2,
    Mutex = 3,
    ConditionVariable = 4,
}

/// Error kinds produced by the kernel core.
///
/// Syscalls translate these to `-1` plus a thread-local errno; internal
/// kernel code passes them around as ordinary `Result` errors. Invariant
/// violations are *not* represented here -- those panic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernError {
    /// Bad handle, wrong type tag, out-of-range parameter, or a wait on an
    /// object that was destroyed from under us.
    InvalidArgument,
    /// The allocator refused during object or handle creation.
    OutOfMemory,
    /// A deadline passed before the operation was satisfied.
    TimedOut,
    /// A signal with a non-restart disposition interrupted a blocking call.
    Interrupted,
    /// A `try_` variant could not complete without blocking.
    WouldBlock,
    /// The caller does not own the object in the way the operation requires
    /// (e.g. unlocking a mutex held by another thread).
    NotOwner,
}

impl KernError {
    /// Maps this error to its errno value on the C surface.
    pub fn errno(self) -> i32 {
        match self {
            KernError::InvalidArgument => EINVAL,
            KernError::OutOfMemory => ENOMEM,
            KernError::TimedOut => ETIME,
            KernError::Interrupted => EINTR,
            KernError::WouldBlock => EWOULDBLOCK,
            KernError::NotOwner => EPERM,
        }
    }
}

// Errno values follow newlib, which the original C runtime used. Only the
// ones the kernel core itself produces are defined here.
pub const EPERM: i32 = 1;
pub const EINTR: i32 = 4;
pub const EWOULDBLOCK: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;
pub const ETIME: i32 = 62;

/// Scheduling state of a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Linked on the ready list of its priority level, runnable.
    Ready,
    /// The one thread currently executing. At most one per core, and we have
    /// one core.
    Running,
    /// Blocked with a deadline on the sleep queue (possibly also queued on an
    /// object, for timed waits).
    Sleeping,
    /// Blocked indefinitely on an object's wait queue.
    Waiting,
    /// Exited; control block and stack not yet reclaimed.
    Zombie,
    /// Reclaimed. Handles may briefly still resolve to the control block
    /// while other cores of the code hold references; they must treat this
    /// state as "gone".
    Deleted,
}

/// Whether a thread's exit status can be collected with `wait_thread`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DetachState {
    /// Exit status is delivered to a joiner; the zombie persists until
    /// joined.
    Joinable,
    /// Nobody will join; the init thread reclaims the zombie.
    Detached,
}

/// Lowest (least urgent) thread priority.
pub const THREAD_PRIORITY_MIN: i32 = -16;
/// Highest (most urgent) thread priority.
pub const THREAD_PRIORITY_MAX: i32 = 15;
/// Number of distinct priority levels, and thus ready lists.
pub const THREAD_PRIORITY_LEVELS: usize =
    (THREAD_PRIORITY_MAX - THREAD_PRIORITY_MIN + 1) as usize;

/// Thread priority as seen by applications: `-16..=15`, numerically *larger*
/// is *more* urgent. Internally the scheduler indexes its ready lists by
/// "level", which is just the priority shifted to `0..=31`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    Unaligned, Default,
)]
#[repr(transparent)]
pub struct Priority(pub i8);

impl Priority {
    /// Converts an application priority to a ready-list level, clamping
    /// out-of-range requests rather than failing them (matching the original
    /// system's behavior).
    pub fn level(self) -> usize {
        let clamped = (self.0 as i32)
            .clamp(THREAD_PRIORITY_MIN, THREAD_PRIORITY_MAX);
        (clamped - THREAD_PRIORITY_MIN) as usize
    }

    /// Inverse of `level`.
    pub fn from_level(level: usize) -> Self {
        let level = level.min(THREAD_PRIORITY_LEVELS - 1);
        Priority((level as i32 + THREAD_PRIORITY_MIN) as i8)
    }
}

/// Number of standard signals.
pub const NSIG: u32 = 32;
/// Number of realtime signals, numbered directly after the standard ones.
pub const NRTSIG: u32 = 8;
/// First realtime signal number.
pub const SIGRTMIN: u32 = NSIG + 1;

/// A set of signals, one bit per signal number starting at bit 0 for signal
/// 1. Bits above `NSIG + NRTSIG` are never set.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromBytes, IntoBytes,
    Immutable,
)]
#[repr(transparent)]
pub struct SignalSet(pub u64);

impl SignalSet {
    pub const EMPTY: Self = Self(0);

    /// Mask with a single bit set for `signum`, or the empty set if `signum`
    /// is out of range.
    pub fn single(signum: u32) -> Self {
        if (1..=NSIG + NRTSIG).contains(&signum) {
            Self(1 << (signum - 1))
        } else {
            Self::EMPTY
        }
    }

    pub fn contains(self, signum: u32) -> bool {
        self.0 & Self::single(signum).0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Lowest-numbered signal in the set, if any.
    pub fn first(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() + 1)
        }
    }
}

bitflags::bitflags! {
    /// Behavior flags recorded in a signal action.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct SigActionFlags: u32 {
        /// Blocking syscalls interrupted by this signal are transparently
        /// restarted instead of failing with `EINTR`.
        const RESTART = 1 << 0;
        /// The signal is not added to the blocked mask while its handler
        /// runs.
        const NODEFER = 1 << 1;
    }
}

/// What to do when a signal becomes deliverable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum SignalDisposition {
    /// The default action. The kernel core treats this as "ignore"; policy
    /// beyond that belongs to the runtime above us.
    #[default]
    Default,
    /// Explicitly ignore.
    Ignore,
    /// Invoke a handler in the context of the receiving thread.
    Handler(extern "C" fn(i32)),
}

/// A thread's registered reaction to one signal.
#[derive(Copy, Clone, Debug, Default)]
pub struct SigAction {
    pub disposition: SignalDisposition,
    /// Signals additionally blocked while the handler runs.
    pub mask: SignalSet,
    pub flags: SigActionFlags,
}

/// How `set_signal_mask` combines the supplied set with the current mask.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SigMaskHow {
    Block = 0,
    Unblock = 1,
    SetMask = 2,
}
