// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks.
//!
//! A `ThreadCb` is a named object (it has a handle, and joiners queue on
//! its wait queue) plus the scheduler-facing state: the state machine, the
//! ready-list link, the owned stack, and the saved stack pointer that *is*
//! the thread while it's suspended. Mutable fields live in gate cells; the
//! control block itself is shared through `Arc`s held by the handle table
//! and by anyone mid-syscall on it.

use alloc::sync::Arc;
use core::any::Any;
use core::ffi::c_void;
use core::ptr::NonNull;

use abi::{
    DetachState, Handle, KernError, ObjectType, Priority, SigAction,
    SigActionFlags, SignalSet, ThreadState, NRTSIG, NSIG,
};
use kerncore::list::{Link, Linked, List};
use unwrap_lite::UnwrapLite;

use crate::irq::GateCell;
use crate::object::{KernelObject, ObjectBase};
use crate::signal::SignalQueueNode;
use crate::tls::ThreadTls;

/// Entry point signature on the C surface.
pub type ThreadEntryPoint = extern "C" fn(*mut c_void);

/// Stack given to threads that ask for size 0.
pub const THREAD_DEFAULT_STACK_SIZE: usize = 32 * 1024;

/// Smallest stack we'll allocate; requests below are rounded up.
pub const THREAD_MIN_STACK_SIZE: usize = 512;

/// Hardware stack alignment.
const STACK_ALIGNMENT: usize = 8;

pub(crate) const NUM_SIGNALS: usize = (NSIG + NRTSIG) as usize;

/// Per-thread kernel state.
pub struct ThreadCb {
    base: ObjectBase,
    state: GateCell<ThreadState>,
    /// Ready-list index, `0..THREAD_PRIORITY_LEVELS`.
    priority_level: GateCell<usize>,
    detach_state: DetachState,
    /// Exit status, delivered to joiners.
    return_value: GateCell<i32>,
    /// Stack pointer snapshot while suspended; garbage while running.
    current_sp: GateCell<usize>,
    /// Thread-local errno root.
    errno: GateCell<i32>,
    stack_base: NonNull<u8>,
    stack_size: usize,
    pending_signals: GateCell<SignalSet>,
    blocked_signals: GateCell<SignalSet>,
    signal_actions: GateCell<[SigAction; NUM_SIGNALS]>,
    pub(crate) queued_signals: GateCell<List<SignalQueueNode>>,
    /// Handle of the object this thread is blocked on, for debuggers and
    /// crash dumps. `INVALID` while runnable.
    blocking_object: GateCell<Handle>,
    /// Membership in exactly one scheduler list: the ready list of this
    /// thread's priority, or the zombie list.
    pub(crate) sched_link: Link<ThreadCb>,
    tls: ThreadTls,
}

// Safety: every mutable field is behind a gate cell (or, for TLS, owned by
// the thread itself); the raw link fields are only touched with the mask
// raised. See the concurrency notes in `irq`.
unsafe impl Send for ThreadCb {}
unsafe impl Sync for ThreadCb {}

impl ThreadCb {
    /// Allocates a control block and its stack. The thread is not yet
    /// runnable: it has no synthetic context until `initialize_stack`, no
    /// handle until registration.
    pub fn new(
        name: &str,
        priority: Priority,
        detach_state: DetachState,
        stack_size: usize,
    ) -> Result<Arc<Self>, KernError> {
        let stack_size = if stack_size == 0 {
            THREAD_DEFAULT_STACK_SIZE
        } else {
            stack_size.max(THREAD_MIN_STACK_SIZE)
        }
        .next_multiple_of(STACK_ALIGNMENT);

        // The one deliberate use of the raw allocator: it reports failure
        // instead of aborting, so spawn can fail with an errno the way the
        // original did.
        let layout = core::alloc::Layout::from_size_align(
            stack_size,
            STACK_ALIGNMENT,
        )
        .map_err(|_| KernError::InvalidArgument)?;
        // Safety: layout has non-zero size.
        let stack = unsafe { alloc::alloc::alloc(layout) };
        let Some(stack_base) = NonNull::new(stack) else {
            return Err(KernError::OutOfMemory);
        };

        Ok(Arc::new(Self {
            base: ObjectBase::new(name, ObjectType::Thread),
            state: GateCell::new(ThreadState::Ready),
            priority_level: GateCell::new(priority.level()),
            detach_state,
            return_value: GateCell::new(0),
            current_sp: GateCell::new(0),
            errno: GateCell::new(0),
            stack_base,
            stack_size,
            pending_signals: GateCell::new(SignalSet::EMPTY),
            blocked_signals: GateCell::new(SignalSet::EMPTY),
            signal_actions: GateCell::new(
                [SigAction::default(); NUM_SIGNALS],
            ),
            queued_signals: GateCell::new(List::new()),
            blocking_object: GateCell::new(Handle::INVALID),
            sched_link: Link::new(),
            tls: ThreadTls::new(),
        }))
    }

    /// Pre-fills the stack with a synthetic suspended context that resumes
    /// into `entry(arg)`. Also used to (re)build the idle thread's context
    /// during startup.
    pub fn initialize_stack(&self, entry: ThreadEntryPoint, arg: *mut c_void) {
        let sp = crate::arch::initialize_stack(self.stack_top(), entry, arg);
        critical_section::with(|cs| self.current_sp.set(cs, sp));
    }

    /// Initial stack pointer: the high end of the buffer, aligned down.
    pub fn stack_top(&self) -> usize {
        (self.stack_base.as_ptr() as usize + self.stack_size)
            & !(STACK_ALIGNMENT - 1)
    }

    /// Low end of the stack buffer; the stack has overflowed if the stack
    /// pointer reaches this.
    pub fn stack_limit(&self) -> usize {
        self.stack_base.as_ptr() as usize
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn state(&self, cs: critical_section::CriticalSection<'_>) -> ThreadState {
        self.state.get(cs)
    }

    pub(crate) fn set_state(
        &self,
        cs: critical_section::CriticalSection<'_>,
        state: ThreadState,
    ) {
        self.state.set(cs, state);
    }

    pub fn priority_level(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> usize {
        self.priority_level.get(cs)
    }

    pub(crate) fn set_priority_level(
        &self,
        cs: critical_section::CriticalSection<'_>,
        level: usize,
    ) {
        self.priority_level.set(cs, level);
    }

    pub fn priority(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> Priority {
        Priority::from_level(self.priority_level.get(cs))
    }

    pub fn detach_state(&self) -> DetachState {
        self.detach_state
    }

    pub fn handle(&self, cs: critical_section::CriticalSection<'_>) -> Handle {
        self.base.handle(cs)
    }

    pub(crate) fn current_sp(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> usize {
        self.current_sp.get(cs)
    }

    pub(crate) fn set_current_sp(
        &self,
        cs: critical_section::CriticalSection<'_>,
        sp: usize,
    ) {
        self.current_sp.set(cs, sp);
    }

    pub fn return_value(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> i32 {
        self.return_value.get(cs)
    }

    pub(crate) fn set_return_value(
        &self,
        cs: critical_section::CriticalSection<'_>,
        v: i32,
    ) {
        self.return_value.set(cs, v);
    }

    pub fn errno(&self, cs: critical_section::CriticalSection<'_>) -> i32 {
        self.errno.get(cs)
    }

    pub fn set_errno(
        &self,
        cs: critical_section::CriticalSection<'_>,
        errno: i32,
    ) {
        self.errno.set(cs, errno);
    }

    pub(crate) fn set_blocking_object(
        &self,
        cs: critical_section::CriticalSection<'_>,
        handle: Handle,
    ) {
        self.blocking_object.set(cs, handle);
    }

    pub fn blocking_object(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> Handle {
        self.blocking_object.get(cs)
    }

    pub(crate) fn pending_signals(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> SignalSet {
        self.pending_signals.get(cs)
    }

    pub(crate) fn set_pending_signals(
        &self,
        cs: critical_section::CriticalSection<'_>,
        set: SignalSet,
    ) {
        self.pending_signals.set(cs, set);
    }

    pub(crate) fn blocked_signals(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> SignalSet {
        self.blocked_signals.get(cs)
    }

    pub(crate) fn set_blocked_signals(
        &self,
        cs: critical_section::CriticalSection<'_>,
        set: SignalSet,
    ) {
        self.blocked_signals.set(cs, set);
    }

    /// Signals that are pending and not blocked.
    pub fn deliverable_signals(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> SignalSet {
        self.pending_signals.get(cs).difference(self.blocked_signals.get(cs))
    }

    pub(crate) fn signal_action(
        &self,
        cs: critical_section::CriticalSection<'_>,
        signum: u32,
    ) -> SigAction {
        // Safety: single-borrow discipline; nothing re-enters this cell.
        unsafe {
            self.signal_actions
                .with_mut(cs, |acts| acts[(signum - 1) as usize])
        }
    }

    pub(crate) fn set_signal_action(
        &self,
        cs: critical_section::CriticalSection<'_>,
        signum: u32,
        action: SigAction,
    ) -> SigAction {
        // Safety: as above.
        unsafe {
            self.signal_actions.with_mut(cs, |acts| {
                core::mem::replace(&mut acts[(signum - 1) as usize], action)
            })
        }
    }

    /// Decides what an interrupted wait should do: restart transparently
    /// (no deliverable signal, or every deliverable signal opted into
    /// `RESTART`), or bail out with `Interrupted`.
    pub(crate) fn wants_restart(
        &self,
        cs: critical_section::CriticalSection<'_>,
    ) -> bool {
        let deliverable = self.deliverable_signals(cs);
        let Some(first) = deliverable.first() else {
            // Nothing deliverable: the wakeup was spurious (or the waker
            // just lost a race); go back to waiting.
            return true;
        };
        // Safety: single-borrow discipline.
        unsafe {
            self.signal_actions.with_mut(cs, |acts| {
                (first..=NUM_SIGNALS as u32)
                    .filter(|s| deliverable.contains(*s))
                    .all(|s| {
                        acts[(s - 1) as usize]
                            .flags
                            .contains(SigActionFlags::RESTART)
                    })
            })
        }
    }

    pub(crate) fn tls(&self) -> &ThreadTls {
        &self.tls
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn debug_validate(&self) {
        self.base.debug_validate();
    }
}

impl Linked for ThreadCb {
    fn link(&self) -> &Link<Self> {
        &self.sched_link
    }
}

impl KernelObject for ThreadCb {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for ThreadCb {
    fn drop(&mut self) {
        // Orphan any queued signal payloads. This runs with the mask down
        // (control blocks are only released outside critical sections), so
        // freeing here is fine.
        let queued = self.queued_signals.get_mut();
        // Safety: the nodes were leaked into the list by `signal`; nothing
        // else refers to them once the thread is unreachable.
        unsafe {
            while let Some(node) = queued.pop_front() {
                drop(alloc::boxed::Box::from_raw(node.as_ptr()));
            }
        }

        let layout = core::alloc::Layout::from_size_align(
            self.stack_size,
            STACK_ALIGNMENT,
        )
        .unwrap_lite();
        // Safety: allocated with this exact layout in `new`; the thread is
        // long off the CPU by the time its last reference drops.
        unsafe {
            alloc::alloc::dealloc(self.stack_base.as_ptr(), layout);
        }
    }
}

/// First code executed on a new thread's own stack: runs the entry point,
/// then folds the thread into the exit path if it returns normally.
pub(crate) extern "C" fn thread_entry_trampoline(
    entry: ThreadEntryPoint,
    arg: *mut c_void,
) -> ! {
    entry(arg);
    crate::syscalls::exit_thread(0);
}
