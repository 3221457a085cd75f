// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: ready lists, the sleep queue, and thread selection.
//!
//! Scheduling is preemptive, priority-based, single-core. Each priority
//! level owns a FIFO ready list; within a level, threads round-robin at
//! tick granularity (the running thread goes to the back of its list when
//! the tick's context switch request lands). Sleepers sit on one
//! deadline-sorted queue. A thread that exits becomes a zombie; detached
//! zombies are handed to the init thread for reclamation, joinable ones
//! wait for their joiner.
//!
//! All of this state lives in [`SchedState`], reached via [`with_sched`]
//! under the interrupt-mask gate. The actual switch is performed by the
//! architecture layer, which calls [`select_next`] from the PendSV-class
//! handler with interrupts masked.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use abi::{Handle, KernError, ObjectType, ThreadState, THREAD_PRIORITY_LEVELS};
use kerncore::list::{Linked, List};

use crate::irq::GateCell;
use crate::object::{self, KernelObject};
use crate::thread::ThreadCb;
use crate::time::Timestamp;
use crate::wait::{WaitNode, WaitQueue};

/// Process-wide scheduler state.
pub(crate) struct SchedState {
    /// One FIFO per priority level; index = level, higher = more urgent.
    ready: [List<ThreadCb>; THREAD_PRIORITY_LEVELS],
    /// Wait nodes of sleeping threads, ascending by resume time.
    sleep_queue: List<WaitNode>,
    /// Detached threads that have exited and await the init thread.
    zombies: List<ThreadCb>,
}

static SCHED: GateCell<SchedState> = GateCell::new(SchedState::new());

/// The running thread. Only `select_next` (and scheduler startup) store
/// this; anything may load it.
static CURRENT_THREAD: AtomicPtr<ThreadCb> =
    AtomicPtr::new(core::ptr::null_mut());

/// The init thread, woken by zombie arrivals.
static INIT_THREAD: AtomicPtr<ThreadCb> =
    AtomicPtr::new(core::ptr::null_mut());

/// Stack size the init thread should give the main thread; parked here by
/// `start_scheduler` on its way in.
pub(crate) static MAIN_STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Hands `body` exclusive access to the scheduler state.
///
/// Call this once per kernel entry, never re-entrantly -- the closure must
/// not wind back into `with_sched`. (The gate token keeps interrupts out;
/// this convention keeps *us* out.)
pub(crate) fn with_sched<R>(
    cs: critical_section::CriticalSection<'_>,
    body: impl FnOnce(&mut SchedState) -> R,
) -> R {
    // Safety: non-reentrancy is the documented convention above; all other
    // exclusion comes from the token.
    unsafe { SCHED.with_mut(cs, body) }
}

/// The calling thread's control block, if the scheduler has started.
///
/// The returned reference is safe to hold for the duration of the call
/// frame: a thread's control block cannot be freed while the thread is
/// running on it.
pub fn try_current_thread() -> Option<&'static ThreadCb> {
    let p = CURRENT_THREAD.load(Ordering::Relaxed);
    // Safety: see doc comment; the reaper only frees control blocks whose
    // threads are long gone from the CPU.
    unsafe { p.as_ref() }
}

/// As `try_current_thread`, for the overwhelmingly common case where the
/// scheduler is known to be running.
pub fn current_thread() -> &'static ThreadCb {
    match try_current_thread() {
        Some(t) => t,
        None => panic!("no current thread"),
    }
}

/// Ready-list level of the calling thread, or the bottom if the scheduler
/// hasn't started.
pub(crate) fn current_priority_level(
    cs: critical_section::CriticalSection<'_>,
) -> usize {
    try_current_thread().map(|t| t.priority_level(cs)).unwrap_or(0)
}

/// Records `thread` as the running thread. Used at startup to install the
/// bootstrap (idle) thread; afterwards only `select_next` writes.
pub(crate) fn set_current_thread(thread: &ThreadCb) {
    CURRENT_THREAD.store(
        thread as *const _ as *mut ThreadCb,
        Ordering::Relaxed,
    );
}

pub(crate) fn set_init_thread(thread: &ThreadCb) {
    INIT_THREAD
        .store(thread as *const _ as *mut ThreadCb, Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn clear_current_thread() {
    CURRENT_THREAD.store(core::ptr::null_mut(), Ordering::Relaxed);
}

impl SchedState {
    pub(crate) const fn new() -> Self {
        Self {
            ready: [const { List::new() }; THREAD_PRIORITY_LEVELS],
            sleep_queue: List::new(),
            zombies: List::new(),
        }
    }

    /// Makes `thread` runnable: state `Ready`, appended to the list of its
    /// level.
    pub(crate) fn make_ready(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        thread: &ThreadCb,
    ) {
        uassert!(!thread.sched_link.is_linked());
        thread.set_state(cs, ThreadState::Ready);
        thread.set_blocking_object(cs, Handle::INVALID);
        // Safety: not linked (asserted); control blocks outlive list
        // membership (the handle table pins them), and the lists are in a
        // static.
        unsafe {
            self.ready[thread.priority_level(cs)]
                .push_back(NonNull::from(thread));
        }
    }

    /// Re-queues a `Ready` thread onto a different level, for priority
    /// changes. No-op for threads that aren't on a ready list.
    pub(crate) fn requeue_ready(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        thread: &ThreadCb,
        new_level: usize,
    ) {
        if thread.state(cs) == ThreadState::Ready
            && thread.sched_link.is_linked()
        {
            // Safety: linked on the ready list of its (old) level.
            unsafe {
                self.ready[thread.priority_level(cs)]
                    .remove(NonNull::from(thread));
            }
            thread.set_priority_level(cs, new_level);
            // Safety: just unlinked.
            unsafe {
                self.ready[new_level].push_back(NonNull::from(thread));
            }
        } else {
            thread.set_priority_level(cs, new_level);
        }
    }

    /// Pops up to `max_count` waiters (0 = all) off `queue` and makes them
    /// runnable, stashing `wake_value` in each one's errno slot. Returns
    /// true if any woken thread outranks the caller, i.e. a context switch
    /// should be requested once the mask drops.
    pub(crate) fn wakeup_wait_queue(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        queue: &mut WaitQueue,
        wake_value: i32,
        max_count: usize,
    ) -> bool {
        let our_level = current_priority_level(cs);
        let mut need_schedule = false;
        let mut remaining = if max_count == 0 { usize::MAX } else { max_count };
        while remaining != 0 {
            // Safety: nodes live until their waiters detach, which cannot
            // happen while we hold the mask.
            let Some(node) = (unsafe { queue.pop_front() }) else {
                break;
            };
            remaining -= 1;
            let node = unsafe { node.as_ref() };
            // Safety: a queued node's thread is suspended on it; the
            // control block is pinned by the handle table.
            let thread = unsafe { node.thread().as_ref() };
            match thread.state(cs) {
                ThreadState::Sleeping | ThreadState::Waiting => {
                    if thread.priority_level(cs) > our_level {
                        need_schedule = true;
                    }
                    thread.set_errno(cs, wake_value);
                    self.make_ready(cs, thread);
                }
                // Someone else won the race to wake this thread; the
                // detach above is all that was left to do.
                _ => {}
            }
        }
        need_schedule
    }

    /// Drains `queue` marking every node `target_deleted`, waking the
    /// waiters to collect their `InvalidArgument`. Returns true if a woken
    /// thread outranks the caller.
    pub(crate) fn wake_all_deleted(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        queue: &mut WaitQueue,
    ) -> bool {
        let our_level = current_priority_level(cs);
        let mut need_schedule = false;
        // Safety: as in `wakeup_wait_queue`.
        while let Some(node) = unsafe { queue.pop_front() } {
            let node = unsafe { node.as_ref() };
            node.mark_target_deleted();
            let thread = unsafe { node.thread().as_ref() };
            match thread.state(cs) {
                ThreadState::Sleeping | ThreadState::Waiting => {
                    if thread.priority_level(cs) > our_level {
                        need_schedule = true;
                    }
                    self.make_ready(cs, thread);
                }
                ThreadState::Ready | ThreadState::Running => {
                    // Already woken by someone else; it will observe the
                    // flag on its way out.
                }
                ThreadState::Zombie | ThreadState::Deleted => {
                    panic!("wait queue holds dead thread");
                }
            }
        }
        need_schedule
    }

    /// Inserts `node` into the sleep queue, ascending by resume time;
    /// equal deadlines keep insertion order.
    pub(crate) fn add_to_sleep_queue(
        &mut self,
        _cs: critical_section::CriticalSection<'_>,
        node: &WaitNode,
    ) {
        let mut cursor = self.sleep_queue.head();
        while let Some(n) = cursor {
            // Safety: sleep-queue nodes live until detached, which can't
            // happen under the mask we hold.
            let existing = unsafe { n.as_ref() };
            if node.resume_time() < existing.resume_time() {
                // Safety: `n` is a member; `node` is caller-owned, fresh.
                unsafe {
                    self.sleep_queue.insert_before(n, NonNull::from(node));
                }
                return;
            }
            cursor = existing.link().next_node();
        }
        // Safety: as above.
        unsafe {
            self.sleep_queue.push_back(NonNull::from(node));
        }
    }

    /// Wakes every sleeper whose deadline has arrived. Runs from the tick.
    pub(crate) fn wake_sleepers(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        now: Timestamp,
    ) {
        while let Some(head) = self.sleep_queue.head() {
            // Safety: as in `add_to_sleep_queue`.
            let node = unsafe { head.as_ref() };
            if node.resume_time() > now {
                break;
            }
            // Safety: head is a member.
            unsafe {
                self.sleep_queue.remove(head);
            }
            let thread = unsafe { node.thread().as_ref() };
            // A thread woken by some other path between deadline and tick
            // has already left `Sleeping`; its node just needed unlinking.
            if thread.state(cs) == ThreadState::Sleeping {
                self.make_ready(cs, thread);
            }
        }
    }

    /// Links an exited, detached thread onto the zombie list and pokes the
    /// init thread to come reclaim it.
    fn retire_zombie(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        thread: &ThreadCb,
    ) {
        uassert!(!thread.sched_link.is_linked());
        // Safety: not linked; pinned by the handle table until the init
        // thread frees it.
        unsafe {
            self.zombies.push_back(NonNull::from(thread));
        }
        let init = INIT_THREAD.load(Ordering::Relaxed);
        // Safety: the init thread is created at startup and never freed.
        if let Some(init) = unsafe { init.as_ref() } {
            if init.state(cs) == ThreadState::Waiting {
                self.make_ready(cs, init);
            }
        }
    }

    pub(crate) fn has_zombies(&self) -> bool {
        !self.zombies.is_empty()
    }

    /// Moves every zombie onto `out` (a local list), leaving the zombie
    /// list empty. Called by the init thread under the mask; the actual
    /// destruction happens with the mask down.
    pub(crate) fn drain_zombies(&mut self, out: &mut List<ThreadCb>) {
        // Safety: moving nodes between lists under the mask; control
        // blocks stay pinned by the handle table.
        unsafe {
            while let Some(z) = self.zombies.pop_front() {
                out.push_back(z);
            }
        }
    }

    /// Core of the context switch: given the suspended stack pointer of the
    /// outgoing thread, picks the next thread to run, updates `Running`
    /// state and the round-robin order, handles just-exited threads, and
    /// returns the incoming thread's saved stack pointer.
    pub(crate) fn select(
        &mut self,
        cs: critical_section::CriticalSection<'_>,
        current_sp: usize,
    ) -> usize {
        let prev = match try_current_thread() {
            Some(t) => t,
            None => panic!("context switch before scheduler start"),
        };
        prev.debug_validate();
        prev.set_current_sp(cs, current_sp);
        if current_sp <= prev.stack_limit() {
            panic!("stack overflow in '{}'", prev.name());
        }

        let prev_state = prev.state(cs);
        let prev_level = prev.priority_level(cs);
        for level in (0..THREAD_PRIORITY_LEVELS).rev() {
            let Some(candidate) = self.ready[level].head() else {
                continue;
            };
            if prev_state == ThreadState::Running && level < prev_level {
                // Nothing ready outranks the incumbent.
                break;
            }
            // Safety: head of a ready list is a member; control blocks are
            // pinned by the handle table.
            unsafe {
                self.ready[level].remove(candidate);
            }
            if prev_state == ThreadState::Running {
                // Round-robin: the incumbent goes to the back of its
                // level.
                self.make_ready(cs, prev);
            }
            let next = unsafe { candidate.as_ref() };
            next.debug_validate();
            next.set_state(cs, ThreadState::Running);
            set_current_thread(next);
            break;
        }

        // If the outgoing thread exited, this switch is where its zombie
        // gets routed: detached ones to the reaper, joinable ones to their
        // joiners.
        if prev_state == ThreadState::Zombie {
            if prev.detach_state() == abi::DetachState::Detached {
                self.retire_zombie(cs, prev);
            } else {
                let rv = prev.return_value(cs);
                // Safety: single-borrow discipline; distinct cell from
                // anything above.
                unsafe {
                    prev.base().wait_queue.with_mut(cs, |q| {
                        self.wakeup_wait_queue(cs, q, rv, 0);
                    });
                }
            }
        }

        let next = current_thread();
        let sp = next.current_sp(cs);
        if sp <= next.stack_limit() {
            panic!("stack overflow in '{}'", next.name());
        }
        sp
    }
}

/// Entry point for the architecture layer's context-switch handler.
pub(crate) fn select_next(
    cs: critical_section::CriticalSection<'_>,
    current_sp: usize,
) -> usize {
    with_sched(cs, |sched| sched.select(cs, current_sp))
}

/// Tick-time work: wake expired sleepers. The architecture layer requests
/// the round-robin context switch afterwards.
pub(crate) fn handle_tick(
    cs: critical_section::CriticalSection<'_>,
    now: Timestamp,
) {
    with_sched(cs, |sched| sched.wake_sleepers(cs, now));
}

/// Resolves a thread handle, filtering out the dead.
pub fn get_thread(handle: Handle) -> Option<alloc::sync::Arc<ThreadCb>> {
    let thread =
        object::get_object_of::<ThreadCb>(handle, ObjectType::Thread)?;
    let gone = critical_section::with(|cs| {
        thread.state(cs) == ThreadState::Deleted
    });
    if gone {
        None
    } else {
        Some(thread)
    }
}

/// Makes a `Sleeping` (or, optionally, object-`Waiting`) thread runnable.
///
/// The woken thread resumes inside whatever blocking call it was in, which
/// treats the wake like any other: re-check, then restart or return
/// `Interrupted` per its signal dispositions.
pub fn wakeup_thread(
    handle: Handle,
    include_waiting: bool,
) -> Result<(), KernError> {
    let thread = get_thread(handle).ok_or(KernError::InvalidArgument)?;
    let need_switch = critical_section::with(|cs| {
        match thread.state(cs) {
            ThreadState::Zombie | ThreadState::Deleted => {
                Err(KernError::InvalidArgument)
            }
            ThreadState::Sleeping => Ok(with_sched(cs, |sched| {
                sched.make_ready(cs, &thread);
                thread.priority_level(cs) > current_priority_level(cs)
            })),
            ThreadState::Waiting if include_waiting => {
                Ok(with_sched(cs, |sched| {
                    sched.make_ready(cs, &thread);
                    thread.priority_level(cs) > current_priority_level(cs)
                }))
            }
            // Already runnable (or waiting and exempt): nothing to do.
            _ => Ok(false),
        }
    })?;
    if need_switch {
        crate::arch::request_context_switch();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mkthread;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    /// Runs `body` against a scheduler of its own, with `current` installed
    /// as the running thread. Serializes against every other test touching
    /// kernel globals.
    fn with_test_sched<R>(
        current: &Arc<ThreadCb>,
        body: impl FnOnce(
            critical_section::CriticalSection<'_>,
            &mut SchedState,
        ) -> R,
    ) -> R {
        let _serial = crate::testutil::serial();
        critical_section::with(|cs| {
            current.set_state(cs, ThreadState::Running);
            set_current_thread(current);
            let mut sched = SchedState::new();
            let r = body(cs, &mut sched);
            clear_current_thread();
            r
        })
    }

    /// A plausible in-bounds stack pointer for a suspended fake thread.
    fn fake_sp(t: &ThreadCb) -> usize {
        t.stack_top() - 64
    }

    #[test]
    fn select_prefers_highest_priority() {
        let cur = mkthread("cur", 0);
        let hi = mkthread("hi", 5);
        let lo = mkthread("lo", -3);
        with_test_sched(&cur, |cs, sched| {
            lo.set_state(cs, ThreadState::Waiting);
            hi.set_state(cs, ThreadState::Waiting);
            sched.make_ready(cs, &lo);
            sched.make_ready(cs, &hi);

            let sp = sched.select(cs, fake_sp(&cur));
            assert_eq!(sp, critical_section::with(|c| hi.current_sp(c)));
            assert_eq!(hi.state(cs), ThreadState::Running);
            // The displaced incumbent went back on its ready list.
            assert_eq!(cur.state(cs), ThreadState::Ready);
            assert!(cur.sched_link.is_linked());

            // Clean up list membership so drops don't panic.
            unsafe {
                kerncore::list::Link::detach(&*lo);
                kerncore::list::Link::detach(&*cur);
            }
        });
    }

    #[test]
    fn select_keeps_incumbent_over_lower_priority() {
        let cur = mkthread("cur", 5);
        let lo = mkthread("lo", 0);
        with_test_sched(&cur, |cs, sched| {
            lo.set_state(cs, ThreadState::Waiting);
            sched.make_ready(cs, &lo);

            let sp = sched.select(cs, fake_sp(&cur));
            assert_eq!(sp, fake_sp(&cur));
            assert_eq!(cur.state(cs), ThreadState::Running);
            assert_eq!(lo.state(cs), ThreadState::Ready);

            unsafe {
                kerncore::list::Link::detach(&*lo);
            }
        });
    }

    #[test]
    fn select_round_robins_within_level() {
        let cur = mkthread("cur", 3);
        let peer = mkthread("peer", 3);
        with_test_sched(&cur, |cs, sched| {
            peer.set_state(cs, ThreadState::Waiting);
            sched.make_ready(cs, &peer);

            // Equal priority: the peer takes over, the incumbent requeues.
            let sp = sched.select(cs, fake_sp(&cur));
            assert_eq!(sp, critical_section::with(|c| peer.current_sp(c)));
            assert_eq!(peer.state(cs), ThreadState::Running);
            assert_eq!(cur.state(cs), ThreadState::Ready);

            // And on the next switch they trade places again.
            let sp = sched.select(cs, fake_sp(&peer));
            assert_eq!(sp, critical_section::with(|c| cur.current_sp(c)));
            assert_eq!(cur.state(cs), ThreadState::Running);
            assert_eq!(peer.state(cs), ThreadState::Ready);

            unsafe {
                kerncore::list::Link::detach(&*peer);
            }
        });
    }

    #[test]
    fn sleep_queue_stays_sorted_with_stable_ties() {
        let cur = mkthread("cur", 0);
        let a = mkthread("a", 0);
        let b = mkthread("b", 0);
        let c = mkthread("c", 0);
        with_test_sched(&cur, |cs, sched| {
            let na = WaitNode::new(&a);
            let nb = WaitNode::new(&b);
            let nc = WaitNode::new(&c);
            na.set_resume_time(Timestamp::from(300));
            nb.set_resume_time(Timestamp::from(100));
            nc.set_resume_time(Timestamp::from(300));
            sched.add_to_sleep_queue(cs, &na);
            sched.add_to_sleep_queue(cs, &nb);
            sched.add_to_sleep_queue(cs, &nc);

            let mut order = Vec::new();
            let mut cursor = sched.sleep_queue.head();
            while let Some(n) = cursor {
                let node = unsafe { n.as_ref() };
                order.push(u64::from(node.resume_time()));
                cursor = node.link().next_node();
            }
            assert_eq!(order, [100, 300, 300]);

            // Equal deadlines keep insertion order: `a` before `c`.
            let second = sched.sleep_queue.head().and_then(|n| unsafe {
                n.as_ref().link().next_node()
            });
            assert_eq!(
                second.map(|n| n.as_ptr() as *const WaitNode),
                Some(&na as *const _),
            );

            na.detach(cs);
            nb.detach(cs);
            nc.detach(cs);
        });
    }

    #[test]
    fn wake_sleepers_readies_expired_only() {
        let cur = mkthread("cur", 0);
        let early = mkthread("early", 0);
        let late = mkthread("late", 0);
        with_test_sched(&cur, |cs, sched| {
            let ne = WaitNode::new(&early);
            let nl = WaitNode::new(&late);
            ne.set_resume_time(Timestamp::from(1_000_000));
            nl.set_resume_time(Timestamp::from(9_000_000));
            early.set_state(cs, ThreadState::Sleeping);
            late.set_state(cs, ThreadState::Sleeping);
            sched.add_to_sleep_queue(cs, &ne);
            sched.add_to_sleep_queue(cs, &nl);

            sched.wake_sleepers(cs, Timestamp::from(2_000_000));
            assert_eq!(early.state(cs), ThreadState::Ready);
            assert_eq!(late.state(cs), ThreadState::Sleeping);
            // The expired node is off the queue, the pending one is not.
            assert!(!ne.link().is_linked());
            assert!(nl.link().is_linked());

            nl.detach(cs);
            unsafe {
                kerncore::list::Link::detach(&*early);
            }
        });
    }

    #[test]
    fn wakeup_wait_queue_is_fifo_and_bounded() {
        let cur = mkthread("cur", 0);
        let t1 = mkthread("t1", 0);
        let t2 = mkthread("t2", 0);
        let t3 = mkthread("t3", 0);
        with_test_sched(&cur, |cs, sched| {
            let n1 = WaitNode::new(&t1);
            let n2 = WaitNode::new(&t2);
            let n3 = WaitNode::new(&t3);
            let mut queue = WaitQueue::new();
            for (t, n) in [(&t1, &n1), (&t2, &n2), (&t3, &n3)] {
                t.set_state(cs, ThreadState::Waiting);
                unsafe {
                    queue.push_back(NonNull::from(n));
                }
            }

            // Wake at most two: strictly the first two queued.
            let need = sched.wakeup_wait_queue(cs, &mut queue, 0, 2);
            assert!(!need, "equal priority must not force a switch");
            assert_eq!(t1.state(cs), ThreadState::Ready);
            assert_eq!(t2.state(cs), ThreadState::Ready);
            assert_eq!(t3.state(cs), ThreadState::Waiting);
            assert!(n3.link().is_linked());

            n3.detach(cs);
            unsafe {
                kerncore::list::Link::detach(&*t1);
                kerncore::list::Link::detach(&*t2);
            }
        });
    }

    #[test]
    fn wakeup_wait_queue_reports_higher_priority_wake() {
        let cur = mkthread("cur", 0);
        let hi = mkthread("hi", 9);
        with_test_sched(&cur, |cs, sched| {
            let n = WaitNode::new(&hi);
            let mut queue = WaitQueue::new();
            hi.set_state(cs, ThreadState::Waiting);
            unsafe {
                queue.push_back(NonNull::from(&n));
            }
            assert!(sched.wakeup_wait_queue(cs, &mut queue, 7, 0));
            assert_eq!(hi.state(cs), ThreadState::Ready);
            // The wake value lands in the woken thread's errno slot.
            assert_eq!(hi.errno(cs), 7);

            unsafe {
                kerncore::list::Link::detach(&*hi);
            }
        });
    }

    #[test]
    fn wake_all_deleted_flags_and_readies() {
        let cur = mkthread("cur", 0);
        let t = mkthread("t", 2);
        with_test_sched(&cur, |cs, sched| {
            let n = WaitNode::new(&t);
            let mut queue = WaitQueue::new();
            t.set_state(cs, ThreadState::Waiting);
            unsafe {
                queue.push_back(NonNull::from(&n));
            }
            let need = sched.wake_all_deleted(cs, &mut queue);
            assert!(need);
            assert!(n.target_deleted());
            assert_eq!(t.state(cs), ThreadState::Ready);
            assert!(queue.is_empty());

            unsafe {
                kerncore::list::Link::detach(&*t);
            }
        });
    }

    #[test]
    fn zombie_routing_detached_goes_to_reaper() {
        let cur = mkthread("cur", 0);
        let idle = mkthread("idle", -16);
        with_test_sched(&cur, |cs, sched| {
            idle.set_state(cs, ThreadState::Waiting);
            sched.make_ready(cs, &idle);
            cur.set_state(cs, ThreadState::Zombie);
            cur.set_return_value(cs, 42);

            sched.select(cs, fake_sp(&cur));
            // The zombie was parked, not requeued.
            assert!(cur.sched_link.is_linked());
            let mut drained = List::new();
            sched.drain_zombies(&mut drained);
            let z = unsafe { drained.pop_front().unwrap() };
            assert_eq!(z.as_ptr() as *const ThreadCb, &*cur as *const _);

            unsafe {
                kerncore::list::Link::detach(&*idle);
            }
        });
    }
}
