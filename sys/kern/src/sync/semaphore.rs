// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores, with an optional recursive mode in which the
//! holding thread can re-acquire without new permits.

use alloc::sync::Arc;
use core::any::Any;

use abi::{Handle, KernError, ObjectType, ThreadState};

use crate::irq::GateCell;
use crate::object::{KernelObject, ObjectBase};
use crate::sched;
use crate::time::Timestamp;
use crate::wait::WaitNode;

#[derive(Copy, Clone)]
struct SemState {
    /// Available permits.
    count: u32,
    /// Thread whose acquires currently hold the semaphore; only meaningful
    /// in recursive mode.
    holder: Handle,
    /// Re-acquisition depth of `holder` in recursive mode.
    depth: u32,
}

pub struct Semaphore {
    base: ObjectBase,
    recursive: bool,
    state: GateCell<SemState>,
}

impl Semaphore {
    pub fn new(name: &str, initial_count: u32, recursive: bool) -> Arc<Self> {
        Arc::new(Self {
            base: ObjectBase::new(name, ObjectType::Semaphore),
            recursive,
            state: GateCell::new(SemState {
                count: initial_count,
                holder: Handle::INVALID,
                depth: 0,
            }),
        })
    }

    pub fn count(&self) -> u32 {
        critical_section::with(|cs| self.state.get(cs).count)
    }

    /// The take rule, applied under the gate: a permit if one is free, or a
    /// depth bump if we're the recursive holder.
    fn try_take(
        &self,
        cs: critical_section::CriticalSection<'_>,
        me: Handle,
    ) -> bool {
        let mut st = self.state.get(cs);
        if self.recursive && st.depth > 0 && st.holder == me {
            st.depth += 1;
            self.state.set(cs, st);
            return true;
        }
        if st.count > 0 {
            st.count -= 1;
            if self.recursive {
                st.holder = me;
                st.depth = 1;
            }
            self.state.set(cs, st);
            return true;
        }
        false
    }

    /// Blocking acquire with an optional absolute deadline.
    fn acquire_inner(
        &self,
        deadline: Option<Timestamp>,
    ) -> Result<(), KernError> {
        let thread = sched::current_thread();
        let me = critical_section::with(|cs| thread.handle(cs));
        loop {
            let node = WaitNode::new(thread);
            let sleep_node = WaitNode::new(thread);

            let took = critical_section::with(|cs| {
                if self.try_take(cs, me) {
                    return Ok(true);
                }
                if let Some(d) = deadline {
                    if crate::arch::now() >= d {
                        return Err(KernError::TimedOut);
                    }
                }
                // Safety: single-borrow discipline; the node is fresh.
                unsafe {
                    self.base
                        .wait_queue
                        .with_mut(cs, |q| q.push_back((&node).into()));
                }
                thread.set_blocking_object(cs, self.base.handle(cs));
                if let Some(d) = deadline {
                    sleep_node.set_resume_time(d);
                    sched::with_sched(cs, |s| {
                        s.add_to_sleep_queue(cs, &sleep_node)
                    });
                    thread.set_state(cs, ThreadState::Sleeping);
                } else {
                    thread.set_state(cs, ThreadState::Waiting);
                }
                crate::arch::request_context_switch();
                Ok(false)
            });
            match took {
                Ok(true) => return Ok(()),
                Err(e) => return Err(e),
                Ok(false) => {}
            }

            // The switch lands once the mask drops; we resume here when
            // something -- release, tick, deletion, signal -- wakes us.
            let deleted = critical_section::with(|cs| {
                node.detach(cs);
                sleep_node.detach(cs);
                thread.set_blocking_object(cs, Handle::INVALID);
                node.target_deleted()
            });
            if deleted {
                return Err(KernError::InvalidArgument);
            }
            if !critical_section::with(|cs| thread.wants_restart(cs)) {
                return Err(KernError::Interrupted);
            }
            // Spurious or restartable wake: go try again. The loop top
            // re-applies the deadline, so expiry is never silently eaten.
        }
    }

    pub fn acquire(&self) -> Result<(), KernError> {
        self.acquire_inner(None)
    }

    pub fn acquire_deadline(
        &self,
        deadline: Timestamp,
    ) -> Result<(), KernError> {
        self.acquire_inner(Some(deadline))
    }

    pub fn acquire_timeout(&self, nanos: u64) -> Result<(), KernError> {
        self.acquire_inner(Some(
            crate::arch::now().saturating_add_nanos(nanos),
        ))
    }

    pub fn try_acquire(&self) -> Result<(), KernError> {
        let thread = sched::current_thread();
        critical_section::with(|cs| {
            let me = thread.handle(cs);
            if self.try_take(cs, me) {
                Ok(())
            } else {
                Err(KernError::WouldBlock)
            }
        })
    }

    /// Returns a permit and wakes as many queued waiters as there are now
    /// permits; the woken threads still race for them, losing is a spurious
    /// wake.
    pub fn release(&self) -> Result<(), KernError> {
        let need_switch = critical_section::with(|cs| {
            let mut st = self.state.get(cs);
            if self.recursive && st.depth > 1 {
                st.depth -= 1;
                self.state.set(cs, st);
                return false;
            }
            st.count += 1;
            st.holder = Handle::INVALID;
            st.depth = 0;
            self.state.set(cs, st);
            let wake = st.count as usize;
            // Safety: single-borrow discipline; nested cells distinct.
            unsafe {
                self.base.wait_queue.with_mut(cs, |q| {
                    sched::with_sched(cs, |s| {
                        s.wakeup_wait_queue(cs, q, 0, wake)
                    })
                })
            }
        });
        if need_switch {
            crate::arch::request_context_switch();
        }
        Ok(())
    }
}

impl KernelObject for Semaphore {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{install_current, mkthread};
    use core::ptr::NonNull;

    #[test]
    fn counts_balance_across_acquire_release() {
        let _cur = install_current("cur", 0);
        let sem = Semaphore::new("s", 2, false);
        assert_eq!(sem.count(), 2);
        sem.try_acquire().unwrap();
        sem.try_acquire().unwrap();
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.try_acquire(), Err(KernError::WouldBlock));
        sem.release().unwrap();
        sem.release().unwrap();
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn zero_count_try_acquire_would_block() {
        let _cur = install_current("cur", 0);
        let sem = Semaphore::new("s", 0, false);
        assert_eq!(sem.try_acquire(), Err(KernError::WouldBlock));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn expired_deadline_times_out_without_enqueueing() {
        let _cur = install_current("cur", 0);
        let sem = Semaphore::new("s", 0, false);
        crate::arch::set_time(Timestamp::from(5_000_000));
        assert_eq!(
            sem.acquire_deadline(Timestamp::from(5_000_000)),
            Err(KernError::TimedOut),
        );
        critical_section::with(|cs| {
            // Safety: test-only peek.
            unsafe {
                sem.base.wait_queue.with_mut(cs, |q| assert!(q.is_empty()));
            }
        });
    }

    #[test]
    fn recursive_holder_reacquires_without_permits() {
        let _cur = install_current("cur", 0);
        let sem = Semaphore::new("s", 1, true);
        sem.try_acquire().unwrap();
        assert_eq!(sem.count(), 0);
        // Depth 2, no permits consumed.
        sem.try_acquire().unwrap();
        sem.release().unwrap();
        assert_eq!(sem.count(), 0, "inner release only unwinds depth");
        sem.release().unwrap();
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn release_wakes_queued_waiter_fifo() {
        let _cur = install_current("cur", 0);
        let sem = Semaphore::new("s", 0, false);
        let w1 = mkthread("w1", 0);
        let w2 = mkthread("w2", 0);
        let n1 = WaitNode::new(&w1);
        let n2 = WaitNode::new(&w2);
        critical_section::with(|cs| {
            w1.set_state(cs, ThreadState::Waiting);
            w2.set_state(cs, ThreadState::Waiting);
            // Safety: test mimics the enqueue the blocking path performs.
            unsafe {
                sem.base.wait_queue.with_mut(cs, |q| {
                    q.push_back(NonNull::from(&n1));
                    q.push_back(NonNull::from(&n2));
                });
            }
        });

        sem.release().unwrap();
        critical_section::with(|cs| {
            assert_eq!(w1.state(cs), ThreadState::Ready);
            assert_eq!(
                w2.state(cs),
                ThreadState::Waiting,
                "one permit wakes exactly the head waiter"
            );
            n2.detach(cs);
            // Pull w1 back off the test scheduler's ready list.
            unsafe {
                kerncore::list::Link::detach(&*w1);
            }
        });
    }
}
