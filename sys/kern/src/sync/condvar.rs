// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Condition variables.
//!
//! A condition variable is bound to a mutex per call, not per object: the
//! mutex is an argument to `wait`. The load-bearing property is atomicity
//! of queue-then-unlock -- both happen inside one critical section, so a
//! notify between "decided to wait" and "actually waiting" cannot be lost.
//! On the way out the mutex is reacquired unconditionally, whatever the
//! wait's own verdict was; a caller always leaves holding its mutex unless
//! the mutex itself was deleted out from under it.
//!
//! Waking without a notify is possible (deletion aside, any wake reports
//! success); callers re-check their predicate under the reacquired mutex,
//! as condition variable users always must.

use alloc::sync::Arc;
use core::any::Any;

use abi::{Handle, KernError, ObjectType, ThreadState};

use crate::object::{KernelObject, ObjectBase};
use crate::sched;
use crate::sync::Mutex;
use crate::time::Timestamp;
use crate::wait::WaitNode;

pub struct CondVar {
    base: ObjectBase,
}

impl CondVar {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            base: ObjectBase::new(name, ObjectType::ConditionVariable),
        })
    }

    /// Releases `mutex`, waits for a notification (or `deadline`), then
    /// reacquires `mutex`.
    ///
    /// The caller must hold `mutex` exclusively and non-recursively.
    pub fn wait(
        &self,
        mutex: &Arc<Mutex>,
        deadline: Option<Timestamp>,
    ) -> Result<(), KernError> {
        let thread = sched::current_thread();
        let node = WaitNode::new(thread);
        let sleep_node = WaitNode::new(thread);

        critical_section::with(|cs| {
            let me = thread.handle(cs);
            // Queue first, then unlock, all under one mask: a notifier that
            // grabs the mutex the moment it's free already sees us queued.
            // Safety: single-borrow discipline; fresh node.
            unsafe {
                self.base
                    .wait_queue
                    .with_mut(cs, |q| q.push_back((&node).into()));
            }
            match mutex.release_for_wait(cs, me) {
                Ok(()) => {}
                Err(e) => {
                    node.detach(cs);
                    return Err(e);
                }
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
            Ok(())
        })?;

        // Suspended until notified, timed out, or the condvar was deleted.
        let deleted = critical_section::with(|cs| {
            node.detach(cs);
            sleep_node.detach(cs);
            thread.set_blocking_object(cs, Handle::INVALID);
            node.target_deleted()
        });
        let verdict = if deleted {
            Err(KernError::InvalidArgument)
        } else if deadline.is_some_and(|d| crate::arch::now() >= d) {
            Err(KernError::TimedOut)
        } else {
            Ok(())
        };

        // Reacquire regardless of the verdict; only the mutex vanishing
        // outranks it.
        mutex.lock_for_wait()?;
        verdict
    }

    pub fn wait_timeout(
        &self,
        mutex: &Arc<Mutex>,
        nanos: u64,
    ) -> Result<(), KernError> {
        self.wait(
            mutex,
            Some(crate::arch::now().saturating_add_nanos(nanos)),
        )
    }

    /// Wakes the longest-waiting thread, if any.
    pub fn notify_one(&self) -> Result<(), KernError> {
        self.notify(1)
    }

    /// Wakes every waiter; they contend for the mutex as usual.
    pub fn notify_all(&self) -> Result<(), KernError> {
        self.notify(0)
    }

    fn notify(&self, max_count: usize) -> Result<(), KernError> {
        let need_switch = critical_section::with(|cs| {
            // Safety: single-borrow discipline.
            unsafe {
                self.base.wait_queue.with_mut(cs, |q| {
                    sched::with_sched(cs, |s| {
                        s.wakeup_wait_queue(cs, q, 0, max_count)
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

impl KernelObject for CondVar {
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
    use kerncore::list::Linked;

    #[test]
    fn wait_requires_holding_the_mutex() {
        let _cur = install_current("cur", 0);
        let cv = CondVar::new("cv");
        let m = Mutex::new("m", false);
        assert_eq!(cv.wait(&m, None), Err(KernError::NotOwner));
        // Nothing left queued by the failed attempt.
        critical_section::with(|cs| {
            // Safety: test-only peek.
            unsafe {
                cv.base.wait_queue.with_mut(cs, |q| assert!(q.is_empty()));
            }
        });
    }

    #[test]
    fn wait_refuses_recursively_held_mutex() {
        let _cur = install_current("cur", 0);
        let cv = CondVar::new("cv");
        let m = Mutex::new("m", true);
        m.try_lock().unwrap();
        m.try_lock().unwrap();
        assert_eq!(cv.wait(&m, None), Err(KernError::InvalidArgument));
        assert!(m.is_locked_by_current());
        m.unlock().unwrap();
        m.unlock().unwrap();
    }

    #[test]
    fn notify_one_wakes_head_waiter_only() {
        let _cur = install_current("cur", 0);
        let cv = CondVar::new("cv");
        let w1 = mkthread("w1", 0);
        let w2 = mkthread("w2", 0);
        let n1 = WaitNode::new(&w1);
        let n2 = WaitNode::new(&w2);
        critical_section::with(|cs| {
            w1.set_state(cs, ThreadState::Waiting);
            w2.set_state(cs, ThreadState::Waiting);
            // Safety: test mimics `wait`'s enqueue.
            unsafe {
                cv.base.wait_queue.with_mut(cs, |q| {
                    q.push_back(NonNull::from(&n1));
                    q.push_back(NonNull::from(&n2));
                });
            }
        });
        cv.notify_one().unwrap();
        critical_section::with(|cs| {
            assert_eq!(w1.state(cs), ThreadState::Ready);
            assert_eq!(w2.state(cs), ThreadState::Waiting);
            n2.detach(cs);
            unsafe {
                kerncore::list::Link::detach(&*w1);
            }
        });
    }

    #[test]
    fn notify_all_drains_the_queue() {
        let _cur = install_current("cur", 0);
        let cv = CondVar::new("cv");
        let w1 = mkthread("w1", 0);
        let w2 = mkthread("w2", 0);
        let n1 = WaitNode::new(&w1);
        let n2 = WaitNode::new(&w2);
        critical_section::with(|cs| {
            w1.set_state(cs, ThreadState::Waiting);
            w2.set_state(cs, ThreadState::Waiting);
            // Safety: as above.
            unsafe {
                cv.base.wait_queue.with_mut(cs, |q| {
                    q.push_back(NonNull::from(&n1));
                    q.push_back(NonNull::from(&n2));
                });
            }
        });
        cv.notify_all().unwrap();
        critical_section::with(|cs| {
            assert_eq!(w1.state(cs), ThreadState::Ready);
            assert_eq!(w2.state(cs), ThreadState::Ready);
            assert!(!n1.link().is_linked());
            assert!(!n2.link().is_linked());
            unsafe {
                kerncore::list::Link::detach(&*w1);
                kerncore::list::Link::detach(&*w2);
            }
        });
    }
}
