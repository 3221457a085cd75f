// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait nodes: the stack-resident records that put a thread on a queue.
//!
//! A blocking operation builds a [`WaitNode`] in its own stack frame, links
//! it onto the target object's wait queue (and, for timed waits, a second
//! node onto the scheduler's sleep queue), and suspends. Whoever wakes the
//! thread -- a release, the tick, object deletion -- detaches the node;
//! the waiter detaches again on its way out, which is why detach is
//! idempotent. Since the node's lifetime is the blocking function's stack
//! frame, and that frame cannot unwind while the thread is suspended,
//! queueing never allocates.

use core::cell::Cell;
use core::ptr::NonNull;

use kerncore::list::{Link, Linked, List};

use crate::thread::ThreadCb;
use crate::time::Timestamp;

/// An object's queue of blocked waiters, FIFO by insertion.
pub(crate) type WaitQueue = List<WaitNode>;

/// One thread's membership in one wait queue (or the sleep queue).
pub struct WaitNode {
    /// The thread whose operation is in progress. Always the thread that
    /// built the node; kept alive for the node's whole lifetime by its own
    /// suspension.
    thread: NonNull<ThreadCb>,
    /// Absolute wakeup time; only meaningful while the node is on the sleep
    /// queue.
    resume_time: Cell<Timestamp>,
    /// Set by the object's deletion path; tells the waiter its syscall must
    /// fail with `InvalidArgument` instead of retrying.
    target_deleted: Cell<bool>,
    link: Link<WaitNode>,
}

impl WaitNode {
    /// Builds a node for `thread`, which must be the calling thread.
    pub fn new(thread: &ThreadCb) -> Self {
        Self {
            thread: NonNull::from(thread),
            resume_time: Cell::new(Timestamp::ZERO),
            target_deleted: Cell::new(false),
            link: Link::new(),
        }
    }

    pub(crate) fn thread(&self) -> NonNull<ThreadCb> {
        self.thread
    }

    pub fn resume_time(&self) -> Timestamp {
        self.resume_time.get()
    }

    pub fn set_resume_time(&self, t: Timestamp) {
        self.resume_time.set(t);
    }

    pub fn target_deleted(&self) -> bool {
        self.target_deleted.get()
    }

    pub(crate) fn mark_target_deleted(&self) {
        self.target_deleted.set(true);
    }

    /// Unlinks this node from whatever queue it is on; harmless if the
    /// other side of a wakeup race already did.
    pub fn detach(&self, _cs: critical_section::CriticalSection<'_>) {
        // Safety: the mask is raised (token), and every list a node can be
        // on -- an object's wait queue, the scheduler's sleep queue --
        // outlives the node: objects drain their queues before dying, and
        // the scheduler's queues are static.
        unsafe {
            Link::detach(self);
        }
    }
}

impl Linked for WaitNode {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

// Safety: wait nodes move between "threads" only in the sense that wakers
// touch them through the queues; every such access happens under the
// interrupt-mask gate.
unsafe impl Send for WaitNode {}
