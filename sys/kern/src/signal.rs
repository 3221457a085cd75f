// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pending/blocked-mask signal model.
//!
//! Signals here are a wakeup-and-flag mechanism, not a full POSIX delivery
//! machine: posting a signal sets a pending bit and, if the target is
//! blocked in an interruptible wait, makes it runnable. The wait loop then
//! consults the target's dispositions -- every deliverable signal marked
//! `RESTART` means the wait silently resumes; anything else surfaces as
//! `Interrupted`. Handlers run in the context of the receiving thread on
//! its way out of the interrupted call, with the action's mask (plus the
//! signal itself, absent `NODEFER`) blocked for the duration.
//!
//! Realtime signals additionally carry a queued payload record per post,
//! kept on an intrusive list in the control block.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

use abi::{
    Handle, KernError, ObjectType, SigAction, SigActionFlags,
    SigMaskHow, SignalDisposition, SignalSet, NRTSIG, NSIG,
};
use kerncore::list::{Link, Linked};

use crate::object;
use crate::sched;
use crate::thread::ThreadCb;

/// Payload record for one queued (realtime) signal post.
pub(crate) struct SignalQueueNode {
    signum: u32,
    #[allow(dead_code)] // read by debuggers out of crash dumps
    value: usize,
    link: Link<SignalQueueNode>,
}

impl Linked for SignalQueueNode {
    fn link(&self) -> &Link<Self> {
        &self.link
    }
}

fn check_signum(signum: u32) -> Result<(), KernError> {
    if (1..=NSIG + NRTSIG).contains(&signum) {
        Ok(())
    } else {
        Err(KernError::InvalidArgument)
    }
}

fn is_realtime(signum: u32) -> bool {
    signum > NSIG
}

/// Marks `signum` pending on `thread` and wakes it if it's interruptibly
/// blocked. `payload`, if any, is queued on the control block.
fn post(thread: &Arc<ThreadCb>, signum: u32, payload: Option<Box<SignalQueueNode>>) {
    let need_switch = critical_section::with(|cs| {
        thread.set_pending_signals(
            cs,
            thread.pending_signals(cs).union(SignalSet::single(signum)),
        );
        if let Some(node) = payload {
            // Leak the box into the intrusive queue; the delivery path (or
            // the control block's drop) re-boxes it.
            let raw = NonNull::from(Box::leak(node));
            // Safety: single-borrow discipline; the node is fresh and
            // unlinked, and it stays alive until delivery or thread
            // teardown re-boxes it.
            unsafe {
                thread
                    .queued_signals
                    .with_mut(cs, |q| q.push_back(raw));
            }
        }

        if thread.blocked_signals(cs).contains(signum) {
            return false;
        }
        sched::with_sched(cs, |sched| {
            use abi::ThreadState::*;
            match thread.state(cs) {
                Sleeping | Waiting => {
                    let urgent = thread.priority_level(cs)
                        > sched::current_priority_level(cs);
                    sched.make_ready(cs, thread);
                    urgent
                }
                _ => false,
            }
        })
    });
    if need_switch {
        crate::arch::request_context_switch();
    }
}

/// Posts `signum` to the thread named by `handle`.
pub fn send_signal(handle: Handle, signum: u32) -> Result<(), KernError> {
    send_signal_value(handle, signum, 0)
}

/// Posts `signum` with an accompanying value. For realtime signals each
/// post queues a payload record; standard signals coalesce as usual.
pub fn send_signal_value(
    handle: Handle,
    signum: u32,
    value: usize,
) -> Result<(), KernError> {
    check_signum(signum)?;
    let thread = object::get_object_of::<ThreadCb>(handle, ObjectType::Thread)
        .ok_or(KernError::InvalidArgument)?;
    // Allocate the payload record before the mask goes up.
    let payload = if is_realtime(signum) {
        Some(Box::new(SignalQueueNode {
            signum,
            value,
            link: Link::new(),
        }))
    } else {
        None
    };
    post(&thread, signum, payload);
    Ok(())
}

/// Adjusts the calling thread's blocked mask; returns the previous mask.
pub fn set_signal_mask(
    how: SigMaskHow,
    set: SignalSet,
) -> Result<SignalSet, KernError> {
    let thread = sched::current_thread();
    Ok(critical_section::with(|cs| {
        let old = thread.blocked_signals(cs);
        let new = match how {
            SigMaskHow::Block => old.union(set),
            SigMaskHow::Unblock => old.difference(set),
            SigMaskHow::SetMask => set,
        };
        thread.set_blocked_signals(cs, new);
        old
    }))
}

/// Installs a new action for `signum` on the calling thread; returns the
/// one it replaces.
pub fn set_signal_action(
    signum: u32,
    action: SigAction,
) -> Result<SigAction, KernError> {
    check_signum(signum)?;
    let thread = sched::current_thread();
    Ok(critical_section::with(|cs| {
        thread.set_signal_action(cs, signum, action)
    }))
}

/// Delivers every currently-deliverable signal to the calling thread:
/// clears the pending bit, discards any queued payload record, and runs the
/// registered handler (if the disposition names one) with the action's mask
/// in force. Blocking calls invoke this on their way out with
/// `Interrupted`.
pub fn process_pending_signals() {
    let thread = sched::current_thread();
    loop {
        // Claim one deliverable signal and its bookkeeping under the mask.
        let claimed = critical_section::with(|cs| {
            let signum = thread.deliverable_signals(cs).first()?;
            thread.set_pending_signals(
                cs,
                thread
                    .pending_signals(cs)
                    .difference(SignalSet::single(signum)),
            );
            // Unqueue one matching payload record, if any.
            // Safety: single-borrow discipline.
            let payload = unsafe {
                thread.queued_signals.with_mut(cs, |q| {
                    let mut cursor = q.head();
                    while let Some(n) = cursor {
                        let node = n.as_ref();
                        if node.signum == signum {
                            q.remove(n);
                            return Some(n);
                        }
                        cursor = node.link().next_node();
                    }
                    None
                })
            };
            let action = thread.signal_action(cs, signum);
            Some((signum, action, payload))
        });
        let Some((signum, action, payload)) = claimed else {
            return;
        };
        // Re-box and free the payload with the mask down.
        if let Some(node) = payload {
            // Safety: removed from the queue above; we own it now.
            drop(unsafe { Box::from_raw(node.as_ptr()) });
        }

        if let SignalDisposition::Handler(handler) = action.disposition {
            // Block the action's mask (and the signal itself, unless
            // NODEFER) for the duration of the handler.
            let saved = critical_section::with(|cs| {
                let old = thread.blocked_signals(cs);
                let mut during = old.union(action.mask);
                if !action.flags.contains(SigActionFlags::NODEFER) {
                    during = during.union(SignalSet::single(signum));
                }
                thread.set_blocked_signals(cs, during);
                old
            });
            handler(signum as i32);
            critical_section::with(|cs| {
                thread.set_blocked_signals(cs, saved);
            });
        }
        // Default and Ignore dispositions: the kernel core drops the
        // signal. Process-level default actions belong to the runtime
        // above.
    }
}
