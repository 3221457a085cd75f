// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives: semaphore, mutex, condition variable.
//!
//! All three share one blocking skeleton, inherited from the scheduler's
//! wait machinery: under the gate, try to take; failing that, queue a
//! stack-resident wait node (two for timed waits -- one on the object, one
//! on the sleep queue), mark the thread blocked, and request a switch. On
//! resume, detach everything and decide *why* we woke: took it, object
//! deleted (`InvalidArgument`), deadline passed (`TimedOut`), interrupting
//! signal (`Interrupted`), or none of the above -- a spurious wake or lost
//! race -- in which case the loop quietly goes around again. Callers never
//! see spurious wakeups; the loop is the contract.

pub mod condvar;
pub mod mutex;
pub mod semaphore;

pub use condvar::CondVar;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
