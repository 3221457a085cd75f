// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Portable kernel data structures.
//!
//! This crate holds the parts of the kernel that are pure data manipulation:
//! the intrusive lists that queue threads and wait records without touching
//! the allocator, and the sparse handle table that names kernel objects. None
//! of this code knows about interrupts or scheduling -- the `kern` crate is
//! responsible for only calling in here with the interrupt mask raised where
//! that matters.
//!
//! Keeping these separate lets us unit test the fiddly pointer and index
//! manipulation on the host, where Miri and `cargo test` can see it.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod handles;
pub mod list;
