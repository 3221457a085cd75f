// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive doubly-linked lists.
//!
//! Nodes carry their own link fields (a [`Link`] embedded in the node type),
//! so the list itself never allocates or frees anything. This is what lets
//! wait records live in the stack frame of a blocked function and thread
//! control blocks move between scheduler lists, all while the interrupt mask
//! is raised and the allocator is off limits.
//!
//! # Safety model
//!
//! The list stores raw `NonNull` pointers to nodes it does not own, so the
//! mutating operations are `unsafe` and share one contract:
//!
//! - A node must outlive its membership in any list. (In the kernel this is
//!   arranged structurally: wait nodes are detached before their stack frame
//!   unwinds, and control blocks are kept alive by the handle table while
//!   linked.)
//! - A node is a member of at most one list at a time. [`Link::detach`] is
//!   the idempotent escape hatch for code paths that may race to unlink the
//!   same node.
//! - A list must not be moved while it has members, since member nodes point
//!   back at it.
//! - All access to a given list and its members is serialized externally; in
//!   the kernel, by the interrupt-mask gate.
//!
//! Dropping a [`Link`] that is still on a list is a kernel bug and panics.

use core::cell::Cell;
use core::ptr::NonNull;

/// Link fields embedded in a listable node.
///
/// The fields are `Cell`s because neighbors are adjusted through shared
/// references to the nodes; exclusivity is provided by the serialization
/// contract above, not by `&mut`.
pub struct Link<T: Linked> {
    prev: Cell<Option<NonNull<T>>>,
    next: Cell<Option<NonNull<T>>>,
    list: Cell<Option<NonNull<List<T>>>>,
}

impl<T: Linked> Link<T> {
    pub const fn new() -> Self {
        Self {
            prev: Cell::new(None),
            next: Cell::new(None),
            list: Cell::new(None),
        }
    }

    /// Checks whether this node is currently on some list.
    pub fn is_linked(&self) -> bool {
        self.list.get().is_some()
    }

    /// Returns the node after this one on its list, if any.
    pub fn next_node(&self) -> Option<NonNull<T>> {
        self.next.get()
    }
}

impl<T: Linked> Default for Link<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> Drop for Link<T> {
    fn drop(&mut self) {
        // A node going away while a list still points at it means someone
        // skipped a detach on an exit path. That list now contains a dangling
        // pointer, so there is no way to limp onward.
        if self.list.get().is_some() {
            panic!("node dropped while linked");
        }
    }
}

/// Trait connecting a node type to its embedded [`Link`].
pub trait Linked: Sized {
    fn link(&self) -> &Link<Self>;
}

/// An intrusive list head.
pub struct List<T: Linked> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
}

impl<T: Linked> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the first node without removing it.
    pub fn head(&self) -> Option<NonNull<T>> {
        self.head
    }

    /// Appends `node` at the tail.
    ///
    /// # Safety
    ///
    /// `node` must not currently be on any list, and the module-level
    /// contract applies.
    pub unsafe fn push_back(&mut self, node: NonNull<T>) {
        let link = unsafe { node.as_ref() }.link();
        debug_assert!(!link.is_linked());
        link.list.set(Some(NonNull::from(&mut *self)));
        link.prev.set(self.tail);
        link.next.set(None);
        match self.tail {
            Some(tail) => unsafe { tail.as_ref() }.link().next.set(Some(node)),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
    }

    /// Inserts `node` immediately before `at`, which must be a member of this
    /// list.
    ///
    /// # Safety
    ///
    /// As for `push_back`, plus: `at` must be linked on `self`.
    pub unsafe fn insert_before(&mut self, at: NonNull<T>, node: NonNull<T>) {
        let at_link = unsafe { at.as_ref() }.link();
        debug_assert_eq!(
            at_link.list.get().map(NonNull::as_ptr),
            Some(self as *mut _)
        );
        let link = unsafe { node.as_ref() }.link();
        debug_assert!(!link.is_linked());

        let prev = at_link.prev.get();
        link.list.set(Some(NonNull::from(&mut *self)));
        link.prev.set(prev);
        link.next.set(Some(at));
        at_link.prev.set(Some(node));
        match prev {
            Some(p) => unsafe { p.as_ref() }.link().next.set(Some(node)),
            None => self.head = Some(node),
        }
    }

    /// Removes and returns the first node.
    ///
    /// # Safety
    ///
    /// Module-level contract.
    pub unsafe fn pop_front(&mut self) -> Option<NonNull<T>> {
        let node = self.head?;
        unsafe {
            self.remove(node);
        }
        Some(node)
    }

    /// Unlinks `node`, which must be a member of this list.
    ///
    /// # Safety
    ///
    /// `node` must be linked on `self`.
    pub unsafe fn remove(&mut self, node: NonNull<T>) {
        let link = unsafe { node.as_ref() }.link();
        debug_assert_eq!(
            link.list.get().map(NonNull::as_ptr),
            Some(self as *mut _)
        );

        let prev = link.prev.get();
        let next = link.next.get();
        match prev {
            Some(p) => unsafe { p.as_ref() }.link().next.set(next),
            None => self.head = next,
        }
        match next {
            Some(n) => unsafe { n.as_ref() }.link().prev.set(prev),
            None => self.tail = prev,
        }
        link.prev.set(None);
        link.next.set(None);
        link.list.set(None);
    }
}

impl<T: Linked> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: a list owns nothing; it holds pointers to nodes whose access is
// serialized by the module-level contract. Moving a list head between
// threads is fine as long as the nodes themselves may be touched there,
// hence the `T: Send` bound.
unsafe impl<T: Linked + Send> Send for List<T> {}

impl<T: Linked> Link<T> {
    /// Unlinks `node` from whatever list it is on, if any.
    ///
    /// This is deliberately idempotent: wait nodes are detached both by the
    /// waiter on its way out and by whoever woke it, and whichever side runs
    /// first wins.
    ///
    /// # Safety
    ///
    /// If the node is linked, the owning list must still exist at its
    /// recorded address, and the module-level serialization contract applies.
    pub unsafe fn detach(node: &T) {
        if let Some(mut list) = node.link().list.get() {
            unsafe {
                list.as_mut().remove(NonNull::from(node));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestNode {
        value: u32,
        link: Link<TestNode>,
    }

    impl TestNode {
        fn new(value: u32) -> Self {
            Self {
                value,
                link: Link::new(),
            }
        }
    }

    impl Linked for TestNode {
        fn link(&self) -> &Link<Self> {
            &self.link
        }
    }

    fn collect(list: &List<TestNode>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = list.head();
        while let Some(node) = cursor {
            let node = unsafe { node.as_ref() };
            out.push(node.value);
            cursor = node.link().next_node();
        }
        out
    }

    #[test]
    fn push_pop_is_fifo() {
        let a = TestNode::new(1);
        let b = TestNode::new(2);
        let c = TestNode::new(3);
        let mut list = List::new();
        unsafe {
            list.push_back(NonNull::from(&a));
            list.push_back(NonNull::from(&b));
            list.push_back(NonNull::from(&c));
        }
        assert_eq!(collect(&list), [1, 2, 3]);
        unsafe {
            assert_eq!(list.pop_front().unwrap().as_ref().value, 1);
            assert_eq!(list.pop_front().unwrap().as_ref().value, 2);
            assert_eq!(list.pop_front().unwrap().as_ref().value, 3);
            assert!(list.pop_front().is_none());
        }
        assert!(list.is_empty());
    }

    #[test]
    fn remove_from_middle_preserves_neighbors() {
        let a = TestNode::new(1);
        let b = TestNode::new(2);
        let c = TestNode::new(3);
        let mut list = List::new();
        unsafe {
            list.push_back(NonNull::from(&a));
            list.push_back(NonNull::from(&b));
            list.push_back(NonNull::from(&c));
            list.remove(NonNull::from(&b));
        }
        assert!(!b.link.is_linked());
        assert_eq!(collect(&list), [1, 3]);
        unsafe {
            list.remove(NonNull::from(&a));
            list.remove(NonNull::from(&c));
        }
        assert!(list.is_empty());
    }

    #[test]
    fn insert_before_head_and_interior() {
        let a = TestNode::new(1);
        let b = TestNode::new(2);
        let c = TestNode::new(3);
        let mut list = List::new();
        unsafe {
            list.push_back(NonNull::from(&b));
            // Before the head.
            list.insert_before(NonNull::from(&b), NonNull::from(&a));
            assert_eq!(collect(&list), [1, 2]);
            // Interior.
            list.insert_before(NonNull::from(&b), NonNull::from(&c));
        }
        assert_eq!(collect(&list), [1, 3, 2]);
        unsafe {
            list.remove(NonNull::from(&a));
            list.remove(NonNull::from(&b));
            list.remove(NonNull::from(&c));
        }
    }

    #[test]
    fn detach_is_idempotent() {
        let a = TestNode::new(1);
        let b = TestNode::new(2);
        let mut list = List::new();
        unsafe {
            list.push_back(NonNull::from(&a));
            list.push_back(NonNull::from(&b));
            Link::detach(&a);
            // Second detach of an unlinked node is a no-op, not a crash.
            Link::detach(&a);
        }
        assert_eq!(collect(&list), [2]);
        unsafe {
            Link::detach(&b);
        }
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "node dropped while linked")]
    fn dropping_linked_node_panics() {
        let mut list = List::new();
        let a = TestNode::new(1);
        unsafe {
            list.push_back(NonNull::from(&a));
        }
        drop(a);
    }
}
