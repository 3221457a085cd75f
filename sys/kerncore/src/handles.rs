// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sparse handle table.
//!
//! Handles are 24-bit integers resolved through a three-level trie with a
//! fan-out of 256 at each level: the top level is inline in the table, and
//! the middle ("mid") and bottom ("leaf") levels are heap blocks installed on
//! demand. Unused subtrees cost nothing but a `None`. Three levels of 256
//! cover the whole space (`256^3 = 2^24`), so every lookup is exactly three
//! indexing steps -- bounded time, no allocator.
//!
//! The delicate requirement is that handle allocation must be able to finish
//! with interrupts masked, when the allocator may not be called. The table
//! therefore keeps a small pool of pre-allocated spare blocks, and
//! [`HandleTable::try_alloc`] draws on that pool instead of the heap. The
//! caller is responsible for topping the pool up *outside* the masked region
//! (see [`HandleTable::needs_refill`] / [`HandleTable::refill`]) and for
//! dropping anything this module hands back -- freed values, spilled blocks
//! -- only after the mask is released.

use alloc::boxed::Box;

/// Fan-out of each trie level, and the number of index bits consumed per
/// level (8).
pub const BLOCK_SIZE: usize = 256;

/// Width of the handle space in bits.
pub const HANDLE_BITS: u32 = 24;

/// Total number of representable handles.
pub const HANDLE_CAPACITY: u32 = 1 << HANDLE_BITS;

/// Upper bound on wrap-collision probes in one `try_alloc` call. When the
/// counter wraps into a region of live handles, we skip forward at most this
/// many slots before reporting the table as effectively full. A bound here
/// trades spurious failure under extreme churn for a hard ceiling on time
/// spent with interrupts masked.
const MAX_ALLOC_PROBES: u32 = 1024;

/// Number of spare blocks of each kind the table tries to keep on hand. One
/// allocation consumes at most one block of each kind, so running the pool
/// down to one of each is the low-water mark that triggers a refill.
const SPARES_PER_KIND: usize = 2;

/// One entry of a leaf block.
enum Slot<T> {
    /// Handle not allocated.
    Free,
    /// Handle allocated by `try_alloc` but no object stored yet. Resolves to
    /// nothing, but is not available for re-allocation.
    Reserved,
    /// Handle allocated and populated.
    Occupied(T),
}

impl<T> Slot<T> {
    fn is_free(&self) -> bool {
        matches!(self, Slot::Free)
    }
}

/// Bottom-level block: 256 object slots.
pub struct LeafBlock<T> {
    slots: [Slot<T>; BLOCK_SIZE],
    used: u16,
}

impl<T> LeafBlock<T> {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: [const { Slot::Free }; BLOCK_SIZE],
            used: 0,
        })
    }
}

/// Middle-level block: 256 leaf pointers.
pub struct MidBlock<T> {
    children: [Option<Box<LeafBlock<T>>>; BLOCK_SIZE],
    used: u16,
}

impl<T> MidBlock<T> {
    fn new() -> Box<Self> {
        Box::new(Self {
            children: [const { None }; BLOCK_SIZE],
            used: 0,
        })
    }
}

/// Why `try_alloc` could not produce a handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocError {
    /// The spare-block pool could not cover the path to a fresh slot. Refill
    /// the pool (with the mask released!) and retry.
    NeedSpares,
    /// The handle space is full, or churn defeated the bounded collision
    /// scan. Either way the caller should report out-of-memory.
    Exhausted,
}

/// Fresh or spilled spare blocks, carried across the mask boundary.
///
/// Returned non-empty from [`HandleTable::refill`] when the pool was already
/// full, and built by [`HandleTable::new_spares`] on the way in. Dropping
/// this frees heap, so only drop it with interrupts enabled.
pub struct SpareBlocks<T> {
    mid: Option<Box<MidBlock<T>>>,
    leaf: Option<Box<LeafBlock<T>>>,
}

impl<T> SpareBlocks<T> {
    pub fn is_empty(&self) -> bool {
        self.mid.is_none() && self.leaf.is_none()
    }
}

/// Everything that leaves the table when a handle is freed: the stored value
/// (if one was set) and any blocks that became empty and did not fit back in
/// the spare pool.
///
/// Like [`SpareBlocks`], this exists so the caller can delay the actual
/// freeing until after the interrupt mask is released.
pub struct Removed<T> {
    value: Option<T>,
    spilled_mid: Option<Box<MidBlock<T>>>,
    spilled_leaf: Option<Box<LeafBlock<T>>>,
}

impl<T> Removed<T> {
    /// The object that was stored under the freed handle, if `set` had been
    /// called.
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

/// Three-level sparse map from handle to `T`.
///
/// `T` is expected to be a cheaply clonable reference type (the kernel uses
/// `Arc`s); `get` hands out clones so the table never lends references into
/// its own storage.
pub struct HandleTable<T> {
    top: [Option<Box<MidBlock<T>>>; BLOCK_SIZE],
    /// Total number of live handles; the trie's top-level used count.
    live: u32,
    /// Monotonic allocation cursor, wrapping at `HANDLE_BITS`.
    next_handle: u32,
    spare_mid: [Option<Box<MidBlock<T>>>; SPARES_PER_KIND],
    spare_leaf: [Option<Box<LeafBlock<T>>>; SPARES_PER_KIND],
}

fn split(handle: u32) -> (usize, usize, usize) {
    (
        ((handle >> 16) & 0xff) as usize,
        ((handle >> 8) & 0xff) as usize,
        (handle & 0xff) as usize,
    )
}

impl<T: Clone> HandleTable<T> {
    pub const fn new() -> Self {
        Self {
            top: [const { None }; BLOCK_SIZE],
            live: 0,
            next_handle: 0,
            spare_mid: [const { None }; SPARES_PER_KIND],
            spare_leaf: [const { None }; SPARES_PER_KIND],
        }
    }

    /// Number of live handles in the table.
    pub fn live_handles(&self) -> u32 {
        self.live
    }

    /// Checks whether the spare pool is below its low-water mark. When this
    /// returns true, call [`HandleTable::new_spares`] (allocator allowed)
    /// followed by [`HandleTable::refill`] before the next `try_alloc`.
    pub fn needs_refill(&self) -> bool {
        self.spare_mid.iter().filter(|b| b.is_some()).count()
            < SPARES_PER_KIND
            || self.spare_leaf.iter().filter(|b| b.is_some()).count()
                < SPARES_PER_KIND
    }

    /// Allocates one spare block of each kind from the heap. Call with
    /// interrupts enabled.
    pub fn new_spares() -> SpareBlocks<T> {
        SpareBlocks {
            mid: Some(MidBlock::new()),
            leaf: Some(LeafBlock::new()),
        }
    }

    /// Stores `spares` into the pool. Whatever does not fit is handed back
    /// and must be dropped by the caller, outside the masked region.
    #[must_use]
    pub fn refill(&mut self, mut spares: SpareBlocks<T>) -> SpareBlocks<T> {
        for slot in &mut self.spare_mid {
            if slot.is_none() {
                if let Some(b) = spares.mid.take() {
                    *slot = Some(b);
                }
            }
        }
        for slot in &mut self.spare_leaf {
            if slot.is_none() {
                if let Some(b) = spares.leaf.take() {
                    *slot = Some(b);
                }
            }
        }
        spares
    }

    fn take_spare_mid(&mut self) -> Option<Box<MidBlock<T>>> {
        self.spare_mid.iter_mut().find_map(|slot| slot.take())
    }

    fn take_spare_leaf(&mut self) -> Option<Box<LeafBlock<T>>> {
        self.spare_leaf.iter_mut().find_map(|slot| slot.take())
    }

    /// Returns `block` to the spare pool, or hands it back if the pool is
    /// full.
    fn cache_mid(
        &mut self,
        block: Box<MidBlock<T>>,
    ) -> Option<Box<MidBlock<T>>> {
        for slot in &mut self.spare_mid {
            if slot.is_none() {
                *slot = Some(block);
                return None;
            }
        }
        Some(block)
    }

    fn cache_leaf(
        &mut self,
        block: Box<LeafBlock<T>>,
    ) -> Option<Box<LeafBlock<T>>> {
        for slot in &mut self.spare_leaf {
            if slot.is_none() {
                *slot = Some(block);
                return None;
            }
        }
        Some(block)
    }

    /// Allocates a handle without calling the allocator, drawing any blocks
    /// the path needs from the spare pool.
    ///
    /// The new handle is left `Reserved`: it will not resolve until `set` is
    /// called, but it cannot be allocated twice.
    pub fn try_alloc(&mut self) -> Result<u32, AllocError> {
        if self.live == HANDLE_CAPACITY {
            return Err(AllocError::Exhausted);
        }
        let mut probes = 0;
        loop {
            probes += 1;
            if probes > MAX_ALLOC_PROBES {
                return Err(AllocError::Exhausted);
            }
            let handle = self.next_handle & (HANDLE_CAPACITY - 1);
            self.next_handle = self.next_handle.wrapping_add(1);
            let (i1, i2, i3) = split(handle);

            if self.top[i1].is_none() {
                match self.take_spare_mid() {
                    Some(b) => self.top[i1] = Some(b),
                    None => return Err(AllocError::NeedSpares),
                }
            }
            if self.top[i1].as_ref().unwrap().children[i2].is_none() {
                match self.take_spare_leaf() {
                    Some(b) => {
                        let mid = self.top[i1].as_mut().unwrap();
                        mid.children[i2] = Some(b);
                        mid.used += 1;
                    }
                    None => {
                        // Don't strand a freshly installed, empty mid block:
                        // put it back in the pool before reporting the
                        // shortage.
                        if self.top[i1].as_ref().unwrap().used == 0 {
                            let b = self.top[i1].take().unwrap();
                            // The pool has room: we just failed to take a
                            // leaf, and mids and leaves pool separately.
                            let spill = self.cache_mid(b);
                            debug_assert!(spill.is_none());
                            drop(spill);
                        }
                        return Err(AllocError::NeedSpares);
                    }
                }
            }
            let leaf = self.top[i1]
                .as_mut()
                .unwrap()
                .children[i2]
                .as_mut()
                .unwrap();
            if !leaf.slots[i3].is_free() {
                // The counter wrapped into a live entry; skip it.
                continue;
            }
            leaf.slots[i3] = Slot::Reserved;
            leaf.used += 1;
            self.live += 1;
            return Ok(handle);
        }
    }

    /// Stores `value` under `handle`. Silently ignored if the handle is not
    /// currently allocated.
    pub fn set(&mut self, handle: u32, value: T) {
        if handle >= HANDLE_CAPACITY {
            return;
        }
        let (i1, i2, i3) = split(handle);
        let Some(mid) = self.top[i1].as_mut() else {
            return;
        };
        let Some(leaf) = mid.children[i2].as_mut() else {
            return;
        };
        if !leaf.slots[i3].is_free() {
            leaf.slots[i3] = Slot::Occupied(value);
        }
    }

    /// Resolves `handle` to a clone of the stored object. Returns `None` for
    /// free, reserved, and out-of-range handles.
    pub fn get(&self, handle: u32) -> Option<T> {
        if handle >= HANDLE_CAPACITY {
            return None;
        }
        let (i1, i2, i3) = split(handle);
        match &self.top[i1].as_ref()?.children[i2].as_ref()?.slots[i3] {
            Slot::Occupied(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Frees `handle`. Returns `None` if it was not allocated; otherwise the
    /// evicted contents, which the caller must drop outside the masked
    /// region.
    pub fn remove(&mut self, handle: u32) -> Option<Removed<T>> {
        if handle >= HANDLE_CAPACITY {
            return None;
        }
        let (i1, i2, i3) = split(handle);
        let (value, leaf_emptied) = {
            let mid = self.top[i1].as_mut()?;
            let leaf = mid.children[i2].as_mut()?;
            let value =
                match core::mem::replace(&mut leaf.slots[i3], Slot::Free) {
                    Slot::Free => return None,
                    Slot::Reserved => None,
                    Slot::Occupied(v) => Some(v),
                };
            leaf.used -= 1;
            (value, leaf.used == 0)
        };
        self.live -= 1;

        let mut removed = Removed {
            value,
            spilled_mid: None,
            spilled_leaf: None,
        };
        if leaf_emptied {
            let (leaf, mid_emptied) = {
                let mid = self.top[i1].as_mut().unwrap();
                let leaf = mid.children[i2].take().unwrap();
                mid.used -= 1;
                (leaf, mid.used == 0)
            };
            removed.spilled_leaf = self.cache_leaf(leaf);
            if mid_emptied {
                let mid = self.top[i1].take().unwrap();
                removed.spilled_mid = self.cache_mid(mid);
            }
        }
        Some(removed)
    }

    /// Finds the first populated handle strictly after `prev` (or from the
    /// beginning if `prev` is `None`) whose object satisfies `pred`. Empty
    /// subtrees are skipped a level at a time rather than slot by slot.
    pub fn get_next(
        &self,
        prev: Option<u32>,
        mut pred: impl FnMut(&T) -> bool,
    ) -> Option<(u32, T)> {
        let mut handle = match prev {
            Some(p) => p.checked_add(1)?,
            None => 0,
        };
        while handle < HANDLE_CAPACITY {
            let (i1, i2, i3) = split(handle);
            let Some(mid) = self.top[i1].as_ref() else {
                // Skip the whole empty top-level subtree.
                handle = ((i1 as u32 + 1) << 16).max(handle + 1);
                continue;
            };
            let Some(leaf) = mid.children[i2].as_ref() else {
                handle = (((i1 as u32) << 16) | ((i2 as u32 + 1) << 8))
                    .max(handle + 1);
                continue;
            };
            if let Slot::Occupied(v) = &leaf.slots[i3] {
                if pred(v) {
                    return Some((handle, v.clone()));
                }
            }
            handle += 1;
        }
        None
    }

    /// Repositions the allocation cursor. Only used by tests to exercise
    /// wrap-around without sixteen million allocations.
    #[cfg(test)]
    fn set_next_handle(&mut self, next: u32) {
        self.next_handle = next;
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocates a handle the way the kernel does: refill outside the
    /// (imaginary) mask, then try.
    fn alloc(table: &mut HandleTable<u32>) -> u32 {
        loop {
            if table.needs_refill() {
                let excess = table.refill(HandleTable::new_spares());
                drop(excess);
            }
            match table.try_alloc() {
                Ok(h) => return h,
                Err(AllocError::NeedSpares) => continue,
                Err(AllocError::Exhausted) => panic!("table exhausted"),
            }
        }
    }

    #[test]
    fn alloc_set_get_free_round_trip() {
        let mut table = HandleTable::new();
        let h = alloc(&mut table);
        assert_eq!(table.get(h), None, "reserved handle must not resolve");
        table.set(h, 0xabcd);
        assert_eq!(table.get(h), Some(0xabcd));
        assert_eq!(table.live_handles(), 1);

        let removed = table.remove(h).expect("handle was allocated");
        assert_eq!(removed.into_value(), Some(0xabcd));
        assert_eq!(table.get(h), None);
        assert_eq!(table.live_handles(), 0);

        // Second free fails.
        assert!(table.remove(h).is_none());
    }

    #[test]
    fn set_on_unallocated_handle_is_ignored() {
        let mut table = HandleTable::new();
        table.set(1234, 7);
        assert_eq!(table.get(1234), None);
        assert_eq!(table.live_handles(), 0);
    }

    #[test]
    fn alloc_without_spares_reports_shortage() {
        let mut table: HandleTable<u32> = HandleTable::new();
        assert!(table.needs_refill());
        assert_eq!(table.try_alloc(), Err(AllocError::NeedSpares));
        let excess = table.refill(HandleTable::new_spares());
        assert!(excess.is_empty());
        assert!(table.try_alloc().is_ok());
    }

    #[test]
    fn refill_overflow_is_handed_back() {
        let mut table: HandleTable<u32> = HandleTable::new();
        while table.needs_refill() {
            let _ = table.refill(HandleTable::new_spares());
        }
        let excess = table.refill(HandleTable::new_spares());
        assert!(!excess.is_empty());
    }

    #[test]
    fn handles_are_sequential_then_wrap() {
        let mut table = HandleTable::new();
        let a = alloc(&mut table);
        let b = alloc(&mut table);
        assert_eq!(b, a + 1);

        table.set_next_handle(HANDLE_CAPACITY - 1);
        let c = alloc(&mut table);
        assert_eq!(c, HANDLE_CAPACITY - 1);
        // The wrapped cursor lands back on zero, which is still live; the
        // next allocation must skip it.
        let d = alloc(&mut table);
        assert_eq!(d, b + 1);
        for h in [a, b, c, d] {
            table.set(h, h);
        }
        for h in [a, b, c, d] {
            assert_eq!(table.get(h), Some(h));
        }
    }

    #[test]
    fn wrap_collision_skips_live_entries() {
        let mut table = HandleTable::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(alloc(&mut table));
        }
        // Free the middle one, then point the cursor at the start of the
        // run: the allocator must skip the four live slots and land exactly
        // in the hole.
        let hole = handles[2];
        drop(table.remove(hole));
        table.set_next_handle(handles[0]);
        assert_eq!(alloc(&mut table), hole);
    }

    #[test]
    fn free_returns_empty_blocks_to_pool() {
        let mut table = HandleTable::new();
        let h = alloc(&mut table);
        table.set(h, 9);
        // The alloc consumed blocks; pool may be low now. Top it off so the
        // spare pool is full, forcing the free below to spill.
        while table.needs_refill() {
            let _ = table.refill(HandleTable::new_spares());
        }
        let removed = table.remove(h).unwrap();
        assert!(
            removed.spilled_leaf.is_some() || removed.spilled_mid.is_some(),
            "emptied blocks must spill once the pool is full"
        );
        assert_eq!(table.live_handles(), 0);
    }

    #[test]
    fn get_next_walks_in_order_with_predicate() {
        let mut table = HandleTable::new();
        let mut handles = Vec::new();
        for i in 0..6u32 {
            let h = alloc(&mut table);
            table.set(h, i * 10);
            handles.push(h);
        }
        // All entries, in handle order.
        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some((h, v)) = table.get_next(cursor, |_| true) {
            seen.push((h, v));
            cursor = Some(h);
        }
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));

        // Filtered walk.
        let (_, v) = table.get_next(None, |v| *v > 30).unwrap();
        assert_eq!(v, 40);

        // Walk starting beyond everything finds nothing.
        assert!(table
            .get_next(Some(handles[5]), |_| true)
            .is_none());
    }

    #[test]
    fn out_of_range_handles_are_rejected() {
        let mut table: HandleTable<u32> = HandleTable::new();
        assert_eq!(table.get(HANDLE_CAPACITY), None);
        assert!(table.remove(HANDLE_CAPACITY).is_none());
        table.set(HANDLE_CAPACITY, 1);
    }
}
