//! Node layout.
//!
//! A node is one level of the trie: `MAP_SIZE` slots addressed by
//! `(index >> shift) & MAP_MASK`, one tag bitset per tag, a slot count and a
//! non-owning back-reference to its parent. Every field a reader may look at
//! is atomic; `shift` and `offset` are fixed before the node is published and
//! never change while it is linked.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};

use crossbeam_epoch::Guard;

use crate::slot::{self, RawSlot, Slot};
use crate::{MAP_MASK, MAP_SIZE, MAX_TAGS};

/// Largest index addressable below a node of the given shift.
#[inline]
pub(crate) fn shift_maxindex(shift: u32) -> u64 {
    ((MAP_SIZE as u64) << shift).wrapping_sub(1)
}

pub(crate) struct Node {
    /// log2 of the index span of one slot; 0 at the bottom level.
    pub(crate) shift: u8,
    /// Position inside the parent's slot array.
    pub(crate) offset: u8,
    count: AtomicU8,
    parent: AtomicPtr<Node>,
    pub(crate) slots: [RawSlot; MAP_SIZE],
    tags: [AtomicU64; MAX_TAGS],
}

// One bitset word covers every slot.
const _: () = assert!(MAP_SIZE <= u64::BITS as usize);

impl Node {
    #[cfg(test)]
    pub(crate) fn empty() -> Box<Self> {
        Box::new(Self {
            shift: 0,
            offset: 0,
            count: AtomicU8::new(0),
            parent: AtomicPtr::new(ptr::null_mut()),
            slots: std::array::from_fn(|_| RawSlot::default()),
            tags: std::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    /// Returns the node to its freshly allocated, all-zero state.
    pub(crate) fn reset(&mut self) {
        self.shift = 0;
        self.offset = 0;
        *self.count.get_mut() = 0;
        *self.parent.get_mut() = ptr::null_mut();
        for raw in &self.slots {
            raw.set(slot::EMPTY);
        }
        for tag in &mut self.tags {
            *tag.get_mut() = 0;
        }
    }

    #[inline]
    pub(crate) fn shift(&self) -> u32 {
        u32::from(self.shift)
    }

    #[inline]
    pub(crate) fn maxindex(&self) -> u64 {
        shift_maxindex(self.shift())
    }

    #[inline]
    pub(crate) fn offset_of(&self, index: u64) -> usize {
        ((index >> self.shift) & MAP_MASK) as usize
    }

    // =========================================================================
    // Count
    // =========================================================================

    #[inline]
    pub(crate) fn count(&self) -> usize {
        usize::from(self.count.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_count(&self, count: usize) {
        assert!(count <= MAP_SIZE);
        self.count.store(count as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_count(&self, by: usize) {
        let count = self.count() + by;
        assert!(count <= MAP_SIZE, "node count overflow: {count}");
        self.count.store(count as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_count(&self) {
        let count = self.count();
        assert!(count > 0, "node count underflow");
        self.count.store((count - 1) as u8, Ordering::Relaxed);
    }

    // =========================================================================
    // Parent
    // =========================================================================

    #[inline]
    pub(crate) fn parent<'g>(&self, _guard: &'g Guard) -> Option<&'g Node> {
        let parent = self.parent.load(Ordering::Acquire);
        // SAFETY: a parent outlives its linked children, and detached parents
        // are only released after the grace period held open by `_guard`.
        unsafe { parent.as_ref() }
    }

    #[inline]
    pub(crate) fn set_parent(&self, parent: *const Node) {
        self.parent.store(parent as *mut Node, Ordering::Release);
    }

    // =========================================================================
    // Tags
    // =========================================================================

    #[inline]
    pub(crate) fn tag_get(&self, tag: usize, offset: usize) -> bool {
        self.tags[tag].load(Ordering::Acquire) & (1u64 << offset) != 0
    }

    #[inline]
    pub(crate) fn tag_set(&self, tag: usize, offset: usize) {
        self.tags[tag].fetch_or(1u64 << offset, Ordering::Release);
    }

    #[inline]
    pub(crate) fn tag_clear(&self, tag: usize, offset: usize) {
        self.tags[tag].fetch_and(!(1u64 << offset), Ordering::Release);
    }

    #[inline]
    pub(crate) fn any_tag_set(&self, tag: usize) -> bool {
        self.tags[tag].load(Ordering::Acquire) != 0
    }

    #[inline]
    pub(crate) fn tag_word(&self, tag: usize) -> u64 {
        self.tags[tag].load(Ordering::Acquire)
    }

    /// First offset at or after `from` carrying `tag`, or `MAP_SIZE`.
    #[inline]
    pub(crate) fn next_tagged(&self, tag: usize, from: usize) -> usize {
        if from >= MAP_SIZE {
            return MAP_SIZE;
        }
        let bits = self.tag_word(tag) >> from;
        if bits == 0 {
            MAP_SIZE
        } else {
            from + bits.trailing_zeros() as usize
        }
    }

    // =========================================================================
    // Slots
    // =========================================================================

    /// First occupied, non-sibling offset at or after `from`, or `MAP_SIZE`.
    pub(crate) fn next_occupied(&self, from: usize) -> usize {
        (from..MAP_SIZE)
            .find(|&offset| {
                let word = self.slots[offset].word();
                word != slot::EMPTY && !slot::is_sibling(word)
            })
            .unwrap_or(MAP_SIZE)
    }

    /// One level of descent: the offset `index` selects in this node and the
    /// entry found there, with sibling markers redirected to their canonical
    /// slot.
    #[inline]
    pub(crate) fn descend<'g, V>(&'g self, index: u64, guard: &'g Guard) -> (usize, Slot<'g, V>) {
        let offset = self.offset_of(index);
        match self.slots[offset].load(guard) {
            Slot::Sibling(canonical) => (canonical, self.slots[canonical].load(guard)),
            entry => (offset, entry),
        }
    }
}
