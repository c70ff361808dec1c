//! Slot words and their decoded form.
//!
//! Every slot (and the root) is a single `AtomicUsize` so that readers never
//! observe a half-written entry. The two low bits of the word carry the kind:
//!
//! ```text
//! 0b00  leaf    pointer to a boxed `Leaf<V>`   (all-zero word = empty)
//! 0b01  node    pointer to a child `Node`      (null pointer = retry)
//! 0b10  sibling canonical slot offset << 2
//! ```
//!
//! Both pointee types are aligned to at least 4 bytes, so the kind bits
//! never collide with address bits. Algorithm code never touches the word
//! directly; it matches on [`Slot`].

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;

use crate::node::Node;

const KIND_MASK: usize = 0b11;
const KIND_LEAF: usize = 0b00;
const KIND_NODE: usize = 0b01;
const KIND_SIBLING: usize = 0b10;

/// Word of an empty slot.
pub(crate) const EMPTY: usize = 0;

/// Word left behind in slot 0 of a collapsed bottom-level node. Readers that
/// land on it restart their descent from the root.
pub(crate) const RETRY: usize = KIND_NODE;

const _: () = assert!(std::mem::align_of::<Node>() > KIND_MASK);

/// Heap cell owning one caller value.
#[repr(C, align(8))]
pub(crate) struct Leaf<V> {
    value: V,
}

impl<V> Leaf<V> {
    /// Boxes `value` and returns its slot word.
    pub(crate) fn into_word(value: V) -> usize {
        let ptr = Box::into_raw(Box::new(Leaf { value }));
        debug_assert_eq!(ptr as usize & KIND_MASK, KIND_LEAF);
        ptr as usize
    }

    /// Defers dropping the leaf behind `word` until every reader pinned now
    /// has unpinned.
    ///
    /// # Safety
    /// `word` must be a leaf word produced by [`Leaf::into_word`] for this `V`
    /// that has already been unlinked from the tree.
    pub(crate) unsafe fn defer_drop(word: usize, guard: &Guard)
    where
        V: 'static,
    {
        let ptr = word as *mut Leaf<V>;
        // SAFETY: the leaf is unreachable for new traversals; readers that
        // still hold it are pinned and outlive nothing past the grace period.
        unsafe { guard.defer_unchecked(move || drop(Box::from_raw(ptr))) }
    }

    /// Drops the leaf behind `word` immediately.
    ///
    /// # Safety
    /// Same as [`Leaf::defer_drop`], and no reader may still observe it.
    pub(crate) unsafe fn drop_word(word: usize) {
        // SAFETY: guaranteed by the caller.
        drop(unsafe { Box::from_raw(word as *mut Leaf<V>) });
    }
}

impl<V> std::ops::Deref for Leaf<V> {
    type Target = V;

    #[inline]
    fn deref(&self) -> &V {
        &self.value
    }
}

/// Decoded view of a slot word, valid for the lifetime of the guard it was
/// loaded under.
pub(crate) enum Slot<'g, V> {
    Empty,
    Leaf(&'g Leaf<V>),
    Node(&'g Node),
    /// Redirect to the canonical slot of a multi-order entry in the same node.
    Sibling(usize),
    Retry,
}

impl<V> Clone for Slot<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Slot<'_, V> {}

impl<'g, V> Slot<'g, V> {
    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }

    /// Decodes a slot word.
    ///
    /// # Safety
    /// Any pointer in `word` must reference a live `Node` or `Leaf<V>` for at
    /// least `'g`.
    #[inline]
    pub(crate) unsafe fn decode(word: usize) -> Self {
        match word & KIND_MASK {
            KIND_LEAF if word == EMPTY => Slot::Empty,
            // SAFETY: guaranteed by the caller.
            KIND_LEAF => Slot::Leaf(unsafe { &*(word as *const Leaf<V>) }),
            KIND_NODE if word == RETRY => Slot::Retry,
            // SAFETY: guaranteed by the caller.
            KIND_NODE => Slot::Node(unsafe { &*((word & !KIND_MASK) as *const Node) }),
            KIND_SIBLING => Slot::Sibling(word >> 2),
            _ => unreachable!("corrupt slot word {word:#x}"),
        }
    }
}

#[inline]
pub(crate) fn node_word(node: *const Node) -> usize {
    debug_assert!(!node.is_null());
    node as usize | KIND_NODE
}

#[inline]
pub(crate) fn sibling_word(canonical: usize) -> usize {
    (canonical << 2) | KIND_SIBLING
}

#[inline]
pub(crate) fn is_sibling(word: usize) -> bool {
    word & KIND_MASK == KIND_SIBLING
}

#[inline]
pub(crate) fn is_leaf(word: usize) -> bool {
    word != EMPTY && word & KIND_MASK == KIND_LEAF
}

/// Extracts the node pointer from an internal word, `None` for every other
/// kind (including retry).
#[inline]
pub(crate) fn node_ptr(word: usize) -> Option<*mut Node> {
    if word & KIND_MASK == KIND_NODE && word != RETRY {
        Some((word & !KIND_MASK) as *mut Node)
    } else {
        None
    }
}

/// One atomically published slot.
#[derive(Default)]
#[repr(transparent)]
pub(crate) struct RawSlot(AtomicUsize);

impl RawSlot {
    #[inline]
    pub(crate) fn word(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set(&self, word: usize) {
        self.0.store(word, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.word() == EMPTY
    }

    /// Loads and decodes the slot under `guard`.
    #[inline]
    pub(crate) fn load<'g, V>(&'g self, _guard: &'g Guard) -> Slot<'g, V> {
        // SAFETY: nodes and leaves reachable from a published slot are only
        // released after a grace period, which `_guard` holds open.
        unsafe { Slot::decode(self.word()) }
    }
}

/// Read-only handle to a slot found by a gang lookup.
///
/// The slot may be rewritten by a concurrent writer at any time; `load`
/// reports the value present right now.
pub struct SlotRef<'g, V> {
    slot: &'g RawSlot,
    guard: &'g Guard,
    _marker: PhantomData<&'g V>,
}

impl<V> Clone for SlotRef<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for SlotRef<'_, V> {}

impl<'g, V> SlotRef<'g, V> {
    pub(crate) fn new(slot: &'g RawSlot, guard: &'g Guard) -> Self {
        Self {
            slot,
            guard,
            _marker: PhantomData,
        }
    }

    /// The value currently stored, or `None` if the entry was removed or
    /// moved since the lookup (look it up again in that case).
    pub fn load(&self) -> Option<&'g V> {
        match self.slot.load::<V>(self.guard) {
            Slot::Leaf(leaf) => Some(&**leaf),
            _ => None,
        }
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for SlotRef<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SlotRef").field(&self.load()).finish()
    }
}
