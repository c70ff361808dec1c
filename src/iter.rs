//! Chunked iteration, gang lookups and reverse lookup.
//!
//! [`RadixTree::next_chunk`] finds the lowest node covering a start index and
//! hands back its remaining slots in one piece, so a scan only re-descends
//! once per node. Everything else here is built on top of it.

use std::marker::PhantomData;
use std::slice;

use crossbeam_epoch::{self as epoch, Guard};

use crate::slot::{RawSlot, Slot, SlotRef};
use crate::tree::RadixTree;
use crate::{MAP_SIZE, MAX_TAGS};

/// Iteration filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterFlags {
    /// Only visit entries carrying this tag.
    pub tag: Option<usize>,
    /// Stop at the first hole instead of skipping it.
    pub contig: bool,
}

impl IterFlags {
    pub fn tagged(tag: usize) -> Self {
        Self {
            tag: Some(tag),
            contig: false,
        }
    }

    pub fn contig() -> Self {
        Self {
            tag: None,
            contig: true,
        }
    }
}

/// Consecutive slots of one node, as returned by [`RadixTree::next_chunk`].
pub struct Chunk<'g, V> {
    index: u64,
    next_index: Option<u64>,
    shift: u32,
    tags: u64,
    slots: &'g [RawSlot],
    guard: &'g Guard,
    _marker: PhantomData<&'g V>,
}

impl<V> Clone for Chunk<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Chunk<'_, V> {}

impl<'g, V> Chunk<'g, V> {
    /// Index of the first slot in the chunk.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Index right after the node this chunk belongs to, or `None` if the
    /// chunk reaches `u64::MAX`.
    #[inline]
    pub fn next_index(&self) -> Option<u64> {
        self.next_index
    }

    /// log2 of the index span of one slot.
    #[inline]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Bit `i` is set if slot `i` carries the requested tag. Without a tag
    /// filter every bit is set.
    #[inline]
    pub fn tags(&self) -> u64 {
        self.tags
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// First index covered by slot `i`.
    #[inline]
    pub fn index_at(&self, i: usize) -> u64 {
        self.index + ((i as u64) << self.shift)
    }

    /// Read handle to slot `i`.
    pub fn slot(&self, i: usize) -> SlotRef<'g, V> {
        SlotRef::new(&self.slots[i], self.guard)
    }

    #[inline]
    fn raw(&self, i: usize) -> Slot<'g, V> {
        self.slots[i].load(self.guard)
    }
}

impl<V> std::fmt::Debug for Chunk<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("index", &self.index)
            .field("next_index", &self.next_index)
            .field("shift", &self.shift)
            .field("tags", &format_args!("{:#x}", self.tags))
            .field("len", &self.slots.len())
            .finish()
    }
}

impl<V> RadixTree<V>
where
    V: Send + Sync + 'static,
{
    /// Finds the next chunk of slots at or after `start`.
    ///
    /// Empty subtrees (or, with a tag filter, untagged ones) are skipped;
    /// with `contig` the scan gives up at the first hole instead. The first
    /// slot of the chunk holds the entry covering the start index, so a
    /// multi-order entry may begin before `start`.
    pub fn next_chunk<'g>(&'g self, start: u64, flags: IterFlags, guard: &'g Guard) -> Option<Chunk<'g, V>> {
        if let Some(tag) = flags.tag {
            assert!(tag < MAX_TAGS, "tag {tag} out of range");
            if !self.root_tag_get(tag) {
                return None;
            }
        }

        let mut index = start;
        'restart: loop {
            let (root, _, maxindex) = self.load_root(guard);
            if index > maxindex {
                return None;
            }
            let mut node = match root {
                Slot::Empty => return None,
                Slot::Node(node) => node,
                Slot::Leaf(_) => {
                    return Some(Chunk {
                        index,
                        next_index: maxindex.checked_add(1),
                        shift: 0,
                        tags: 1,
                        slots: slice::from_ref(&self.root),
                        guard,
                        _marker: PhantomData,
                    })
                }
                Slot::Sibling(_) | Slot::Retry => unreachable!("root holds a transient slot"),
            };

            let offset = loop {
                let (mut offset, mut child) = node.descend::<V>(index, guard);
                let hole = match flags.tag {
                    Some(tag) => !node.tag_get(tag, offset),
                    None => child.is_empty(),
                };

                if hole {
                    if flags.contig {
                        return None;
                    }
                    offset = match flags.tag {
                        Some(tag) => node.next_tagged(tag, offset + 1),
                        None => node.next_occupied(offset + 1),
                    };
                    let base = u128::from(index & !node.maxindex()) + ((offset as u128) << node.shift);
                    index = u64::try_from(base).ok()?;
                    if offset == MAP_SIZE {
                        continue 'restart;
                    }
                    child = node.slots[offset].load(guard);
                }

                match child {
                    Slot::Node(next) => node = next,
                    Slot::Leaf(_) => break offset,
                    Slot::Empty | Slot::Retry | Slot::Sibling(_) => continue 'restart,
                }
            };

            let maxindex = node.maxindex();
            let chunk_index = (index & !maxindex) | ((offset as u64) << node.shift);
            // A top node at shift 60 only addresses its first 16 slots.
            let addressable = (((index | maxindex) - chunk_index) >> node.shift) as usize + 1;
            let end = MAP_SIZE.min(offset + addressable);
            return Some(Chunk {
                index: chunk_index,
                next_index: (index | maxindex).checked_add(1),
                shift: node.shift(),
                tags: match flags.tag {
                    Some(tag) => node.tag_word(tag) >> offset,
                    None => u64::MAX >> offset,
                },
                slots: &node.slots[offset..end],
                guard,
                _marker: PhantomData,
            });
        }
    }

    /// Entries in ascending index order, starting with the one covering
    /// `start`.
    pub fn iter<'g>(&'g self, start: u64, guard: &'g Guard) -> Iter<'g, V> {
        Iter::new(self, start, IterFlags::default(), guard)
    }

    /// Like [`iter`](Self::iter), visiting only entries that carry `tag`.
    pub fn iter_tagged<'g>(&'g self, start: u64, tag: usize, guard: &'g Guard) -> Iter<'g, V> {
        Iter::new(self, start, IterFlags::tagged(tag), guard)
    }

    /// Like [`iter`](Self::iter), ending at the first hole.
    pub fn iter_contig<'g>(&'g self, start: u64, guard: &'g Guard) -> Iter<'g, V> {
        Iter::new(self, start, IterFlags::contig(), guard)
    }

    // =========================================================================
    // Gang lookups
    // =========================================================================

    /// Up to `max` values at or after `start`, in ascending index order.
    pub fn gang_lookup<'g>(&'g self, start: u64, max: usize, guard: &'g Guard) -> Vec<&'g V> {
        self.iter(start, guard).take(max).map(|(_, value)| value).collect()
    }

    /// Like [`gang_lookup`](Self::gang_lookup), returning each index with a
    /// handle to its slot.
    pub fn gang_lookup_slot<'g>(&'g self, start: u64, max: usize, guard: &'g Guard) -> Vec<(u64, SlotRef<'g, V>)> {
        let mut iter = self.iter(start, guard);
        let mut out = Vec::with_capacity(max.min(MAP_SIZE));
        while out.len() < max {
            let Some((index, slot)) = iter.next_slot() else {
                break;
            };
            out.push((index, SlotRef::new(slot, guard)));
        }
        out
    }

    /// Up to `max` values carrying `tag`, at or after `start`.
    pub fn gang_lookup_tag<'g>(&'g self, start: u64, max: usize, tag: usize, guard: &'g Guard) -> Vec<&'g V> {
        self.iter_tagged(start, tag, guard)
            .take(max)
            .map(|(_, value)| value)
            .collect()
    }

    /// Like [`gang_lookup_tag`](Self::gang_lookup_tag), returning each index
    /// with a handle to its slot.
    pub fn gang_lookup_tag_slot<'g>(
        &'g self,
        start: u64,
        max: usize,
        tag: usize,
        guard: &'g Guard,
    ) -> Vec<(u64, SlotRef<'g, V>)> {
        let mut iter = self.iter_tagged(start, tag, guard);
        let mut out = Vec::with_capacity(max.min(MAP_SIZE));
        while out.len() < max {
            let Some((index, slot)) = iter.next_slot() else {
                break;
            };
            out.push((index, SlotRef::new(slot, guard)));
        }
        out
    }

    /// Index of the first entry equal to `item`, scanning the whole tree.
    ///
    /// The scan repins and yields between chunks, so it may run alongside
    /// writers for a long time without holding up reclamation. The entry may
    /// have moved by the time the caller looks at it again.
    pub fn locate_item(&self, item: &V) -> Option<u64>
    where
        V: PartialEq,
    {
        let mut next = Some(0);
        while let Some(start) = next {
            let guard = &epoch::pin();
            let chunk = self.next_chunk(start, IterFlags::default(), guard)?;
            next = chunk.next_index();
            for i in 0..chunk.len() {
                match chunk.raw(i) {
                    Slot::Leaf(leaf) if **leaf == *item => return Some(chunk.index_at(i)),
                    Slot::Node(_) | Slot::Retry => {
                        next = Some(chunk.index_at(i));
                        break;
                    }
                    _ => {}
                }
            }
            std::thread::yield_now();
        }
        None
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Ascending iterator over `(index, &value)`, created by
/// [`RadixTree::iter`] and friends.
///
/// The iterator observes each slot at the moment it reaches it: entries
/// inserted behind it are missed, entries deleted ahead of it are not
/// returned. A multi-order entry is reported once, at its first index.
pub struct Iter<'g, V> {
    tree: &'g RadixTree<V>,
    guard: &'g Guard,
    flags: IterFlags,
    chunk: Option<Chunk<'g, V>>,
    pos: usize,
    next_start: Option<u64>,
    last: Option<u64>,
}

impl<'g, V> Iter<'g, V>
where
    V: Send + Sync + 'static,
{
    fn new(tree: &'g RadixTree<V>, start: u64, flags: IterFlags, guard: &'g Guard) -> Self {
        Self {
            tree,
            guard,
            flags,
            chunk: None,
            pos: 0,
            next_start: Some(start),
            last: None,
        }
    }

    /// Next occupied slot with its index.
    fn next_slot(&mut self) -> Option<(u64, &'g RawSlot)> {
        loop {
            if let Some(chunk) = self.chunk {
                while self.pos < chunk.len() {
                    let i = self.pos;
                    self.pos += 1;
                    let index = chunk.index_at(i);

                    if self.flags.tag.is_some() && chunk.tags() & (1u64 << i) == 0 {
                        if self.flags.contig {
                            return self.finish();
                        }
                        continue;
                    }
                    match chunk.raw(i) {
                        Slot::Leaf(_) => {
                            if self.last.is_some_and(|last| index <= last) {
                                continue;
                            }
                            self.last = Some(index);
                            return Some((index, &chunk.slots[i]));
                        }
                        Slot::Sibling(_) => {}
                        Slot::Empty if self.flags.contig => return self.finish(),
                        Slot::Empty => {}
                        // Restructured since the chunk was found.
                        Slot::Node(_) | Slot::Retry => {
                            self.chunk = None;
                            self.next_start = Some(index);
                            break;
                        }
                    }
                }
                if self.chunk.is_some() {
                    self.chunk = None;
                    self.next_start = chunk.next_index();
                }
            }

            let start = self.next_start?;
            match self.tree.next_chunk(start, self.flags, self.guard) {
                Some(chunk) => {
                    self.chunk = Some(chunk);
                    self.pos = 0;
                }
                None => return self.finish(),
            }
        }
    }

    fn finish<T>(&mut self) -> Option<T> {
        self.chunk = None;
        self.next_start = None;
        None
    }
}

impl<'g, V> Iterator for Iter<'g, V>
where
    V: Send + Sync + 'static,
{
    type Item = (u64, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (index, slot) = self.next_slot()?;
            // The slot may have been emptied since `next_slot` looked at it.
            if let Slot::Leaf(leaf) = slot.load::<V>(self.guard) {
                return Some((index, &**leaf));
            }
        }
    }
}
