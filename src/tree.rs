//! The tree root, point operations and the mutation algorithms.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Guard};
use parking_lot::{Mutex, MutexGuard};

use crate::alloc::NodeAllocator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{shift_maxindex, Node};
use crate::slot::{self, Leaf, RawSlot, Slot};
use crate::{MAP_SHIFT, MAX_TAGS};

/// Concurrent sparse array keyed by `u64`.
///
/// Readers (`get`, iteration, gang lookups, tag queries) never lock: they pin
/// an epoch [`Guard`] and may run alongside one writer. Mutations go through
/// a [`Writer`], which serializes writers with an internal lock.
///
/// ```
/// use radix_index::RadixTree;
///
/// let tree = RadixTree::new();
/// {
///     let mut w = tree.write();
///     w.insert(4096, "block").unwrap();
///     w.tag_set(4096, 0);
/// }
///
/// let guard = radix_index::pin();
/// assert_eq!(tree.get(4096, &guard), Some(&"block"));
/// assert!(tree.tag_get(4096, 0));
/// ```
pub struct RadixTree<V> {
    /// Empty, a single leaf for index 0, or the top node.
    pub(crate) root: RawSlot,
    /// Aggregate tag bits: bit `t` is set iff some entry carries tag `t`.
    pub(crate) root_tags: AtomicU8,
    writer: Mutex<()>,
    pub(crate) alloc: NodeAllocator,
    config: Config,
    len: AtomicUsize,
    _marker: PhantomData<*const V>,
}

// SAFETY: values are only moved in by writers and dropped after a grace
// period, possibly on another thread.
unsafe impl<V: Send> Send for RadixTree<V> {}
// SAFETY: readers hand out `&V` across threads, writers drop `V` on whichever
// thread collects the garbage.
unsafe impl<V: Send + Sync> Sync for RadixTree<V> {}

/// Where a present entry lives: the owning node (none for a root leaf) and
/// the canonical offset inside it.
pub(crate) struct Found<'g, V> {
    pub(crate) leaf: &'g Leaf<V>,
    pub(crate) node: Option<&'g Node>,
    pub(crate) offset: usize,
}

/// Result of one [`Writer::range_tag_if_tagged`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeTag {
    /// Entries that received the tag during this pass.
    pub tagged: usize,
    /// First index not yet scanned, or `None` once the range is exhausted up
    /// to `u64::MAX`.
    pub next_index: Option<u64>,
}

impl<V> Default for RadixTree<V>
where
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> RadixTree<V>
where
    V: Send + Sync + 'static,
{
    /// Empty tree with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Empty tree allocating nodes according to `config`.
    pub fn with_config(config: Config) -> Self {
        Self {
            root: RawSlot::default(),
            root_tags: AtomicU8::new(0),
            writer: Mutex::new(()),
            alloc: NodeAllocator::new(&config),
            config,
            len: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// The configuration this tree was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of entries (a multi-order entry counts once).
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Number of node levels; 0 while the tree holds at most a root leaf.
    pub fn height(&self) -> usize {
        let guard = &epoch::pin();
        match self.root.load::<V>(guard) {
            Slot::Node(node) => node.shift() as usize / MAP_SHIFT as usize + 1,
            _ => 0,
        }
    }

    /// Nodes currently allocated to this tree.
    pub fn nodes_in_use(&self) -> usize {
        self.alloc.live()
    }

    /// Largest index the tree can hold without growing.
    pub fn max_index(&self) -> u64 {
        let guard = &epoch::pin();
        self.load_root(guard).2
    }

    /// Locks the tree for mutation.
    pub fn write(&self) -> Writer<'_, V> {
        Writer::new(self, self.writer.lock())
    }

    /// Locks the tree for mutation unless another writer holds it.
    pub fn try_write(&self) -> Option<Writer<'_, V>> {
        self.writer.try_lock().map(|lock| Writer::new(self, lock))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Root entry, the shift a child of the root would need, and the largest
    /// index the current height can address.
    #[inline]
    pub(crate) fn load_root<'g>(&'g self, guard: &'g Guard) -> (Slot<'g, V>, u32, u64) {
        match self.root.load(guard) {
            Slot::Node(node) => (Slot::Node(node), node.shift() + MAP_SHIFT, node.maxindex()),
            entry => (entry, 0, 0),
        }
    }

    /// Descends to the entry for `index`, restarting from the root whenever
    /// a concurrent shrink left a retry marker on the path.
    pub(crate) fn lookup_entry<'g>(&'g self, index: u64, guard: &'g Guard) -> Option<Found<'g, V>> {
        'restart: loop {
            let (mut entry, _, maxindex) = self.load_root(guard);
            if index > maxindex {
                return None;
            }
            let mut parent = None;
            let mut offset = 0;
            loop {
                match entry {
                    Slot::Node(node) => {
                        let (next_offset, child) = node.descend::<V>(index, guard);
                        parent = Some(node);
                        offset = next_offset;
                        entry = child;
                    }
                    Slot::Leaf(leaf) => {
                        return Some(Found {
                            leaf,
                            node: parent,
                            offset,
                        })
                    }
                    Slot::Empty => return None,
                    Slot::Retry | Slot::Sibling(_) => continue 'restart,
                }
            }
        }
    }

    /// Value stored at `index`, borrowed for as long as `guard` is pinned.
    #[inline]
    pub fn get<'g>(&'g self, index: u64, guard: &'g Guard) -> Option<&'g V> {
        self.lookup_entry(index, guard).map(|found| &**found.leaf)
    }

    /// Clones the value stored at `index`.
    pub fn lookup(&self, index: u64) -> Option<V>
    where
        V: Clone,
    {
        let guard = &epoch::pin();
        self.get(index, guard).cloned()
    }

    pub fn contains(&self, index: u64) -> bool {
        let guard = &epoch::pin();
        self.lookup_entry(index, guard).is_some()
    }

    // =========================================================================
    // Tags
    // =========================================================================

    #[inline]
    pub(crate) fn root_tag_get(&self, tag: usize) -> bool {
        self.root_tags.load(Ordering::Acquire) & (1 << tag) != 0
    }

    #[inline]
    fn root_tag_set(&self, tag: usize) {
        self.root_tags.fetch_or(1 << tag, Ordering::Release);
    }

    #[inline]
    fn root_tag_clear(&self, tag: usize) {
        self.root_tags.fetch_and(!(1 << tag), Ordering::Release);
    }

    /// Whether any entry in the tree carries `tag`.
    pub fn tagged(&self, tag: usize) -> bool {
        assert!(tag < MAX_TAGS, "tag {tag} out of range");
        self.root_tag_get(tag)
    }

    /// Whether the entry at `index` carries `tag`.
    ///
    /// Racing with a writer that retags or deletes the entry, the answer
    /// may reflect either state.
    pub fn tag_get(&self, index: u64, tag: usize) -> bool {
        assert!(tag < MAX_TAGS, "tag {tag} out of range");
        let guard = &epoch::pin();
        'restart: loop {
            if !self.root_tag_get(tag) {
                return false;
            }
            let (mut entry, _, maxindex) = self.load_root(guard);
            if index > maxindex || entry.is_empty() {
                return false;
            }
            while let Slot::Node(parent) = entry {
                let (offset, child) = parent.descend::<V>(index, guard);
                match child {
                    Slot::Empty => return false,
                    Slot::Retry | Slot::Sibling(_) => continue 'restart,
                    _ => {}
                }
                if !parent.tag_get(tag, offset) {
                    return false;
                }
                entry = child;
            }
            return true;
        }
    }

    /// Clears `tag` at `offset` of `node` and walks upward while the tag has
    /// vanished from the whole node, finishing at the root aggregate.
    fn node_tag_clear<'g>(&self, mut node: Option<&'g Node>, tag: usize, mut offset: usize, guard: &'g Guard) {
        while let Some(current) = node {
            if !current.tag_get(tag, offset) {
                return;
            }
            current.tag_clear(tag, offset);
            if current.any_tag_set(tag) {
                return;
            }
            offset = usize::from(current.offset);
            node = current.parent(guard);
        }
        self.root_tag_clear(tag);
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Wraps the current top under new parents until the tree can address
    /// `index`. Returns the shift a child of the new root would need.
    fn extend(&self, index: u64, mut shift: u32, guard: &Guard) -> Result<u32> {
        let mut maxshift = shift;
        while index > shift_maxindex(maxshift) {
            maxshift += MAP_SHIFT;
        }

        let mut entry = self.root.word();
        if entry == slot::EMPTY {
            return Ok(maxshift + MAP_SHIFT);
        }

        let old_shift = shift;
        loop {
            let mut node = match self.alloc.alloc() {
                Ok(node) => node,
                Err(err) => {
                    self.shrink(guard);
                    return Err(err);
                }
            };
            for tag in 0..MAX_TAGS {
                if self.root_tag_get(tag) {
                    node.tag_set(tag, 0);
                }
            }
            node.shift = shift as u8;
            node.offset = 0;
            node.set_count(1);
            node.slots[0].set(entry);

            let node = Box::into_raw(node);
            if let Some(child) = slot::node_ptr(entry) {
                // SAFETY: the old top is linked and owned by this writer.
                unsafe { (*child).set_parent(node) };
            }
            entry = slot::node_word(node);
            self.root.set(entry);

            shift += MAP_SHIFT;
            if shift > maxshift {
                break;
            }
        }
        tracing::trace!(old_shift, new_shift = maxshift, index, "radix tree extended");
        Ok(maxshift + MAP_SHIFT)
    }

    /// Makes sure a slot exists for an entry of `2^order` indices around
    /// `index`, writing sibling markers when the entry spans several slots of
    /// one node. Returns the owning node (none for the root slot) and the
    /// canonical offset.
    fn create<'g>(&'g self, index: u64, order: u32, guard: &'g Guard) -> Result<(Option<&'g Node>, usize)> {
        if order >= u64::BITS {
            return Err(Error::InvalidOrder { order });
        }
        let max = index | ((1u64 << order) - 1);
        let (mut child, mut shift, maxindex) = self.load_root(guard);

        if max > maxindex {
            shift = self.extend(max, shift, guard)?;
            child = self.root.load(guard);
            if order == shift {
                shift += MAP_SHIFT;
            }
        }

        let mut node: Option<&'g Node> = None;
        let mut offset = 0;
        while shift > order {
            shift -= MAP_SHIFT;
            let next = match child {
                Slot::Empty => {
                    let mut fresh = match self.alloc.alloc() {
                        Ok(fresh) => fresh,
                        Err(err) => {
                            if let Some(last) = node {
                                self.delete_node(last, guard);
                            }
                            self.shrink(guard);
                            return Err(err);
                        }
                    };
                    fresh.shift = shift as u8;
                    fresh.offset = offset as u8;
                    fresh.set_parent(node.map_or(ptr::null(), |parent| parent as *const Node));

                    // SAFETY: published below; freed only through the allocator.
                    let fresh: &'g Node = unsafe { &*Box::into_raw(fresh) };
                    self.slot_at(node, offset).set(slot::node_word(fresh));
                    if let Some(parent) = node {
                        parent.inc_count(1);
                    }
                    fresh
                }
                Slot::Node(next) => next,
                Slot::Leaf(_) => return Err(Error::Exists { index }),
                Slot::Sibling(_) | Slot::Retry => {
                    unreachable!("writer descended onto a transient slot")
                }
            };
            node = Some(next);
            let (next_offset, next_child) = next.descend::<V>(index, guard);
            offset = next_offset;
            child = next_child;
        }

        if order > shift {
            let Some(parent) = node else {
                unreachable!("multi-order entry below the root slot")
            };
            let span = 1usize << (order - shift);
            let base = offset & !(span - 1);
            if parent.slots[base..base + span].iter().any(|slot| !slot.is_empty()) {
                return Err(Error::Exists { index });
            }
            for sibling in &parent.slots[base + 1..base + span] {
                sibling.set(slot::sibling_word(base));
            }
            parent.inc_count(span - 1);
            offset = base;
        }

        Ok((node, offset))
    }

    #[inline]
    fn slot_at<'a>(&'a self, node: Option<&'a Node>, offset: usize) -> &'a RawSlot {
        match node {
            Some(node) => &node.slots[offset],
            None => &self.root,
        }
    }

    fn insert_locked(&self, index: u64, order: u32, value: V, guard: &Guard) -> Result<()> {
        let claimed = self.create(index, order, guard).and_then(|(node, offset)| {
            let slot = self.slot_at(node, offset);
            if slot.is_empty() {
                Ok((node, offset, slot))
            } else {
                Err(Error::Exists { index })
            }
        });
        let (node, offset, slot) = match claimed {
            Ok(claimed) => claimed,
            Err(err) => {
                // The tree may have grown before the conflict showed up.
                if let Error::Exists { .. } = err {
                    self.shrink(guard);
                }
                return Err(err);
            }
        };
        slot.set(Leaf::into_word(value));

        match node {
            Some(node) => {
                node.inc_count(1);
                for tag in 0..MAX_TAGS {
                    assert!(!node.tag_get(tag, offset), "fresh slot {offset} carries tag {tag}");
                }
            }
            None => assert_eq!(self.root_tags.load(Ordering::Relaxed), 0, "empty root carries tags"),
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Collapses single-child chains at the top of the tree.
    fn shrink(&self, guard: &Guard) -> bool {
        let mut shrunk = false;
        loop {
            let Slot::Node(node) = self.root.load::<V>(guard) else {
                break;
            };
            if node.count() != 1 {
                break;
            }
            let child = node.slots[0].word();
            if child == slot::EMPTY {
                break;
            }
            let child_node = slot::node_ptr(child);
            // A leaf under a non-bottom node is a multi-order entry.
            if child_node.is_none() && node.shift != 0 {
                break;
            }

            if let Some(child_node) = child_node {
                // SAFETY: the child stays linked, now directly under the root.
                unsafe { (*child_node).set_parent(ptr::null()) };
            }
            self.root.set(child);

            // Readers already inside the old top must not conclude that
            // index 0 is absent.
            if child_node.is_none() {
                node.slots[0].set(slot::RETRY);
            }

            tracing::trace!(old_shift = node.shift, "radix tree shrunk");
            // SAFETY: the node is no longer reachable from the root.
            unsafe { self.alloc.free(node, guard) };
            shrunk = true;
        }
        shrunk
    }

    /// Frees `node` and its ancestors while they are empty, then tries to
    /// shrink if the walk stopped at the top node.
    fn delete_node<'g>(&self, mut node: &'g Node, guard: &'g Guard) -> bool {
        let mut deleted = false;
        loop {
            if node.count() > 0 {
                if self.root.word() == slot::node_word(node) {
                    deleted |= self.shrink(guard);
                }
                return deleted;
            }

            let parent = node.parent(guard);
            match parent {
                Some(parent) => {
                    parent.slots[usize::from(node.offset)].set(slot::EMPTY);
                    parent.dec_count();
                }
                None => {
                    self.root_tags.store(0, Ordering::Release);
                    self.root.set(slot::EMPTY);
                }
            }

            // SAFETY: just unlinked from its parent (or the root).
            unsafe { self.alloc.free(node, guard) };
            deleted = true;

            match parent {
                Some(parent) => node = parent,
                None => return deleted,
            }
        }
    }

    /// Clears the sibling markers that follow a canonical slot.
    fn delete_sibling_entries(node: &Node, offset: usize) {
        let marker = slot::sibling_word(offset);
        for sibling in &node.slots[offset + 1..] {
            if sibling.word() != marker {
                break;
            }
            sibling.set(slot::EMPTY);
            node.dec_count();
        }
    }

    fn delete_locked<'g>(&'g self, index: u64, matches: impl FnOnce(&V) -> bool, guard: &'g Guard) -> Option<&'g V> {
        let found = self.lookup_entry(index, guard)?;
        if !matches(&**found.leaf) {
            return None;
        }
        let word = found.leaf as *const Leaf<V> as usize;

        match found.node {
            None => {
                self.root_tags.store(0, Ordering::Release);
                self.root.set(slot::EMPTY);
            }
            Some(node) => {
                for tag in 0..MAX_TAGS {
                    self.node_tag_clear(Some(node), tag, found.offset, guard);
                }
                Self::delete_sibling_entries(node, found.offset);
                node.slots[found.offset].set(slot::EMPTY);
                node.dec_count();
                self.delete_node(node, guard);
            }
        }

        // SAFETY: the leaf was unlinked above.
        unsafe { Leaf::<V>::defer_drop(word, guard) };
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(&**found.leaf)
    }

    // =========================================================================
    // Tag mutation
    // =========================================================================

    fn tag_set_locked(&self, index: u64, tag: usize, guard: &Guard) -> bool {
        if self.lookup_entry(index, guard).is_none() {
            return false;
        }
        let (mut entry, _, _) = self.load_root(guard);
        while let Slot::Node(parent) = entry {
            let (offset, child) = parent.descend::<V>(index, guard);
            if !parent.tag_get(tag, offset) {
                parent.tag_set(tag, offset);
            }
            entry = child;
        }
        if !self.root_tag_get(tag) {
            self.root_tag_set(tag);
        }
        true
    }

    fn tag_clear_locked(&self, index: u64, tag: usize, guard: &Guard) -> bool {
        match self.lookup_entry(index, guard) {
            Some(found) => {
                self.node_tag_clear(found.node, tag, found.offset, guard);
                true
            }
            None => false,
        }
    }

    fn range_tag_locked(
        &self,
        first: u64,
        last: u64,
        budget: usize,
        if_tag: usize,
        set_tag: usize,
        guard: &Guard,
    ) -> RangeTag {
        let exhausted = RangeTag {
            tagged: 0,
            next_index: last.checked_add(1),
        };
        let (child, _, maxindex) = self.load_root(guard);
        let last = last.min(maxindex);
        if first > last {
            return exhausted;
        }
        if budget == 0 {
            return RangeTag {
                tagged: 0,
                next_index: Some(first),
            };
        }
        if !self.root_tag_get(if_tag) {
            return exhausted;
        }
        let mut node = match child {
            Slot::Node(node) => node,
            _ => {
                self.root_tag_set(set_tag);
                return RangeTag {
                    tagged: 1,
                    ..exhausted
                };
            }
        };

        let mut index = first;
        let mut tagged = 0;
        let finished = loop {
            let (offset, child) = node.descend::<V>(index, guard);
            if !child.is_empty() && node.tag_get(if_tag, offset) {
                match child {
                    Slot::Node(next) => {
                        node = next;
                        continue;
                    }
                    Slot::Leaf(_) => {
                        tagged += 1;
                        node.tag_set(set_tag, offset);
                        let mut current = node;
                        while let Some(parent) = current.parent(guard) {
                            let offset = usize::from(current.offset);
                            if parent.tag_get(set_tag, offset) {
                                break;
                            }
                            parent.tag_set(set_tag, offset);
                            current = parent;
                        }
                    }
                    _ => {}
                }
            }

            // Advance to the next slot, climbing out of fully scanned nodes
            // and stepping over sibling markers.
            loop {
                index = ((index >> node.shift).wrapping_add(1)).wrapping_shl(node.shift());
                if index > last || index == 0 {
                    break;
                }
                let mut offset = node.offset_of(index);
                while offset == 0 {
                    node = match node.parent(guard) {
                        Some(parent) => parent,
                        None => unreachable!("range scan climbed past the root"),
                    };
                    offset = node.offset_of(index);
                }
                if !slot::is_sibling(node.slots[offset].word()) {
                    break;
                }
            }
            if index > last || index == 0 {
                break true;
            }
            if tagged >= budget {
                break false;
            }
        };

        if tagged > 0 {
            self.root_tag_set(set_tag);
        }
        RangeTag {
            tagged,
            next_index: if finished { exhausted.next_index } else { Some(index) },
        }
    }
}

impl<V> Drop for RadixTree<V> {
    fn drop(&mut self) {
        let word = self.root.word();
        self.root.set(slot::EMPTY);
        if slot::is_leaf(word) {
            // SAFETY: `&mut self` rules out readers.
            unsafe { Leaf::<V>::drop_word(word) };
            return;
        }
        let Some(top) = slot::node_ptr(word) else {
            return;
        };
        // SAFETY: `&mut self` rules out readers; every node below the root is
        // owned by its parent slot.
        let mut stack = vec![top];
        while let Some(node) = stack.pop() {
            unsafe {
                for child in &(*node).slots {
                    let child = child.word();
                    if slot::is_leaf(child) {
                        Leaf::<V>::drop_word(child);
                    } else if let Some(grandchild) = slot::node_ptr(child) {
                        stack.push(grandchild);
                    }
                }
                self.alloc.free_now(node);
            }
        }
    }
}

impl<V> fmt::Debug for RadixTree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixTree")
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("nodes", &self.alloc.live())
            .field("tags", &self.root_tags.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Exclusive write access to a [`RadixTree`].
///
/// Readers keep running while a `Writer` is alive. Every mutation repins the
/// writer's epoch guard, so garbage from earlier mutations can be collected
/// while the writer is held.
pub struct Writer<'t, V> {
    tree: &'t RadixTree<V>,
    guard: Guard,
    _lock: MutexGuard<'t, ()>,
}

impl<'t, V> Writer<'t, V>
where
    V: Send + Sync + 'static,
{
    fn new(tree: &'t RadixTree<V>, lock: MutexGuard<'t, ()>) -> Self {
        Self {
            tree,
            guard: epoch::pin(),
            _lock: lock,
        }
    }

    /// Inserts `value` at `index`.
    ///
    /// Fails with [`Error::Exists`] if the index is occupied and with
    /// [`Error::OutOfMemory`] if a node could not be allocated; the tree is
    /// unchanged in both cases.
    pub fn insert(&mut self, index: u64, value: V) -> Result<()> {
        self.insert_order(index, 0, value)
    }

    /// Inserts one entry covering the `2^order` aligned indices that contain
    /// `index`. Every covered index looks up to the same value.
    pub fn insert_order(&mut self, index: u64, order: u32, value: V) -> Result<()> {
        self.guard.repin();
        self.tree.insert_locked(index, order, value, &self.guard)
    }

    /// Removes the entry covering `index` and returns a reference to its
    /// value.
    ///
    /// The value is dropped once the grace period of this writer's pin ends,
    /// so the reference stays valid until the writer is used again. Readers
    /// that already hold a reference keep seeing the old value until they
    /// unpin.
    pub fn remove(&mut self, index: u64) -> Option<&V> {
        self.guard.repin();
        self.tree.delete_locked(index, |_| true, &self.guard)
    }

    /// Like [`remove`](Self::remove), but only if the entry equals
    /// `expected`.
    pub fn remove_item(&mut self, index: u64, expected: &V) -> Option<&V>
    where
        V: PartialEq,
    {
        self.guard.repin();
        self.tree.delete_locked(index, |value| value == expected, &self.guard)
    }

    /// Removes the entry covering `index` and returns a copy of its value.
    pub fn delete(&mut self, index: u64) -> Option<V>
    where
        V: Clone,
    {
        self.remove(index).cloned()
    }

    /// Removes the entry covering `index` only if it equals `expected`.
    pub fn delete_item(&mut self, index: u64, expected: &V) -> Option<V>
    where
        V: Clone + PartialEq,
    {
        self.remove_item(index, expected).cloned()
    }

    /// Handle to the slot holding the entry for `index`.
    pub fn lookup_slot(&mut self, index: u64) -> Option<SlotMut<'_, V>> {
        self.guard.repin();
        let found = self.tree.lookup_entry(index, &self.guard)?;
        Some(SlotMut {
            slot: self.tree.slot_at(found.node, found.offset),
            index,
            guard: &self.guard,
            _marker: PhantomData,
        })
    }

    /// Sets `tag` on the entry at `index` and on every ancestor. Returns
    /// `false` and changes nothing if the index is absent.
    pub fn tag_set(&mut self, index: u64, tag: usize) -> bool {
        assert!(tag < MAX_TAGS, "tag {tag} out of range");
        self.guard.repin();
        self.tree.tag_set_locked(index, tag, &self.guard)
    }

    /// Clears `tag` on the entry at `index`, and on each ancestor left with
    /// no other entry carrying it. Returns `false` if the index is absent.
    pub fn tag_clear(&mut self, index: u64, tag: usize) -> bool {
        assert!(tag < MAX_TAGS, "tag {tag} out of range");
        self.guard.repin();
        self.tree.tag_clear_locked(index, tag, &self.guard)
    }

    /// Sets `set_tag` on every entry in `first..=last` that carries
    /// `if_tag`, stopping after `budget` entries.
    ///
    /// Resume from [`RangeTag::next_index`] to sweep the rest of the range
    /// with bounded work per call.
    ///
    /// ```
    /// use radix_index::RadixTree;
    ///
    /// let tree = RadixTree::new();
    /// let mut w = tree.write();
    /// for index in [3, 70, 5000] {
    ///     w.insert(index, index).unwrap();
    ///     w.tag_set(index, 0);
    /// }
    ///
    /// let pass = w.range_tag_if_tagged(0, u64::MAX, 2, 0, 1);
    /// assert_eq!(pass.tagged, 2);
    /// let rest = w.range_tag_if_tagged(pass.next_index.unwrap(), u64::MAX, 2, 0, 1);
    /// assert_eq!(rest.tagged, 1);
    /// assert_eq!(rest.next_index, None);
    /// ```
    pub fn range_tag_if_tagged(
        &mut self,
        first: u64,
        last: u64,
        budget: usize,
        if_tag: usize,
        set_tag: usize,
    ) -> RangeTag {
        assert!(if_tag < MAX_TAGS && set_tag < MAX_TAGS, "tag out of range");
        self.guard.repin();
        self.tree
            .range_tag_locked(first, last, budget, if_tag, set_tag, &self.guard)
    }
}

impl<V> std::ops::Deref for Writer<'_, V> {
    type Target = RadixTree<V>;

    fn deref(&self) -> &RadixTree<V> {
        self.tree
    }
}

/// Mutable handle to an occupied slot, obtained from [`Writer::lookup_slot`].
pub struct SlotMut<'w, V> {
    slot: &'w RawSlot,
    index: u64,
    guard: &'w Guard,
    _marker: PhantomData<&'w V>,
}

impl<'w, V> SlotMut<'w, V>
where
    V: Send + Sync + 'static,
{
    /// Index the handle was looked up with.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn get(&self) -> &V {
        match self.slot.load::<V>(self.guard) {
            Slot::Leaf(leaf) => &**leaf,
            _ => unreachable!("occupied slot changed under the write lock"),
        }
    }

    /// Swaps in `value`. The previous value is dropped once concurrent
    /// readers have moved on.
    pub fn replace(&mut self, value: V) {
        let old = self.slot.word();
        debug_assert!(slot::is_leaf(old));
        self.slot.set(Leaf::into_word(value));
        // SAFETY: `old` was the leaf in this slot and is now unlinked.
        unsafe { Leaf::<V>::defer_drop(old, self.guard) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAP_SIZE as FANOUT;

    fn tree_with(keys: &[u64]) -> RadixTree<u64> {
        let tree = RadixTree::new();
        {
            let mut w = tree.write();
            for &key in keys {
                w.insert(key, key.wrapping_mul(10)).unwrap();
            }
        }
        tree.validate();
        tree
    }

    #[test]
    fn test_empty_tree() {
        let tree: RadixTree<u64> = RadixTree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.lookup(0), None);
        assert_eq!(tree.lookup(u64::MAX), None);
        assert!(!tree.tagged(0));
    }

    #[test]
    fn test_single_leaf_lives_in_root() {
        let tree = tree_with(&[0]);
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.nodes_in_use(), 0);
        assert_eq!(tree.lookup(0), Some(0));
        assert_eq!(tree.lookup(1), None);
    }

    #[test]
    fn test_first_nonzero_key_allocates_node() {
        let tree = tree_with(&[5]);
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.nodes_in_use(), 1);
        assert_eq!(tree.lookup(5), Some(50));
        assert_eq!(tree.lookup(0), None);
    }

    #[test]
    fn test_scenario_heights() {
        let tree = tree_with(&[0, 1, 64, 4096]);
        assert!(tree.height() >= 3);
        assert_eq!(tree.lookup(64), Some(640));
        assert_eq!(tree.lookup(63), None);
        assert_eq!(tree.lookup(4096), Some(40960));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_insert_existing_fails() {
        let tree = tree_with(&[0, 7]);
        let mut w = tree.write();
        assert_eq!(w.insert(7, 1), Err(Error::Exists { index: 7 }));
        assert_eq!(w.insert(0, 1), Err(Error::Exists { index: 0 }));
        drop(w);
        assert_eq!(tree.lookup(7), Some(70));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_rejected_insert_undoes_growth() {
        let tree = tree_with(&[0]);
        let mut w = tree.write();
        assert_eq!(w.insert_order(0, 1, 1), Err(Error::Exists { index: 0 }));
        drop(w);
        tree.validate();
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.nodes_in_use(), 0);
        assert_eq!(tree.lookup(1), None);
    }

    #[test]
    fn test_max_index() {
        let tree = tree_with(&[u64::MAX, 0]);
        assert_eq!(tree.lookup(u64::MAX), Some(u64::MAX.wrapping_mul(10)));
        assert_eq!(tree.max_index(), u64::MAX);
        assert_eq!(tree.height(), 11);

        let mut w = tree.write();
        assert!(w.delete(u64::MAX).is_some());
        drop(w);
        tree.validate();
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.nodes_in_use(), 0);
    }

    #[test]
    fn test_delete_shrinks_to_root_leaf() {
        let tree = tree_with(&[0, 1]);
        assert_eq!(tree.height(), 1);

        let mut w = tree.write();
        assert_eq!(w.delete(1), Some(10));
        drop(w);

        tree.validate();
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.nodes_in_use(), 0);
        assert_eq!(tree.lookup(0), Some(0));
    }

    #[test]
    fn test_extend_then_delete_restores_height() {
        let tree = tree_with(&[0, 1, 2, 63]);
        let height = tree.height();
        let nodes = tree.nodes_in_use();

        let mut w = tree.write();
        w.insert(1 << 40, 1).unwrap();
        assert!(w.height() > height);
        assert_eq!(w.delete(1 << 40), Some(1));
        drop(w);

        tree.validate();
        assert_eq!(tree.height(), height);
        assert_eq!(tree.nodes_in_use(), nodes);
        for key in [0, 1, 2, 63] {
            assert_eq!(tree.lookup(key), Some(key * 10));
        }
    }

    #[test]
    fn test_delete_last_key_empties_tree() {
        let tree = tree_with(&[300]);
        let mut w = tree.write();
        w.tag_set(300, 2);
        assert_eq!(w.delete(300), Some(3000));
        assert_eq!(w.delete(300), None);
        drop(w);
        assert!(tree.is_empty());
        assert!(!tree.tagged(2));
        assert_eq!(tree.nodes_in_use(), 0);
    }

    #[test]
    fn test_delete_item_checks_value() {
        let tree = tree_with(&[9]);
        let mut w = tree.write();
        assert_eq!(w.delete_item(9, &1), None);
        assert_eq!(w.delete_item(9, &90), Some(90));
        assert_eq!(w.delete_item(9, &90), None);
    }

    #[test]
    fn test_remove_without_clone() {
        use std::sync::Mutex as StdMutex;

        let tree: RadixTree<StdMutex<u8>> = RadixTree::new();
        let mut w = tree.write();
        w.insert(1, StdMutex::new(1)).unwrap();
        w.insert(4096, StdMutex::new(2)).unwrap();
        w.insert_order(64, 6, StdMutex::new(3)).unwrap();

        let removed = w.remove(4096).unwrap();
        *removed.lock().unwrap() += 10;
        assert_eq!(*removed.lock().unwrap(), 12);
        assert!(w.remove(4096).is_none());

        assert_eq!(w.remove(100).map(|value| *value.lock().unwrap()), Some(3));
        assert_eq!(w.len(), 1);
        assert_eq!(w.remove(1).map(|value| *value.lock().unwrap()), Some(1));
        assert!(w.is_empty());
        drop(w);
        tree.validate();
    }

    #[test]
    fn test_remove_item_compares_in_place() {
        let tree = tree_with(&[5, 70]);
        let mut w = tree.write();
        assert_eq!(w.remove_item(70, &7), None);
        assert_eq!(w.remove_item(70, &700), Some(&700));
        assert_eq!(w.remove_item(70, &700), None);
        assert_eq!(w.len(), 1);
        drop(w);
        tree.validate();
    }

    #[test]
    fn test_multi_order_entry_covers_range() {
        let tree: RadixTree<&str> = RadixTree::new();
        let mut w = tree.write();
        w.insert_order(5, 2, "four-to-seven").unwrap();
        drop(w);
        tree.validate();

        for index in 4..8 {
            assert_eq!(tree.lookup(index), Some("four-to-seven"));
        }
        assert_eq!(tree.lookup(3), None);
        assert_eq!(tree.lookup(8), None);
        assert_eq!(tree.len(), 1);

        let mut w = tree.write();
        assert_eq!(w.insert(6, "x"), Err(Error::Exists { index: 6 }));
        assert_eq!(w.delete(6), Some("four-to-seven"));
        drop(w);
        tree.validate();
        for index in 4..8 {
            assert_eq!(tree.lookup(index), None);
        }
    }

    #[test]
    fn test_multi_order_conflicts() {
        let tree: RadixTree<u32> = RadixTree::new();
        let mut w = tree.write();
        w.insert(130, 1).unwrap();
        w.insert(200, 2).unwrap();
        assert_eq!(w.insert_order(128, 3, 3), Err(Error::Exists { index: 128 }));
        assert_eq!(w.insert_order(128, 6, 3), Err(Error::Exists { index: 128 }));
        w.insert_order(64, 6, 4).unwrap();
        assert_eq!(w.insert(100, 5), Err(Error::Exists { index: 100 }));
        assert_eq!(w.insert_order(96, 3, 5), Err(Error::Exists { index: 96 }));
        drop(w);
        tree.validate();
        assert_eq!(tree.lookup(127), Some(4));
        assert_eq!(tree.lookup(130), Some(1));
    }

    #[test]
    fn test_whole_node_order() {
        let tree: RadixTree<u32> = RadixTree::new();
        let mut w = tree.write();
        w.insert_order(0, 6, 1).unwrap();
        w.insert_order(1 << 12, 12, 2).unwrap();
        drop(w);
        tree.validate();
        assert_eq!(tree.lookup(63), Some(1));
        assert_eq!(tree.lookup(64), None);
        assert_eq!(tree.lookup((1 << 13) - 1), Some(2));
    }

    #[test]
    fn test_invalid_order() {
        let tree: RadixTree<u32> = RadixTree::new();
        let mut w = tree.write();
        assert_eq!(w.insert_order(0, 64, 1), Err(Error::InvalidOrder { order: 64 }));
        w.insert_order(0, 63, 1).unwrap();
        drop(w);
        assert_eq!(tree.lookup(1 << 62), Some(1));
        assert_eq!(tree.lookup(1 << 63), None);
    }

    #[test]
    fn test_tag_propagation() {
        let tree = tree_with(&[10, 20, 5000]);
        let mut w = tree.write();
        assert!(w.tag_set(10, 0));
        assert!(w.tag_set(20, 0));
        assert!(w.tagged(0));
        assert!(w.tag_get(10, 0));
        assert!(!w.tag_get(10, 1));
        assert!(!w.tag_get(5000, 0));

        assert!(w.tag_clear(10, 0));
        assert!(!w.tag_get(10, 0));
        assert!(w.tagged(0));

        assert!(w.tag_clear(20, 0));
        assert!(!w.tagged(0));
        drop(w);
        tree.validate();
    }

    #[test]
    fn test_tag_absent_key_is_noop() {
        let tree = tree_with(&[10]);
        let mut w = tree.write();
        assert!(!w.tag_set(11, 1));
        assert!(!w.tag_clear(11, 1));
        assert!(!w.tag_set(1 << 50, 1));
        assert!(!w.tagged(1));
    }

    #[test]
    fn test_root_leaf_tags() {
        let tree = tree_with(&[0]);
        let mut w = tree.write();
        assert!(w.tag_set(0, 1));
        assert!(w.tag_get(0, 1));

        // Tags survive growing and shrinking around the root leaf.
        w.insert(1, 1).unwrap();
        assert!(w.tag_get(0, 1));
        assert!(!w.tag_get(1, 1));
        w.delete(1);
        assert!(w.tag_get(0, 1));
        assert!(w.tag_clear(0, 1));
        assert!(!w.tagged(1));
        drop(w);
        tree.validate();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_tag_out_of_range() {
        let tree = tree_with(&[1]);
        tree.write().tag_set(1, MAX_TAGS);
    }

    #[test]
    fn test_delete_clears_tags() {
        let tree = tree_with(&[1, 2]);
        let mut w = tree.write();
        w.tag_set(1, 0);
        w.tag_set(1, 2);
        w.delete(1);
        assert!(!w.tagged(0));
        assert!(!w.tagged(2));
        w.insert(1, 11).unwrap();
        assert!(!w.tag_get(1, 0));
        drop(w);
        tree.validate();
    }

    #[test]
    fn test_lookup_slot_replace() {
        let tree: RadixTree<String> = RadixTree::new();
        let mut w = tree.write();
        w.insert(77, "old".to_string()).unwrap();
        assert!(w.lookup_slot(78).is_none());

        let mut slot = w.lookup_slot(77).unwrap();
        assert_eq!(slot.index(), 77);
        assert_eq!(slot.get(), "old");
        slot.replace("new".to_string());
        assert_eq!(slot.get(), "new");
        drop(w);
        assert_eq!(tree.lookup(77).as_deref(), Some("new"));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_range_tag_sweep() {
        let keys: Vec<u64> = (0..200).map(|i| i * 37).collect();
        let tree = tree_with(&keys);
        let mut w = tree.write();
        for &key in keys.iter().filter(|&&key| key % 2 == 0) {
            w.tag_set(key, 0);
        }

        let (first, last) = (100, 5000);
        let mut next = Some(first);
        let mut total = 0;
        while let Some(start) = next {
            let pass = w.range_tag_if_tagged(start, last, 7, 0, 1);
            assert!(pass.tagged <= 7);
            total += pass.tagged;
            next = pass.next_index.filter(|&index| index <= last);
        }
        drop(w);
        tree.validate();

        let expected: Vec<u64> = keys
            .iter()
            .copied()
            .filter(|&key| key % 2 == 0 && (first..=last).contains(&key))
            .collect();
        assert_eq!(total, expected.len());
        for &key in &keys {
            assert_eq!(tree.tag_get(key, 1), expected.contains(&key), "key {key}");
        }
    }

    #[test]
    fn test_range_tag_edges() {
        let tree = tree_with(&[0]);
        let mut w = tree.write();
        assert_eq!(
            w.range_tag_if_tagged(0, 10, 5, 0, 1),
            RangeTag { tagged: 0, next_index: Some(11) }
        );
        w.tag_set(0, 0);
        assert_eq!(
            w.range_tag_if_tagged(0, 10, 0, 0, 1),
            RangeTag { tagged: 0, next_index: Some(0) }
        );
        assert_eq!(
            w.range_tag_if_tagged(0, u64::MAX, 5, 0, 1),
            RangeTag { tagged: 1, next_index: None }
        );
        assert!(w.tag_get(0, 1));
        assert_eq!(
            w.range_tag_if_tagged(5, 3, 5, 0, 2),
            RangeTag { tagged: 0, next_index: Some(4) }
        );
    }

    #[test]
    fn test_range_tag_skips_siblings() {
        let tree: RadixTree<u32> = RadixTree::new();
        let mut w = tree.write();
        w.insert_order(8, 3, 1).unwrap();
        w.insert(20, 2).unwrap();
        w.tag_set(8, 0);
        w.tag_set(20, 0);

        let pass = w.range_tag_if_tagged(0, 63, 10, 0, 1);
        assert_eq!(pass.tagged, 2);
        assert!(w.tag_get(12, 1));
        assert!(w.tag_get(20, 1));
        drop(w);
        tree.validate();
    }

    #[test]
    fn test_node_limit_out_of_memory() {
        let tree: RadixTree<u32> = RadixTree::with_config(Config::default().with_node_limit(3));
        let mut w = tree.write();
        w.insert(0, 0).unwrap();
        w.insert(1, 1).unwrap();
        w.insert(64, 64).unwrap();
        assert_eq!(w.nodes_in_use(), 3);
        assert_eq!(w.insert(1 << 30, 2), Err(Error::OutOfMemory));
        assert_eq!(w.nodes_in_use(), 3);
        assert_eq!(w.len(), 3);
        drop(w);
        tree.validate();
        assert_eq!(tree.height(), 2);
    }

    #[test]
    fn test_failed_path_allocation_is_pruned() {
        let tree: RadixTree<u32> = RadixTree::with_config(Config::default().with_node_limit(3));
        let mut w = tree.write();
        w.insert(1, 1).unwrap();
        // Extension takes two more nodes, the path down to the new key needs
        // more than the limit allows.
        assert_eq!(w.insert(1 << 12, 2), Err(Error::OutOfMemory));
        drop(w);
        tree.validate();
        assert_eq!(tree.height(), 1);
        assert_eq!(tree.nodes_in_use(), 1);
        assert_eq!(tree.lookup(1), Some(1));
    }

    #[test]
    fn test_preload_satisfies_non_blocking_insert() {
        std::thread::spawn(|| {
            let tree: RadixTree<u64> =
                RadixTree::with_config(Config::non_blocking().with_node_limit(0));
            assert_eq!(tree.write().insert(3, 3), Err(Error::OutOfMemory));

            let reserve = crate::preload().unwrap();
            let mut w = tree.write();
            w.insert(0, 0).unwrap();
            w.insert(u64::MAX, 1).unwrap();
            drop(w);
            drop(reserve);

            tree.validate();
            assert_eq!(tree.lookup(u64::MAX), Some(1));
            assert_eq!(tree.nodes_in_use(), 2 * crate::MAX_PATH - 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_try_write_excludes_writers() {
        let tree: RadixTree<u8> = RadixTree::new();
        let w = tree.write();
        assert!(tree.try_write().is_none());
        drop(w);
        assert!(tree.try_write().is_some());
    }

    #[test]
    fn test_fanout_boundaries() {
        let keys: Vec<u64> = (0..3 * FANOUT as u64).collect();
        let tree = tree_with(&keys);
        let mut w = tree.write();
        for key in (0..3 * FANOUT as u64).step_by(2) {
            assert_eq!(w.delete(key), Some(key * 10));
        }
        drop(w);
        tree.validate();
        for key in 0..3 * FANOUT as u64 {
            assert_eq!(tree.contains(key), key % 2 == 1);
        }
    }

    #[test]
    fn test_drop_releases_values() {
        use std::sync::Arc;

        let marker = Arc::new(());
        {
            let tree = RadixTree::new();
            let mut w = tree.write();
            for index in [0u64, 9, 1 << 20] {
                w.insert(index, Arc::clone(&marker)).unwrap();
            }
            w.insert_order(128, 4, Arc::clone(&marker)).unwrap();
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
