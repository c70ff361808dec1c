//! Structure dumps and the full-tree consistency check used by tests.

use std::fmt;

use crossbeam_epoch::{self as epoch, Guard};

use crate::node::Node;
use crate::slot::Slot;
use crate::tree::RadixTree;
use crate::{MAP_SIZE, MAX_TAGS};

impl<V> RadixTree<V>
where
    V: Send + Sync + 'static,
{
    /// Logs every node and entry at `debug` level.
    pub fn dump(&self)
    where
        V: fmt::Debug,
    {
        let guard = &epoch::pin();
        tracing::debug!(
            tags = self.root_tags.load(std::sync::atomic::Ordering::Relaxed),
            len = self.len(),
            "radix root"
        );
        match self.root.load::<V>(guard) {
            Slot::Leaf(leaf) => tracing::debug!(index = 0, value = ?&**leaf, "radix entry"),
            Slot::Node(node) => dump_node::<V>(node, 0, guard),
            _ => {}
        }
    }
}

fn dump_node<V: fmt::Debug>(node: &Node, index: u64, guard: &Guard) {
    tracing::debug!(
        offset = node.offset,
        shift = node.shift,
        count = node.count(),
        tags = ?[node.tag_word(0), node.tag_word(1), node.tag_word(2)],
        "radix node"
    );
    let span = node.shift();
    for offset in 0..MAP_SIZE {
        let first = index | (offset as u64).wrapping_shl(span);
        let last = first | ((1u64 << span) - 1);
        match node.slots[offset].load::<V>(guard) {
            Slot::Empty => {}
            Slot::Leaf(leaf) => tracing::debug!(offset, first, last, value = ?&**leaf, "radix entry"),
            Slot::Sibling(canonical) => {
                tracing::debug!(offset, canonical, first, last, "radix sibling")
            }
            Slot::Node(child) => dump_node::<V>(child, first, guard),
            Slot::Retry => tracing::debug!(offset, "radix retry"),
        }
    }
}

#[cfg(test)]
impl<V> RadixTree<V>
where
    V: Send + Sync + 'static,
{
    /// Walks the whole tree and panics on the first broken invariant.
    ///
    /// Checks slot counts, parent/offset/shift back-references, exact tag
    /// propagation up to the root aggregate, sibling marker layout, and that
    /// no linked node is empty. Also reconciles `len` and the node count.
    pub(crate) fn validate(&self) {
        let guard = &epoch::pin();
        let mut leaves = 0;
        let mut nodes = 0;
        match self.root.load::<V>(guard) {
            Slot::Empty => {
                assert_eq!(self.root_tags.load(std::sync::atomic::Ordering::Relaxed), 0);
            }
            Slot::Leaf(_) => leaves = 1,
            Slot::Node(top) => {
                assert!(top.parent(guard).is_none(), "top node has a parent");
                let tags = validate_node::<V>(top, guard, &mut leaves, &mut nodes);
                for tag in 0..MAX_TAGS {
                    assert_eq!(
                        self.root_tag_get(tag),
                        tags & (1 << tag) != 0,
                        "root aggregate for tag {tag}"
                    );
                }
            }
            Slot::Sibling(_) | Slot::Retry => panic!("root holds a transient slot"),
        }
        assert_eq!(leaves, self.len(), "leaf count");
        assert_eq!(nodes, self.alloc.live(), "live node count");
    }
}

/// Returns the tags carried anywhere below `node`, one bit per tag.
#[cfg(test)]
fn validate_node<V>(node: &Node, guard: &Guard, leaves: &mut usize, nodes: &mut usize) -> u8 {
    *nodes += 1;
    let mut occupied = 0;
    for offset in 0..MAP_SIZE {
        match node.slots[offset].load::<V>(guard) {
            Slot::Empty => {
                for tag in 0..MAX_TAGS {
                    assert!(!node.tag_get(tag, offset), "tag {tag} on empty slot {offset}");
                }
            }
            Slot::Leaf(_) => {
                occupied += 1;
                *leaves += 1;
            }
            Slot::Node(child) => {
                occupied += 1;
                assert!(
                    child.parent(guard).is_some_and(|parent| std::ptr::eq(parent, node)),
                    "child at {offset} has a stale parent"
                );
                assert_eq!(usize::from(child.offset), offset, "child offset");
                assert_eq!(child.shift() + crate::MAP_SHIFT, node.shift(), "child shift");
                assert!(child.count() > 0, "empty node linked at {offset}");

                let below = validate_node::<V>(child, guard, leaves, nodes);
                for tag in 0..MAX_TAGS {
                    assert_eq!(
                        node.tag_get(tag, offset),
                        below & (1 << tag) != 0,
                        "tag {tag} at offset {offset} does not match its subtree"
                    );
                }
            }
            Slot::Sibling(canonical) => {
                occupied += 1;
                assert!(canonical < offset, "sibling points forward");
                assert!(
                    matches!(node.slots[canonical].load::<V>(guard), Slot::Leaf(_)),
                    "sibling at {offset} without a canonical leaf"
                );
                for between in canonical + 1..offset {
                    assert!(
                        matches!(node.slots[between].load::<V>(guard), Slot::Sibling(c) if c == canonical),
                        "gap in sibling run at {between}"
                    );
                }
                for tag in 0..MAX_TAGS {
                    assert!(!node.tag_get(tag, offset), "tag {tag} on sibling {offset}");
                }
            }
            Slot::Retry => panic!("retry marker inside a linked node"),
        }
    }
    assert_eq!(node.count(), occupied, "slot count");
    assert!(occupied > 0, "empty node is still linked");

    let mut tags = 0;
    for tag in 0..MAX_TAGS {
        if node.any_tag_set(tag) {
            tags |= 1 << tag;
        }
    }
    tags
}
