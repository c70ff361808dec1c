//! # radix-index
//!
//! A concurrent sparse radix tree mapping `u64` indices to values.
//!
//! Each level consumes six bits of the index, so a node has 64 slots and a
//! full-range tree is at most eleven levels deep. The tree only grows as high
//! as the largest stored index needs, and shrinks again as entries go away.
//!
//! Readers never block: lookups, iteration and gang lookups run under a
//! [`crossbeam_epoch`] guard while a single writer (see [`RadixTree::write`])
//! inserts, deletes and tags entries. Unlinked nodes and replaced values are
//! reclaimed once every reader that might still see them has unpinned.
//!
//! Every entry carries [`MAX_TAGS`] independent tag bits. Tags propagate to
//! the root, so "is anything tagged" is a single load and tagged iteration
//! skips untagged subtrees. A multi-order entry covers an aligned block of
//! `1 << order` indices with one value.
//!
//! ## Example
//!
//! ```rust
//! use radix_index::RadixTree;
//!
//! let tree: RadixTree<&str> = RadixTree::new();
//! {
//!     let mut w = tree.write();
//!     w.insert(5, "five").unwrap();
//!     w.insert(1 << 20, "big").unwrap();
//!     w.tag_set(5, 0);
//! }
//!
//! let guard = radix_index::pin();
//! assert_eq!(tree.get(5, &guard), Some(&"five"));
//! assert!(tree.tagged(0));
//!
//! let keys: Vec<u64> = tree.iter(0, &guard).map(|(index, _)| index).collect();
//! assert_eq!(keys, vec![5, 1 << 20]);
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

mod alloc;
mod config;
mod debug;
mod error;
mod iter;
mod node;
mod preload;
mod slot;
mod tree;

#[cfg(test)]
mod proptests;

pub use crossbeam_epoch::{pin, Guard};

pub use config::{AllocPolicy, Config};
pub use error::{Error, Result};
pub use iter::{Chunk, Iter, IterFlags};
pub use preload::{maybe_preload, preload, preload_order, reserved, PreloadGuard, PRELOAD_SIZE};
pub use slot::SlotRef;
pub use tree::{RadixTree, RangeTag, SlotMut, Writer};

// =============================================================================
// Geometry
// =============================================================================

/// Index bits consumed per level.
pub const MAP_SHIFT: u32 = 6;

/// Slots per node.
pub const MAP_SIZE: usize = 1 << MAP_SHIFT;

pub(crate) const MAP_MASK: u64 = MAP_SIZE as u64 - 1;

/// Independent tag bits per entry.
pub const MAX_TAGS: usize = 3;

/// Height of a tree that spans the whole `u64` range.
pub const MAX_PATH: usize = (u64::BITS as usize + MAP_SHIFT as usize - 1) / MAP_SHIFT as usize;
