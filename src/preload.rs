//! Per-thread node reserve.
//!
//! A writer that must not block while holding the tree's write lock tops up
//! its thread's pool before taking the lock. Non-blocking trees pop from the
//! pool when the fast allocation path refuses, so a single insert after a
//! successful preload cannot fail for lack of nodes.
//!
//! ```
//! use radix_index::{preload, Config, RadixTree};
//!
//! let tree = RadixTree::with_config(Config::non_blocking().with_node_limit(0));
//! let reserve = preload().unwrap();
//! tree.write().insert(1 << 40, "page").unwrap();
//! drop(reserve);
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::alloc;
use crate::config::AllocPolicy;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::{MAP_SHIFT, MAP_SIZE, MAX_PATH};

/// Worst case for one single-index insert: a full branch down to index 0
/// kept alive by extension plus a full branch down to `u64::MAX`, sharing
/// the root.
pub const PRELOAD_SIZE: usize = 2 * MAX_PATH - 1;

/// Nodes needed to fully populate a subtree of each height.
const HEIGHT_TO_MAXNODES: [u64; MAX_PATH + 1] = height_to_maxnodes();

const fn height_to_maxnodes() -> [u64; MAX_PATH + 1] {
    let mut table = [0u64; MAX_PATH + 1];
    let mut height = 1;
    while height <= MAX_PATH {
        // Level `height - 1` of a full subtree has MAP_SIZE^(height - 1) nodes.
        table[height] = table[height - 1] + (1u64 << (MAP_SHIFT as usize * (height - 1)));
        height += 1;
    }
    table
}

#[derive(Default)]
struct PreloadPool {
    nodes: SmallVec<[Box<Node>; PRELOAD_SIZE]>,
    /// Nesting depth of live `PreloadGuard`s on this thread.
    depth: usize,
}

impl PreloadPool {
    fn drain(&mut self) {
        for node in self.nodes.drain(..) {
            alloc::release_node(node);
        }
    }
}

impl Drop for PreloadPool {
    fn drop(&mut self) {
        self.drain();
    }
}

thread_local! {
    static PRELOADS: RefCell<PreloadPool> = RefCell::new(PreloadPool::default());
}

/// Marks a preloaded section on the current thread.
///
/// The guard is `!Send`: the reserve belongs to the thread that filled it,
/// so the insert it protects must run on that thread. Dropping the last
/// guard returns unused reserved nodes to the global free-node cache.
#[must_use = "the reserve is released when the guard is dropped"]
pub struct PreloadGuard {
    _not_send: PhantomData<*const ()>,
}

impl PreloadGuard {
    fn enter() -> Self {
        PRELOADS.with(|pool| pool.borrow_mut().depth += 1);
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for PreloadGuard {
    fn drop(&mut self) {
        let _ = PRELOADS.try_with(|pool| {
            let mut pool = pool.borrow_mut();
            pool.depth -= 1;
            if pool.depth == 0 {
                pool.drain();
            }
        });
    }
}

impl std::fmt::Debug for PreloadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreloadGuard").field("reserved", &reserved()).finish()
    }
}

/// Fills this thread's pool up to `nr` nodes, allocating with blocking
/// allowed. Preloaded nodes are never charged against a tree's node limit.
fn top_up(nr: usize) -> Result<PreloadGuard> {
    loop {
        let have = reserved();
        if have >= nr {
            break;
        }
        let Some(node) = alloc::alloc_node(true) else {
            tracing::warn!(have, wanted = nr, "radix tree preload could not fill the pool");
            return Err(Error::OutOfMemory);
        };
        PRELOADS.with(|pool| pool.borrow_mut().nodes.push(node));
    }
    Ok(PreloadGuard::enter())
}

/// Reserves enough nodes on this thread that one subsequent single-index
/// insert cannot fail for lack of memory.
///
/// On error nothing is pinned; nodes reserved so far stay in the pool.
pub fn preload() -> Result<PreloadGuard> {
    top_up(PRELOAD_SIZE)
}

/// Preloads only when `policy` allows blocking; otherwise just marks the
/// section.
pub fn maybe_preload(policy: AllocPolicy) -> Result<PreloadGuard> {
    if policy.allows_blocking() {
        preload()
    } else {
        Ok(PreloadGuard::enter())
    }
}

/// Like [`maybe_preload`], reserving enough nodes to insert `1 << order`
/// contiguous, naturally aligned indices.
pub fn preload_order(policy: AllocPolicy, order: u32) -> Result<PreloadGuard> {
    if order == 0 {
        return maybe_preload(policy);
    }
    let nr = nodes_for_order(order)?;
    if !policy.allows_blocking() {
        return Ok(PreloadGuard::enter());
    }
    top_up(nr)
}

/// Worst-case node count for inserting an aligned block of `1 << order`
/// indices: the branch kept alive at index 0, the branch down to the block's
/// subtrees and the subtrees themselves.
pub(crate) fn nodes_for_order(order: u32) -> Result<usize> {
    if order >= u64::BITS {
        return Err(Error::InvalidOrder { order });
    }
    let mut subtrees = 1u64 << order;
    let mut height = 0;
    while subtrees > MAP_SIZE as u64 {
        subtrees >>= MAP_SHIFT;
        height += 1;
    }
    let path = (MAX_PATH + MAX_PATH - height - 1) as u64;
    subtrees
        .checked_mul(HEIGHT_TO_MAXNODES[height])
        .and_then(|nodes| nodes.checked_add(path))
        .and_then(|nodes| usize::try_from(nodes).ok())
        .ok_or(Error::OutOfMemory)
}

/// Pops a reserved node from this thread's pool.
pub(crate) fn take_node() -> Option<Box<Node>> {
    PRELOADS
        .try_with(|pool| pool.borrow_mut().nodes.pop())
        .ok()
        .flatten()
}

/// Nodes currently reserved on this thread.
pub fn reserved() -> usize {
    PRELOADS.try_with(|pool| pool.borrow().nodes.len()).unwrap_or(0)
}
