//! Node allocation.
//!
//! Nodes come from a process-wide free-node cache backed by the global
//! allocator. Each tree owns a [`NodeAllocator`] that applies its
//! [`AllocPolicy`] and node limit, and falls back to the calling thread's
//! preload pool when it is not allowed to block.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;
use parking_lot::Mutex;

use crate::config::{AllocPolicy, Config};
use crate::error::{Error, Result};
use crate::node::Node;
use crate::preload;

/// Nodes kept around after release instead of going back to the allocator.
const NODE_CACHE_CAPACITY: usize = 1024;

static NODE_CACHE: Mutex<Vec<Box<Node>>> = parking_lot::const_mutex(Vec::new());

/// Obtains a zeroed node from the free-node cache or the global allocator.
///
/// With `may_block == false` the cache lock is only tried, never waited on.
pub(crate) fn alloc_node(may_block: bool) -> Option<Box<Node>> {
    let cached = if may_block {
        NODE_CACHE.lock().pop()
    } else {
        NODE_CACHE.try_lock().and_then(|mut cache| cache.pop())
    };
    if cached.is_some() {
        return cached;
    }

    let layout = Layout::new::<Node>();
    // SAFETY: `Node` is not zero-sized, and the all-zero bit pattern is a
    // valid empty node (zero atomics, null parent, empty slots).
    unsafe {
        let ptr = alloc::alloc_zeroed(layout) as *mut Node;
        if ptr.is_null() {
            None
        } else {
            Some(Box::from_raw(ptr))
        }
    }
}

/// Returns a node that no reader can reach any more to the free-node cache.
pub(crate) fn release_node(mut node: Box<Node>) {
    node.reset();
    let mut cache = NODE_CACHE.lock();
    if cache.len() < NODE_CACHE_CAPACITY {
        cache.push(node);
    }
}

/// Per-tree node source.
pub(crate) struct NodeAllocator {
    policy: AllocPolicy,
    limit: Option<usize>,
    live: AtomicUsize,
}

impl NodeAllocator {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            policy: config.alloc_policy,
            limit: config.node_limit,
            live: AtomicUsize::new(0),
        }
    }

    /// Nodes currently linked into (or being linked into) the tree.
    #[inline]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Allocates a zeroed node.
    ///
    /// The fast path refuses once the node limit is reached. A non-blocking
    /// tree then pops from the calling thread's preload pool.
    pub(crate) fn alloc(&self) -> Result<Box<Node>> {
        let may_block = self.policy.allows_blocking();
        let within_limit = self.limit.map_or(true, |limit| self.live() < limit);

        let mut node = if within_limit { alloc_node(may_block) } else { None };
        if node.is_none() && !may_block {
            node = preload::take_node();
        }

        match node {
            Some(node) => {
                self.live.fetch_add(1, Ordering::Relaxed);
                Ok(node)
            }
            None => {
                tracing::warn!(
                    live = self.live(),
                    limit = ?self.limit,
                    policy = ?self.policy,
                    "radix tree node allocation failed"
                );
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Releases a node that was never published to readers.
    pub(crate) fn free_unpublished(&self, node: Box<Node>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        release_node(node);
    }

    /// Releases a node after the current grace period.
    ///
    /// # Safety
    /// `node` must come from [`NodeAllocator::alloc`] on this allocator and
    /// must already be unreachable for new traversals.
    pub(crate) unsafe fn free(&self, node: *const Node, guard: &Guard) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        let node = node as *mut Node;
        // SAFETY: the node is detached; pinned readers keep it alive until the
        // deferred release runs.
        unsafe { guard.defer_unchecked(move || release_node(Box::from_raw(node))) }
    }

    /// Releases a node immediately, e.g. while tearing the tree down.
    ///
    /// # Safety
    /// Same as [`NodeAllocator::free`], and no reader may still observe it.
    pub(crate) unsafe fn free_now(&self, node: *const Node) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: guaranteed by the caller.
        release_node(unsafe { Box::from_raw(node as *mut Node) });
    }
}
