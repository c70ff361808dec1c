//! Tree configuration.

/// How a tree obtains nodes when it needs to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocPolicy {
    /// The caller may block; allocate straight from the node source.
    #[default]
    Blocking,
    /// The caller must not block. Try the fast path first, then fall back to
    /// the calling thread's preload pool.
    NonBlocking,
}

impl AllocPolicy {
    /// Whether this policy permits a blocking allocation.
    #[inline]
    pub fn allows_blocking(self) -> bool {
        matches!(self, AllocPolicy::Blocking)
    }
}

/// Configuration for a [`RadixTree`](crate::RadixTree).
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Allocation policy applied to every node this tree allocates.
    pub alloc_policy: AllocPolicy,
    /// Number of live nodes beyond which the fast allocation path refuses.
    ///
    /// Nodes taken from a preload pool may push the tree past this limit.
    /// `None` means unlimited.
    pub node_limit: Option<usize>,
}

impl Config {
    /// Configuration for a tree that is mutated from non-blocking contexts.
    pub fn non_blocking() -> Self {
        Self {
            alloc_policy: AllocPolicy::NonBlocking,
            node_limit: None,
        }
    }

    /// Sets the fast-path node limit.
    pub fn with_node_limit(mut self, limit: usize) -> Self {
        self.node_limit = Some(limit);
        self
    }
}
