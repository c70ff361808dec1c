//! Error types returned by tree mutations and preloading.

/// Errors surfaced to callers of the radix tree.
///
/// Transient restructuring (the retry sentinel) never shows up here: readers
/// absorb it by restarting their descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A node could not be allocated: the fast path refused and the calling
    /// thread's preload pool was empty.
    #[error("out of memory allocating a radix tree node")]
    OutOfMemory,

    /// The target slot (or one of the slots a multi-order entry would cover)
    /// is already occupied.
    #[error("an entry already exists at index {index}")]
    Exists {
        /// Index the caller tried to insert at.
        index: u64,
    },

    /// An entry of this order cannot be described by a 64-bit index.
    #[error("order {order} exceeds the index width")]
    InvalidOrder {
        /// Requested order.
        order: u32,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
