//! Error types for the base allocator.

use thiserror::Error;

/// Failures of base-allocator construction and lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BaseAllocError {
    /// The OS refused to map a slab.
    #[error("mapping a {len}-byte slab failed (errno {errno})")]
    OutOfMemory { len: usize, errno: i32 },
    /// Requested object does not fit a chunk of the allocator.
    #[error("object of {requested} bytes exceeds the {chunk_size}-byte chunk size")]
    ObjectTooLarge { requested: usize, chunk_size: usize },
    /// Chunk or slab size computation overflowed `usize`.
    #[error("slab size overflows for an object of {object_size} bytes")]
    SizeOverflow { object_size: usize },
}

/// Result alias used throughout the crate.
pub type BaseResult<T> = Result<T, BaseAllocError>;
