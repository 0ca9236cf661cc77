//! Process-wide base allocator.
//!
//! Handle records of every provider and pool share one allocator with
//! 128-byte chunks. It is created on first use and lives until process
//! exit; the OS reclaims its slabs.

use std::sync::OnceLock;

use crate::base_alloc::BaseAllocator;
use crate::error::{BaseAllocError, BaseResult};

/// Chunk size of the global base allocator.
pub const GLOBAL_CHUNK_SIZE: usize = 128;

static GLOBAL_BASE_ALLOCATOR: OnceLock<BaseResult<BaseAllocator>> = OnceLock::new();

/// The global base allocator, created on first call.
///
/// Concurrent first callers block until one of them has finished the
/// initialization. A failed initialization is remembered and reported to
/// every later caller.
pub fn global_base_allocator() -> BaseResult<&'static BaseAllocator> {
    GLOBAL_BASE_ALLOCATOR
        .get_or_init(|| BaseAllocator::new(GLOBAL_CHUNK_SIZE))
        .as_ref()
        .map_err(|err| *err)
}

/// The global base allocator if an object of `size` bytes fits its chunks.
pub fn base_allocator_for(size: usize) -> BaseResult<&'static BaseAllocator> {
    if size > GLOBAL_CHUNK_SIZE {
        return Err(BaseAllocError::ObjectTooLarge {
            requested: size,
            chunk_size: GLOBAL_CHUNK_SIZE,
        });
    }
    global_base_allocator()
}
