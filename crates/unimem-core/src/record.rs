//! Handle records stored in base-allocator chunks.
//!
//! Provider and pool handles are a single pointer to a record living in a
//! chunk of the global base allocator, never in memory obtained from a
//! provider or pool.

use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use tracing::warn;
use unimem_base::{BaseAllocator, GLOBAL_CHUNK_SIZE, global_base_allocator};

use crate::error::{MemError, MemResult};
use crate::ops::{OPS_VERSION_CURRENT, OpsVersion};

/// Reject an operation table built against another interface version.
pub(crate) fn check_ops_version(kind: &'static str, version: OpsVersion) -> MemResult<()> {
    if version == OPS_VERSION_CURRENT {
        return Ok(());
    }
    warn!(
        kind,
        version,
        expected = OPS_VERSION_CURRENT,
        "rejecting ops table with unsupported version"
    );
    Err(MemError::InvalidArgument)
}

/// Owning pointer to a `T` placed in a global base-allocator chunk.
pub(crate) struct ChunkBox<T> {
    ptr: NonNull<T>,
    allocator: &'static BaseAllocator,
    _owns: PhantomData<T>,
}

// SAFETY: `ChunkBox<T>` owns its `T` exactly like `Box<T>`.
unsafe impl<T: Send> Send for ChunkBox<T> {}
// SAFETY: shared access only hands out `&T`.
unsafe impl<T: Sync> Sync for ChunkBox<T> {}

impl<T> ChunkBox<T> {
    /// Reserve a chunk for a `T` that is built later.
    pub(crate) fn reserve() -> MemResult<ChunkSlot<T>> {
        const {
            assert!(mem::size_of::<T>() <= GLOBAL_CHUNK_SIZE);
            assert!(mem::align_of::<T>() <= mem::align_of::<usize>());
        }
        let allocator = global_base_allocator()?;
        let chunk = allocator.alloc().ok_or(MemError::OutOfHostMemory)?;
        Ok(ChunkSlot {
            chunk,
            allocator,
            _for: PhantomData,
        })
    }

    /// Reserve a chunk, then build the value with `init`.
    ///
    /// The chunk is reserved first so metadata exhaustion is reported as
    /// `OutOfHostMemory` before any variant state is created. If `init`
    /// fails the chunk is released and its error returned unchanged.
    pub(crate) fn try_new_with<F>(init: F) -> MemResult<Self>
    where
        F: FnOnce() -> MemResult<T>,
    {
        let slot = Self::reserve()?;
        Ok(slot.fill(init()?))
    }

    pub(crate) fn get(&self) -> &T {
        // SAFETY: initialized in `ChunkSlot::fill`, alive until drop.
        unsafe { self.ptr.as_ref() }
    }
}

/// A reserved, still empty chunk. Released on drop unless filled.
pub(crate) struct ChunkSlot<T> {
    chunk: NonNull<u8>,
    allocator: &'static BaseAllocator,
    _for: PhantomData<T>,
}

impl<T> ChunkSlot<T> {
    pub(crate) fn fill(self, value: T) -> ChunkBox<T> {
        let slot = mem::ManuallyDrop::new(self);
        let ptr = slot.chunk.cast::<T>();
        // SAFETY: the chunk is pointer-aligned, large enough for `T`
        // (checked in `reserve`) and exclusively ours.
        unsafe { ptr.as_ptr().write(value) };
        ChunkBox {
            ptr,
            allocator: slot.allocator,
            _owns: PhantomData,
        }
    }
}

impl<T> Drop for ChunkSlot<T> {
    fn drop(&mut self) {
        // SAFETY: chunk came from `allocator` and was never used.
        unsafe { self.allocator.free(self.chunk.as_ptr()) };
    }
}

impl<T> Drop for ChunkBox<T> {
    fn drop(&mut self) {
        // SAFETY: the value was written in `ChunkSlot::fill` and is dropped
        // exactly once, before its chunk goes back to the allocator.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            self.allocator.free(self.ptr.as_ptr().cast());
        }
    }
}
