//! Provider that owns no memory.
//!
//! Useful as the descriptor provider of wrapper pools that never allocate
//! from it, and in tests. Zero-byte allocations succeed with a dangling,
//! suitably aligned pointer; anything larger fails.

use std::ptr::{self, NonNull};

use crate::error::{MemError, MemResult};
use crate::ops::ProviderOps;
use crate::provider::{MemoryProviderOps, NativeError};

/// Ops table of the null provider. It takes no params.
pub static NULL_MEMORY_PROVIDER_OPS: ProviderOps<()> = ProviderOps::new(null_provider_initialize);

fn null_provider_initialize(_params: ()) -> MemResult<Box<dyn MemoryProviderOps>> {
    Ok(Box::new(NullMemoryProvider))
}

struct NullMemoryProvider;

impl MemoryProviderOps for NullMemoryProvider {
    fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        if size != 0 {
            return Err(MemError::OutOfHostMemory);
        }
        let addr = alignment.max(1);
        NonNull::new(ptr::without_provenance_mut(addr)).ok_or(MemError::Unknown)
    }

    unsafe fn free(&self, _ptr: *mut u8, _size: usize) -> MemResult<()> {
        Ok(())
    }

    fn last_native_error(&self) -> NativeError {
        NativeError::default()
    }

    fn name(&self) -> &'static str {
        "null"
    }

    fn recommended_page_size(&self, _size: usize) -> MemResult<usize> {
        Ok(0)
    }

    fn min_page_size(&self, _ptr: *const u8) -> MemResult<usize> {
        Ok(0)
    }

    unsafe fn purge_lazy(&self, _ptr: *mut u8, _size: usize) -> MemResult<()> {
        Ok(())
    }

    unsafe fn purge_force(&self, _ptr: *mut u8, _size: usize) -> MemResult<()> {
        Ok(())
    }

    unsafe fn allocation_split(
        &self,
        _ptr: *mut u8,
        _total_size: usize,
        _first_size: usize,
    ) -> MemResult<()> {
        Ok(())
    }

    unsafe fn allocation_merge(
        &self,
        _low: *mut u8,
        _high: *mut u8,
        _total_size: usize,
    ) -> MemResult<()> {
        Ok(())
    }
}
