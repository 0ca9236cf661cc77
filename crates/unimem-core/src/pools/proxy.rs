//! Pass-through pool.
//!
//! Every allocation is one provider allocation and every free one provider
//! free. The pool keeps no per-allocation metadata, so frees pass size `0`
//! and `malloc_usable_size` reports `NotSupported`.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::error::{MemError, MemResult};
use crate::ops::PoolOps;
use crate::pool::MemoryPoolOps;
use crate::provider::MemoryProvider;

thread_local! {
    static LAST_ALLOCATION_ERROR: Cell<Option<MemError>> = const { Cell::new(None) };
}

/// Ops table of the proxy pool. It takes no params.
pub static PROXY_POOL_OPS: PoolOps<()> = PoolOps::new(proxy_pool_initialize);

fn proxy_pool_initialize(
    _provider: &MemoryProvider,
    _params: (),
) -> MemResult<Box<dyn MemoryPoolOps>> {
    Ok(Box::new(ProxyPool))
}

struct ProxyPool;

/// Remember the outcome of an allocation for `last_allocation_error`.
fn note<T>(result: MemResult<T>) -> MemResult<T> {
    LAST_ALLOCATION_ERROR.with(|slot| slot.set(result.as_ref().err().copied()));
    result
}

impl MemoryPoolOps for ProxyPool {
    fn malloc(&self, provider: &MemoryProvider, size: usize) -> MemResult<NonNull<u8>> {
        note(provider.alloc(size, 0))
    }

    fn calloc(&self, provider: &MemoryProvider, num: usize, size: usize) -> MemResult<NonNull<u8>> {
        let Some(total) = num.checked_mul(size) else {
            return note(Err(MemError::InvalidArgument));
        };
        let ptr = note(provider.alloc(total, 0))?;
        // SAFETY: the provider just returned `total` writable bytes.
        unsafe { ptr.as_ptr().write_bytes(0, total) };
        Ok(ptr)
    }

    unsafe fn realloc(
        &self,
        _provider: &MemoryProvider,
        _ptr: *mut u8,
        _size: usize,
    ) -> MemResult<NonNull<u8>> {
        note(Err(MemError::NotSupported))
    }

    fn aligned_malloc(
        &self,
        provider: &MemoryProvider,
        size: usize,
        alignment: usize,
    ) -> MemResult<NonNull<u8>> {
        note(provider.alloc(size, alignment))
    }

    unsafe fn free(&self, provider: &MemoryProvider, ptr: *mut u8) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        unsafe { provider.free(ptr, 0) }
    }

    fn last_allocation_error(&self) -> MemResult<()> {
        LAST_ALLOCATION_ERROR.with(Cell::get).map_or(Ok(()), Err)
    }
}
