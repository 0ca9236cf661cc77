//! Tracing pool wrapper.
//!
//! Forwards every operation to a wrapped pool it owns and reports the
//! operation name to an observer first. The provider the trace pool is
//! created with is only a descriptor; allocations go through the wrapped
//! pool and its own provider.

use std::ptr::NonNull;

use tracing::trace;

use crate::error::MemResult;
use crate::ops::PoolOps;
use crate::pool::{MemoryPool, MemoryPoolOps};
use crate::provider::MemoryProvider;
use crate::providers::trace::TraceObserver;

/// Creation params of the trace pool.
pub struct TracePoolParams {
    /// Destroyed together with the trace pool.
    pub pool: MemoryPool<'static>,
    pub observer: TraceObserver,
}

/// Ops table of the trace pool.
pub static TRACE_POOL_OPS: PoolOps<TracePoolParams> = PoolOps::new(trace_pool_initialize);

fn trace_pool_initialize(
    _provider: &MemoryProvider,
    params: TracePoolParams,
) -> MemResult<Box<dyn MemoryPoolOps>> {
    Ok(Box::new(TracePool {
        inner: params.pool,
        observer: params.observer,
    }))
}

struct TracePool {
    inner: MemoryPool<'static>,
    observer: TraceObserver,
}

impl TracePool {
    fn note(&self, op: &'static str) {
        trace!(op, pool = self.inner.id().get(), "trace pool");
        (self.observer)(op);
    }
}

impl MemoryPoolOps for TracePool {
    fn malloc(&self, _provider: &MemoryProvider, size: usize) -> MemResult<NonNull<u8>> {
        self.note("malloc");
        self.inner.malloc(size)
    }

    fn calloc(&self, _provider: &MemoryProvider, num: usize, size: usize) -> MemResult<NonNull<u8>> {
        self.note("calloc");
        self.inner.calloc(num, size)
    }

    unsafe fn realloc(
        &self,
        _provider: &MemoryProvider,
        ptr: *mut u8,
        size: usize,
    ) -> MemResult<NonNull<u8>> {
        self.note("realloc");
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.realloc(ptr, size) }
    }

    fn aligned_malloc(
        &self,
        _provider: &MemoryProvider,
        size: usize,
        alignment: usize,
    ) -> MemResult<NonNull<u8>> {
        self.note("aligned_malloc");
        self.inner.aligned_malloc(size, alignment)
    }

    unsafe fn malloc_usable_size(&self, _provider: &MemoryProvider, ptr: *const u8) -> MemResult<usize> {
        self.note("malloc_usable_size");
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.malloc_usable_size(ptr) }
    }

    unsafe fn free(&self, _provider: &MemoryProvider, ptr: *mut u8) -> MemResult<()> {
        self.note("free");
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.free(ptr) }
    }

    fn last_allocation_error(&self) -> MemResult<()> {
        self.note("get_last_allocation_error");
        self.inner.last_allocation_error()
    }
}
