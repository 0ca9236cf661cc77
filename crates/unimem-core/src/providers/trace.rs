//! Tracing provider wrapper.
//!
//! Forwards every operation to an upstream provider it owns, unchanged,
//! and reports the operation name to an observer first.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::trace;

use crate::error::MemResult;
use crate::ops::ProviderOps;
use crate::provider::{MemoryProvider, MemoryProviderOps, NativeError};

/// Callback receiving the name of each forwarded operation.
pub type TraceObserver = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Creation params of the trace provider.
pub struct TraceProviderParams {
    /// Destroyed together with the trace provider.
    pub upstream: MemoryProvider,
    pub observer: TraceObserver,
}

/// Ops table of the trace provider.
pub static TRACE_PROVIDER_OPS: ProviderOps<TraceProviderParams> =
    ProviderOps::new(trace_provider_initialize);

fn trace_provider_initialize(params: TraceProviderParams) -> MemResult<Box<dyn MemoryProviderOps>> {
    Ok(Box::new(TraceProvider {
        upstream: params.upstream,
        observer: params.observer,
    }))
}

struct TraceProvider {
    upstream: MemoryProvider,
    observer: TraceObserver,
}

impl TraceProvider {
    fn note(&self, op: &'static str) {
        trace!(op, upstream = self.upstream.id().get(), "trace provider");
        (self.observer)(op);
    }
}

impl MemoryProviderOps for TraceProvider {
    fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        self.note("alloc");
        self.upstream.alloc(size, alignment)
    }

    unsafe fn free(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        self.note("free");
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.free(ptr, size) }
    }

    fn last_native_error(&self) -> NativeError {
        self.note("get_last_native_error");
        self.upstream.last_native_error()
    }

    fn name(&self) -> &'static str {
        self.note("get_name");
        self.upstream.name()
    }

    fn recommended_page_size(&self, size: usize) -> MemResult<usize> {
        self.note("get_recommended_page_size");
        self.upstream.recommended_page_size(size)
    }

    fn min_page_size(&self, ptr: *const u8) -> MemResult<usize> {
        self.note("get_min_page_size");
        self.upstream.min_page_size(ptr)
    }

    unsafe fn purge_lazy(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        self.note("purge_lazy");
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.purge_lazy(ptr, size) }
    }

    unsafe fn purge_force(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        self.note("purge_force");
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.purge_force(ptr, size) }
    }

    unsafe fn allocation_split(
        &self,
        ptr: *mut u8,
        total_size: usize,
        first_size: usize,
    ) -> MemResult<()> {
        self.note("allocation_split");
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.allocation_split(ptr, total_size, first_size) }
    }

    unsafe fn allocation_merge(
        &self,
        low: *mut u8,
        high: *mut u8,
        total_size: usize,
    ) -> MemResult<()> {
        self.note("allocation_merge");
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.allocation_merge(low, high, total_size) }
    }
}
