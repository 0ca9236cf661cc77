//! Memory providers.
//!
//! A provider is the lowest layer: it obtains coarse-grained memory from
//! some source (OS mappings, a device, another provider) and gives it back.
//! Variants implement [`MemoryProviderOps`]; callers hold a
//! [`MemoryProvider`] handle that dispatches to the variant and records
//! failures in the calling thread's last-failure slot.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::error::{MemError, MemResult};
use crate::last_failure;
use crate::ops::ProviderOps;
use crate::record::{ChunkBox, check_ops_version};

/// Variant-defined detail about a provider's most recent failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeError {
    /// Variant-defined code; `0` when nothing failed yet.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl NativeError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Operation set of a memory provider variant.
///
/// Only `alloc`, `free`, `last_native_error` and `name` are mandatory; the
/// rest report [`MemError::NotSupported`] unless overridden. Dropping the
/// variant object finalizes it.
pub trait MemoryProviderOps: Send + Sync {
    /// Allocate `size` bytes aligned to `alignment` (`0` means the
    /// variant's natural alignment).
    fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>>;

    /// Release memory obtained from `alloc`. `size` may be `0` when the
    /// caller does not know it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this provider's `alloc` and not be in use.
    unsafe fn free(&self, ptr: *mut u8, size: usize) -> MemResult<()>;

    /// Detail about the most recent variant-specific failure.
    fn last_native_error(&self) -> NativeError;

    fn name(&self) -> &'static str;

    fn recommended_page_size(&self, _size: usize) -> MemResult<usize> {
        Err(MemError::NotSupported)
    }

    fn min_page_size(&self, _ptr: *const u8) -> MemResult<usize> {
        Err(MemError::NotSupported)
    }

    /// # Safety
    ///
    /// `[ptr, ptr + size)` must be memory of this provider that the caller
    /// owns; its contents may become unspecified.
    unsafe fn purge_lazy(&self, _ptr: *mut u8, _size: usize) -> MemResult<()> {
        Err(MemError::NotSupported)
    }

    /// # Safety
    ///
    /// As [`purge_lazy`](Self::purge_lazy); contents are discarded.
    unsafe fn purge_force(&self, _ptr: *mut u8, _size: usize) -> MemResult<()> {
        Err(MemError::NotSupported)
    }

    /// Split one allocation of `total_size` at `first_size` into two.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this provider of `total_size`.
    unsafe fn allocation_split(
        &self,
        _ptr: *mut u8,
        _total_size: usize,
        _first_size: usize,
    ) -> MemResult<()> {
        Err(MemError::NotSupported)
    }

    /// Merge two adjacent allocations into one of `total_size`.
    ///
    /// # Safety
    ///
    /// `low` and `high` must be adjacent live allocations of this provider.
    unsafe fn allocation_merge(
        &self,
        _low: *mut u8,
        _high: *mut u8,
        _total_size: usize,
    ) -> MemResult<()> {
        Err(MemError::NotSupported)
    }
}

/// Process-unique identity of a provider handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(u64);

impl ProviderId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider#{}", self.0)
    }
}

struct ProviderRecord {
    variant: Box<dyn MemoryProviderOps>,
    id: ProviderId,
}

/// Owning handle to a memory provider.
///
/// Dropping the handle finalizes the variant and releases the handle
/// record. Any number of threads may call through a shared reference.
pub struct MemoryProvider {
    record: ChunkBox<ProviderRecord>,
}

impl MemoryProvider {
    /// Create a provider from a variant's ops table and params.
    ///
    /// Fails with `InvalidArgument` on a version mismatch, with
    /// `OutOfHostMemory` when no handle record can be allocated, and
    /// otherwise with whatever the variant's `initialize` returned.
    pub fn create<P>(ops: &ProviderOps<P>, params: P) -> MemResult<Self> {
        check_ops_version("provider", ops.version)?;
        let id = ProviderId::next();
        let record = ChunkBox::try_new_with(|| {
            let variant = (ops.initialize)(params)?;
            Ok(ProviderRecord { variant, id })
        })?;
        debug!(provider = id.get(), "memory provider created");
        Ok(Self { record })
    }

    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.record.get().id
    }

    fn variant(&self) -> &dyn MemoryProviderOps {
        self.record.get().variant.as_ref()
    }

    fn track<T>(&self, result: MemResult<T>) -> MemResult<T> {
        if result.is_err() {
            last_failure::record_provider_failure(self.id());
        }
        result
    }

    pub fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        self.track(self.variant().alloc(size, alignment))
    }

    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) on this provider and not
    /// be in use.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.variant().free(ptr, size) };
        self.track(result)
    }

    #[must_use]
    pub fn last_native_error(&self) -> NativeError {
        self.variant().last_native_error()
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.variant().name()
    }

    pub fn recommended_page_size(&self, size: usize) -> MemResult<usize> {
        self.track(self.variant().recommended_page_size(size))
    }

    pub fn min_page_size(&self, ptr: *const u8) -> MemResult<usize> {
        self.track(self.variant().min_page_size(ptr))
    }

    /// # Safety
    ///
    /// See [`MemoryProviderOps::purge_lazy`].
    pub unsafe fn purge_lazy(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.variant().purge_lazy(ptr, size) };
        self.track(result)
    }

    /// # Safety
    ///
    /// See [`MemoryProviderOps::purge_force`].
    pub unsafe fn purge_force(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.variant().purge_force(ptr, size) };
        self.track(result)
    }

    /// # Safety
    ///
    /// See [`MemoryProviderOps::allocation_split`].
    pub unsafe fn allocation_split(
        &self,
        ptr: *mut u8,
        total_size: usize,
        first_size: usize,
    ) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.variant().allocation_split(ptr, total_size, first_size) };
        self.track(result)
    }

    /// # Safety
    ///
    /// See [`MemoryProviderOps::allocation_merge`].
    pub unsafe fn allocation_merge(
        &self,
        low: *mut u8,
        high: *mut u8,
        total_size: usize,
    ) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.variant().allocation_merge(low, high, total_size) };
        self.track(result)
    }
}

impl Drop for MemoryProvider {
    fn drop(&mut self) {
        debug!(provider = self.id().get(), "memory provider destroyed");
    }
}

impl fmt::Debug for MemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}
