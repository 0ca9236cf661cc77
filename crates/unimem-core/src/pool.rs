//! Memory pools.
//!
//! A pool hands out fine-grained allocations carved from memory of the
//! provider it was created with. Variants implement [`MemoryPoolOps`];
//! callers hold a [`MemoryPool`] handle. Whether the pool owns its
//! provider is fixed at creation: an owned provider is destroyed with the
//! pool, a borrowed one must simply outlive it.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{MemError, MemResult};
use crate::last_failure;
use crate::ops::PoolOps;
use crate::provider::MemoryProvider;
use crate::record::{ChunkBox, check_ops_version};

bitflags! {
    /// Pool creation flags. Every undefined bit is reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PoolCreateFlags: u32 {
        /// The pool takes ownership of its provider.
        const OWN_PROVIDER = 1 << 0;
    }
}

/// Operation set of a memory pool variant.
///
/// Every method receives the pool's provider. Only `malloc`, `free` and
/// `last_allocation_error` are mandatory.
pub trait MemoryPoolOps: Send + Sync {
    fn malloc(&self, provider: &MemoryProvider, size: usize) -> MemResult<NonNull<u8>>;

    fn calloc(&self, _provider: &MemoryProvider, _num: usize, _size: usize) -> MemResult<NonNull<u8>> {
        Err(MemError::NotSupported)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this pool.
    unsafe fn realloc(
        &self,
        _provider: &MemoryProvider,
        _ptr: *mut u8,
        _size: usize,
    ) -> MemResult<NonNull<u8>> {
        Err(MemError::NotSupported)
    }

    fn aligned_malloc(
        &self,
        _provider: &MemoryProvider,
        _size: usize,
        _alignment: usize,
    ) -> MemResult<NonNull<u8>> {
        Err(MemError::NotSupported)
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool.
    unsafe fn malloc_usable_size(&self, _provider: &MemoryProvider, _ptr: *const u8) -> MemResult<usize> {
        Err(MemError::NotSupported)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this pool, not used after
    /// the call.
    unsafe fn free(&self, provider: &MemoryProvider, ptr: *mut u8) -> MemResult<()>;

    /// Status of the most recent allocation made through this variant.
    fn last_allocation_error(&self) -> MemResult<()>;
}

/// Process-unique identity of a pool handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// The provider slot of a pool.
#[derive(Debug)]
pub enum PoolProvider<'p> {
    /// Destroyed together with the pool.
    Owned(MemoryProvider),
    /// Must outlive the pool; left alone on pool destruction.
    Borrowed(&'p MemoryProvider),
}

impl PoolProvider<'_> {
    #[must_use]
    pub fn get(&self) -> &MemoryProvider {
        match self {
            Self::Owned(provider) => provider,
            Self::Borrowed(provider) => provider,
        }
    }

    #[must_use]
    pub const fn is_owned(&self) -> bool {
        matches!(self, Self::Owned(_))
    }
}

impl From<MemoryProvider> for PoolProvider<'static> {
    fn from(provider: MemoryProvider) -> Self {
        Self::Owned(provider)
    }
}

impl<'p> From<&'p MemoryProvider> for PoolProvider<'p> {
    fn from(provider: &'p MemoryProvider) -> Self {
        Self::Borrowed(provider)
    }
}

/// Failed [`MemoryPool::create`].
///
/// Carries the provider back to the caller when it was passed by value.
#[derive(Debug, Error)]
#[error("pool creation failed: {error}")]
pub struct PoolCreateError {
    pub error: MemError,
    pub provider: Option<MemoryProvider>,
}

impl PoolCreateError {
    fn new(error: MemError, provider: PoolProvider<'_>) -> Self {
        let provider = match provider {
            PoolProvider::Owned(provider) => Some(provider),
            PoolProvider::Borrowed(_) => None,
        };
        Self { error, provider }
    }

    /// Take back the provider handed to `create` by value.
    #[must_use]
    pub fn into_provider(self) -> Option<MemoryProvider> {
        self.provider
    }
}

impl From<PoolCreateError> for MemError {
    fn from(err: PoolCreateError) -> Self {
        err.error
    }
}

// Field order is drop order: variant, then the provider it may still use.
struct PoolRecord<'p> {
    variant: Box<dyn MemoryPoolOps>,
    provider: PoolProvider<'p>,
    id: PoolId,
}

/// Owning handle to a memory pool.
///
/// Dropping the handle finalizes the variant, then destroys an owned
/// provider, then releases the handle record.
pub struct MemoryPool<'p> {
    record: ChunkBox<PoolRecord<'p>>,
}

impl<'p> MemoryPool<'p> {
    /// Create a pool over `provider`.
    ///
    /// `flags` must contain [`PoolCreateFlags::OWN_PROVIDER`] exactly when
    /// the provider is passed by value, and no reserved bits; otherwise
    /// `InvalidArgument`. A failed call has no effect on the provider: an
    /// owned one comes back inside the [`PoolCreateError`].
    pub fn create<P>(
        ops: &PoolOps<P>,
        provider: impl Into<PoolProvider<'p>>,
        params: P,
        flags: PoolCreateFlags,
    ) -> Result<Self, PoolCreateError> {
        let provider = provider.into();
        if let Err(error) = Self::check_create_args(ops, &provider, flags) {
            return Err(PoolCreateError::new(error, provider));
        }

        let slot = match ChunkBox::<PoolRecord<'p>>::reserve() {
            Ok(slot) => slot,
            Err(error) => return Err(PoolCreateError::new(error, provider)),
        };
        let variant = match (ops.initialize)(provider.get(), params) {
            Ok(variant) => variant,
            Err(error) => {
                debug!(%error, "pool initialize failed");
                return Err(PoolCreateError::new(error, provider));
            }
        };

        let id = PoolId::next();
        let record = slot.fill(PoolRecord {
            variant,
            provider,
            id,
        });
        debug!(
            pool = id.get(),
            provider = record.get().provider.get().id().get(),
            owns_provider = record.get().provider.is_owned(),
            "memory pool created"
        );
        Ok(Self { record })
    }

    fn check_create_args<P>(
        ops: &PoolOps<P>,
        provider: &PoolProvider<'_>,
        flags: PoolCreateFlags,
    ) -> MemResult<()> {
        if !PoolCreateFlags::all().contains(flags) {
            warn!(flags = flags.bits(), "reserved pool creation flags set");
            return Err(MemError::InvalidArgument);
        }
        if flags.contains(PoolCreateFlags::OWN_PROVIDER) != provider.is_owned() {
            warn!(
                flags = flags.bits(),
                owned = provider.is_owned(),
                "pool creation flags disagree with provider ownership"
            );
            return Err(MemError::InvalidArgument);
        }
        check_ops_version("pool", ops.version)
    }

    #[must_use]
    pub fn id(&self) -> PoolId {
        self.record.get().id
    }

    /// The provider this pool allocates from.
    #[must_use]
    pub fn memory_provider(&self) -> &MemoryProvider {
        self.record.get().provider.get()
    }

    #[must_use]
    pub fn owns_provider(&self) -> bool {
        self.record.get().provider.is_owned()
    }

    fn parts(&self) -> (&dyn MemoryPoolOps, &MemoryProvider) {
        let record = self.record.get();
        (record.variant.as_ref(), record.provider.get())
    }

    fn track<T>(&self, result: MemResult<T>) -> MemResult<T> {
        if result.is_err() {
            last_failure::record_pool_failure(self.id());
        }
        result
    }

    pub fn malloc(&self, size: usize) -> MemResult<NonNull<u8>> {
        let (variant, provider) = self.parts();
        self.track(variant.malloc(provider, size))
    }

    pub fn calloc(&self, num: usize, size: usize) -> MemResult<NonNull<u8>> {
        let (variant, provider) = self.parts();
        self.track(variant.calloc(provider, num, size))
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this pool.
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> MemResult<NonNull<u8>> {
        let (variant, provider) = self.parts();
        // SAFETY: forwarded caller contract.
        let result = unsafe { variant.realloc(provider, ptr, size) };
        self.track(result)
    }

    pub fn aligned_malloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        let (variant, provider) = self.parts();
        self.track(variant.aligned_malloc(provider, size, alignment))
    }

    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool.
    pub unsafe fn malloc_usable_size(&self, ptr: *const u8) -> MemResult<usize> {
        let (variant, provider) = self.parts();
        // SAFETY: forwarded caller contract.
        let result = unsafe { variant.malloc_usable_size(provider, ptr) };
        self.track(result)
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation of this pool, not used after
    /// the call.
    pub unsafe fn free(&self, ptr: *mut u8) -> MemResult<()> {
        let (variant, provider) = self.parts();
        // SAFETY: forwarded caller contract.
        let result = unsafe { variant.free(provider, ptr) };
        self.track(result)
    }

    /// Status of the most recent allocation through this pool's variant.
    ///
    /// This is a query: a stored error is reported, not recorded again as
    /// a failure of this call.
    pub fn last_allocation_error(&self) -> MemResult<()> {
        self.parts().0.last_allocation_error()
    }
}

impl Drop for MemoryPool<'_> {
    fn drop(&mut self) {
        debug!(
            pool = self.id().get(),
            owns_provider = self.owns_provider(),
            "memory pool destroyed"
        );
    }
}

impl fmt::Debug for MemoryPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("id", &self.id())
            .field("provider", &self.memory_provider().id())
            .field("owns_provider", &self.owns_provider())
            .finish()
    }
}
