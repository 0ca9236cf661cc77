//! Allocation-tracking provider wrapper.
//!
//! Every live allocation made through a tracking provider is recorded in a
//! [`MemoryTracker`] keyed by base address, so any pointer into a tracked
//! allocation can be resolved back to its base, size and owner tag. The
//! tracker never changes upstream behaviour: bookkeeping failures are
//! logged and the upstream result is returned as is.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::error::{MemError, MemResult};
use crate::ops::ProviderOps;
use crate::provider::{MemoryProvider, MemoryProviderOps, NativeError};

/// One live allocation known to a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedAllocation {
    pub base: usize,
    pub size: usize,
    /// Caller-chosen owner tag, typically a pool id.
    pub tag: u64,
}

impl TrackedAllocation {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size.max(1)
    }
}

/// Ordered map of live allocations.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    entries: RwLock<BTreeMap<usize, TrackedAllocation>>,
    // Serializes split/merge so validation and update see one state.
    split_merge: Mutex<()>,
}

impl MemoryTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, base: usize, size: usize, tag: u64) -> MemResult<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(&base) {
            return Err(MemError::Unknown);
        }
        entries.insert(base, TrackedAllocation { base, size, tag });
        Ok(())
    }

    fn remove(&self, base: usize) -> MemResult<TrackedAllocation> {
        self.entries.write().remove(&base).ok_or(MemError::Unknown)
    }

    /// Entry whose base is exactly `ptr`.
    #[must_use]
    pub fn get(&self, ptr: *const u8) -> Option<TrackedAllocation> {
        self.entries.read().get(&(ptr as usize)).copied()
    }

    /// Entry containing `ptr`, which may point anywhere inside it.
    #[must_use]
    pub fn find(&self, ptr: *const u8) -> Option<TrackedAllocation> {
        let addr = ptr as usize;
        self.entries
            .read()
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| *entry)
            .filter(|entry| entry.contains(addr))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Bytes tracked under `tag`.
    #[must_use]
    pub fn tracked_bytes(&self, tag: u64) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.tag == tag)
            .map(|entry| entry.size)
            .sum()
    }
}

/// The process-wide tracker used when params name no other.
#[must_use]
pub fn global_tracker() -> Arc<MemoryTracker> {
    static TRACKER: OnceLock<Arc<MemoryTracker>> = OnceLock::new();
    Arc::clone(TRACKER.get_or_init(|| Arc::new(MemoryTracker::new())))
}

/// Creation params of the tracking provider.
pub struct TrackingProviderParams {
    /// Destroyed together with the tracking provider.
    pub upstream: MemoryProvider,
    pub tag: u64,
    pub tracker: Arc<MemoryTracker>,
}

impl TrackingProviderParams {
    /// Params recording into the process-wide tracker.
    #[must_use]
    pub fn new(upstream: MemoryProvider, tag: u64) -> Self {
        Self {
            upstream,
            tag,
            tracker: global_tracker(),
        }
    }
}

/// Ops table of the tracking provider.
pub static TRACKING_PROVIDER_OPS: ProviderOps<TrackingProviderParams> =
    ProviderOps::new(tracking_provider_initialize);

fn tracking_provider_initialize(
    params: TrackingProviderParams,
) -> MemResult<Box<dyn MemoryProviderOps>> {
    Ok(Box::new(TrackingProvider {
        upstream: params.upstream,
        tag: params.tag,
        tracker: params.tracker,
    }))
}

struct TrackingProvider {
    upstream: MemoryProvider,
    tag: u64,
    tracker: Arc<MemoryTracker>,
}

impl MemoryProviderOps for TrackingProvider {
    fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        let ptr = self.upstream.alloc(size, alignment)?;
        if let Err(err) = self.tracker.add(ptr.as_ptr() as usize, size, self.tag) {
            warn!(ptr = ?ptr, size, %err, "failed to track allocation");
        }
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        let removed = if ptr.is_null() {
            None
        } else {
            match self.tracker.remove(ptr as usize) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(ptr = ?ptr, %err, "freeing an untracked allocation");
                    None
                }
            }
        };

        // SAFETY: forwarded caller contract.
        let result = unsafe { self.upstream.free(ptr, size) };
        if let (Err(_), Some(entry)) = (&result, removed) {
            if let Err(err) = self.tracker.add(entry.base, entry.size, entry.tag) {
                warn!(ptr = ?ptr, %err, "failed to restore tracking after upstream free failed");
            }
        }
        result
    }

    fn last_native_error(&self) -> NativeError {
        self.upstream.last_native_error()
    }

    fn name(&self) -> &'static str {
        self.upstream.name()
    }

    fn recommended_page_size(&self, size: usize) -> MemResult<usize> {
        self.upstream.recommended_page_size(size)
    }

    fn min_page_size(&self, ptr: *const u8) -> MemResult<usize> {
        self.upstream.min_page_size(ptr)
    }

    unsafe fn purge_lazy(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.purge_lazy(ptr, size) }
    }

    unsafe fn purge_force(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.purge_force(ptr, size) }
    }

    unsafe fn allocation_split(
        &self,
        ptr: *mut u8,
        total_size: usize,
        first_size: usize,
    ) -> MemResult<()> {
        if first_size == 0 || first_size >= total_size {
            return Err(MemError::InvalidArgument);
        }
        let _guard = self.tracker.split_merge.lock();
        let base = ptr as usize;
        match self.tracker.get(ptr) {
            Some(entry) if entry.size == total_size => {}
            Some(entry) => {
                warn!(ptr = ?ptr, tracked = entry.size, total_size, "split size mismatch");
                return Err(MemError::InvalidArgument);
            }
            None => {
                warn!(ptr = ?ptr, "split of an untracked allocation");
                return Err(MemError::InvalidArgument);
            }
        }

        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.allocation_split(ptr, total_size, first_size) }?;

        let mut entries = self.tracker.entries.write();
        let high = base + first_size;
        entries.insert(
            high,
            TrackedAllocation {
                base: high,
                size: total_size - first_size,
                tag: self.tag,
            },
        );
        if let Some(low) = entries.get_mut(&base) {
            low.size = first_size;
        }
        Ok(())
    }

    unsafe fn allocation_merge(
        &self,
        low: *mut u8,
        high: *mut u8,
        total_size: usize,
    ) -> MemResult<()> {
        let _guard = self.tracker.split_merge.lock();
        let (Some(low_entry), Some(high_entry)) = (self.tracker.get(low), self.tracker.get(high))
        else {
            warn!(low = ?low, high = ?high, "merge of an untracked allocation");
            return Err(MemError::InvalidArgument);
        };
        if low_entry.base + low_entry.size != high_entry.base
            || low_entry.size + high_entry.size != total_size
        {
            warn!(
                low = ?low,
                high = ?high,
                low_size = low_entry.size,
                high_size = high_entry.size,
                total_size,
                "merge of non-adjacent or mis-sized allocations"
            );
            return Err(MemError::InvalidArgument);
        }

        // SAFETY: forwarded caller contract.
        unsafe { self.upstream.allocation_merge(low, high, total_size) }?;

        let mut entries = self.tracker.entries.write();
        entries.remove(&high_entry.base);
        if let Some(entry) = entries.get_mut(&low_entry.base) {
            entry.size = total_size;
        }
        Ok(())
    }
}
