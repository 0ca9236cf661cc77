//! Per-thread record of the last failing provider and pool.
//!
//! Every provider or pool operation that returns an error stores the
//! handle's id in the calling thread's slot. Success never clears a slot,
//! and other threads never see it. Provider and pool failures have
//! independent slots, so a pool call that failed because its provider
//! failed leaves both recorded.

use std::cell::Cell;

use crate::pool::PoolId;
use crate::provider::ProviderId;

thread_local! {
    static LAST_FAILED_PROVIDER: Cell<Option<ProviderId>> = const { Cell::new(None) };
    static LAST_FAILED_POOL: Cell<Option<PoolId>> = const { Cell::new(None) };
}

pub(crate) fn record_provider_failure(id: ProviderId) {
    LAST_FAILED_PROVIDER.with(|slot| slot.set(Some(id)));
}

pub(crate) fn record_pool_failure(id: PoolId) {
    LAST_FAILED_POOL.with(|slot| slot.set(Some(id)));
}

/// Id of the provider whose operation most recently failed on this thread.
///
/// The provider may have been destroyed since; compare the id against a
/// live handle's [`MemoryProvider::id`](crate::MemoryProvider::id).
#[must_use]
pub fn last_failed_provider() -> Option<ProviderId> {
    LAST_FAILED_PROVIDER.with(Cell::get)
}

/// Id of the pool whose operation most recently failed on this thread.
#[must_use]
pub fn last_failed_pool() -> Option<PoolId> {
    LAST_FAILED_POOL.with(Cell::get)
}
