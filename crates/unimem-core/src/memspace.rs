//! Entry points for memspace collaborators.
//!
//! A memspace picks a provider variant for a set of memory targets and
//! needs only two things from the framework: turning its choice into a
//! provider, and building a pool that owns that provider.

use tracing::debug;

use crate::error::MemResult;
use crate::ops::{PoolOps, ProviderOps};
use crate::pool::{MemoryPool, PoolCreateFlags};
use crate::provider::MemoryProvider;

/// A provider variant chosen for a memory target, with its params.
pub struct ProviderCandidate<P: 'static> {
    pub ops: &'static ProviderOps<P>,
    pub params: P,
}

impl<P: 'static> ProviderCandidate<P> {
    #[must_use]
    pub const fn new(ops: &'static ProviderOps<P>, params: P) -> Self {
        Self { ops, params }
    }
}

/// Instantiate the candidate's provider.
pub fn create_provider_from_candidate<P: 'static>(
    candidate: ProviderCandidate<P>,
) -> MemResult<MemoryProvider> {
    MemoryProvider::create(candidate.ops, candidate.params)
}

/// Instantiate the candidate's provider and a pool that owns it.
///
/// The provider exists only for the pool; if pool creation fails it is
/// taken back and destroyed before returning.
pub fn create_pool_from_candidate<P: 'static, Q>(
    pool_ops: &PoolOps<Q>,
    pool_params: Q,
    candidate: ProviderCandidate<P>,
) -> MemResult<MemoryPool<'static>> {
    let provider = create_provider_from_candidate(candidate)?;
    let provider_id = provider.id();
    let pool = MemoryPool::create(
        pool_ops,
        provider,
        pool_params,
        PoolCreateFlags::OWN_PROVIDER,
    )
    .map_err(|err| {
        let error = err.error;
        debug!(provider = provider_id.get(), %error, "memspace pool creation failed");
        drop(err.into_provider());
        error
    })?;
    debug!(
        pool = pool.id().get(),
        provider = provider_id.get(),
        "memspace pool created"
    );
    Ok(pool)
}
