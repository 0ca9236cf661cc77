//! Versioned operation tables.
//!
//! A variant registers itself with a table holding its `initialize`
//! entry point and the interface version it was written against. The
//! rest of the operation set is the trait object `initialize` returns;
//! finalization is that object's `Drop`.

use crate::error::MemResult;
use crate::pool::MemoryPoolOps;
use crate::provider::{MemoryProvider, MemoryProviderOps};

/// Packed `major << 16 | minor` interface version.
pub type OpsVersion = u32;

/// Pack a major/minor pair into an [`OpsVersion`].
#[must_use]
pub const fn make_ops_version(major: u16, minor: u16) -> OpsVersion {
    ((major as u32) << 16) | minor as u32
}

/// The only version accepted at handle creation.
pub const OPS_VERSION_CURRENT: OpsVersion = make_ops_version(0, 10);

/// Creates provider state from the variant's params.
pub type ProviderInitFn<P> = fn(P) -> MemResult<Box<dyn MemoryProviderOps>>;

/// Creates pool state from the pool's provider and the variant's params.
pub type PoolInitFn<P> = fn(&MemoryProvider, P) -> MemResult<Box<dyn MemoryPoolOps>>;

/// Operation table of a memory provider variant with params `P`.
pub struct ProviderOps<P> {
    pub version: OpsVersion,
    pub initialize: ProviderInitFn<P>,
}

impl<P> ProviderOps<P> {
    /// A table at the current interface version.
    #[must_use]
    pub const fn new(initialize: ProviderInitFn<P>) -> Self {
        Self {
            version: OPS_VERSION_CURRENT,
            initialize,
        }
    }
}

/// Operation table of a memory pool variant with params `P`.
pub struct PoolOps<P> {
    pub version: OpsVersion,
    pub initialize: PoolInitFn<P>,
}

impl<P> PoolOps<P> {
    /// A table at the current interface version.
    #[must_use]
    pub const fn new(initialize: PoolInitFn<P>) -> Self {
        Self {
            version: OPS_VERSION_CURRENT,
            initialize,
        }
    }
}
