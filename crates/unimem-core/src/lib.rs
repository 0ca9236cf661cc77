//! # unimem-core
//!
//! Pluggable memory management built from two layers:
//!
//! - **Memory providers** ([`MemoryProvider`]) obtain coarse memory from a
//!   source such as OS mappings.
//! - **Memory pools** ([`MemoryPool`]) serve fine-grained allocations from
//!   a provider.
//!
//! Both are opaque handles over a variant chosen at creation through a
//! versioned ops table ([`ProviderOps`], [`PoolOps`]). Handle records live
//! in the global base allocator of `unimem-base`, never in managed memory.
//! Every failing operation records the failing handle's id in a
//! per-thread registry ([`last_failed_provider`], [`last_failed_pool`]).
//!
//! Built-in variants: the OS, null, trace and tracking providers, and the
//! proxy and trace pools.

pub mod error;
pub mod last_failure;
pub mod memspace;
pub mod ops;
pub mod pool;
pub mod pools;
pub mod provider;
pub mod providers;
mod record;

pub use error::{MemError, MemResult};
pub use last_failure::{last_failed_pool, last_failed_provider};
pub use memspace::{ProviderCandidate, create_pool_from_candidate, create_provider_from_candidate};
pub use ops::{OPS_VERSION_CURRENT, OpsVersion, PoolOps, ProviderOps, make_ops_version};
pub use pool::{
    MemoryPool, MemoryPoolOps, PoolCreateError, PoolCreateFlags, PoolId, PoolProvider,
};
pub use provider::{MemoryProvider, MemoryProviderOps, NativeError, ProviderId};
