//! Built-in memory provider variants.

pub mod null;
pub mod os;
pub mod trace;
pub mod tracking;

pub use null::NULL_MEMORY_PROVIDER_OPS;
pub use os::{
    OS_MEMORY_PROVIDER_OPS, OsMemoryProviderParams, OsNativeError, Protection, Visibility,
};
pub use trace::{TRACE_PROVIDER_OPS, TraceObserver, TraceProviderParams};
pub use tracking::{
    MemoryTracker, TRACKING_PROVIDER_OPS, TrackedAllocation, TrackingProviderParams,
    global_tracker,
};
