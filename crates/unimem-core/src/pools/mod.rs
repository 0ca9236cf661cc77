//! Built-in memory pool variants.

pub mod proxy;
pub mod trace;

pub use proxy::PROXY_POOL_OPS;
pub use trace::{TRACE_POOL_OPS, TracePoolParams};
