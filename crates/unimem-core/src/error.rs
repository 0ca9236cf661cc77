//! Framework-wide error codes.

use thiserror::Error;
use unimem_base::BaseAllocError;

/// Failure categories shared by providers, pools and the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum MemError {
    /// Host memory for the request or for framework metadata ran out.
    #[error("out of host memory")]
    OutOfHostMemory,
    /// Provider-defined failure; details via the provider's last native error.
    #[error("memory provider specific error")]
    ProviderSpecific,
    /// A parameter, flag combination or ops-table version was rejected.
    #[error("invalid argument")]
    InvalidArgument,
    /// The variant does not implement the requested operation.
    #[error("operation not supported")]
    NotSupported,
    /// Anything that fits no other category.
    #[error("unknown error")]
    Unknown,
}

impl MemError {
    /// Stable numeric code, `0` being reserved for success.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OutOfHostMemory => 1,
            Self::ProviderSpecific => 2,
            Self::InvalidArgument => 3,
            Self::NotSupported => 5,
            Self::Unknown => 0x7fff_fffe,
        }
    }

    /// Numeric code of a result, success included.
    #[must_use]
    pub fn code_of<T>(result: &MemResult<T>) -> i32 {
        result.as_ref().map_or_else(|err| err.code(), |_| 0)
    }
}

impl From<BaseAllocError> for MemError {
    fn from(_: BaseAllocError) -> Self {
        Self::OutOfHostMemory
    }
}

/// Result alias used across the crate.
pub type MemResult<T> = Result<T, MemError>;
