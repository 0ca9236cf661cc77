//! # unimem-base
//!
//! Allocation substrate for the unimem framework's own metadata.
//!
//! Provider and pool handles must never be allocated from the memory they
//! manage, so every handle record lives in a chunk of a [`BaseAllocator`]:
//! a slab allocator that maps pages straight from the OS and hands out
//! chunks of one fixed size. A single process-wide instance with 128-byte
//! chunks is exposed through [`global_base_allocator`].

pub mod base_alloc;
pub mod config;
pub mod error;
pub mod global;
pub mod os;

pub use base_alloc::{BaseAllocStats, BaseAllocator, MIN_CHUNKS_PER_SLAB};
pub use config::{CheckLevel, check_level, checks_enabled};
pub use error::{BaseAllocError, BaseResult};
pub use global::{GLOBAL_CHUNK_SIZE, base_allocator_for, global_base_allocator};
