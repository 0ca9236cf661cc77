//! Fixed-chunk slab allocator.
//!
//! Each instance serves chunks of exactly one size. Memory comes straight
//! from the OS in slabs of at least [`MIN_CHUNKS_PER_SLAB`] chunks; free
//! chunks are threaded into an intrusive singly-linked list stored inside
//! the chunks themselves, so a free chunk costs no extra memory. Slabs are
//! only returned to the OS when the allocator is dropped.
//!
//! Thread-safe via a single `parking_lot::Mutex` around the slab state.

use std::mem;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::checks_enabled;
use crate::error::{BaseAllocError, BaseResult};
use crate::os;

/// Minimum number of chunks carved out of every slab.
pub const MIN_CHUNKS_PER_SLAB: usize = 128;

/// Chunks are pointer-aligned so the free-list link fits in any chunk.
const CHUNK_ALIGN: usize = mem::align_of::<usize>();

/// Free-list node, written into the first bytes of a free chunk.
#[repr(C)]
struct FreeChunk {
    next: Option<NonNull<FreeChunk>>,
}

/// Intrusive LIFO list of free chunks.
struct FreeList {
    head: Option<NonNull<FreeChunk>>,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: None }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Push `chunk` at the head.
    ///
    /// # Safety
    ///
    /// `chunk` must be a pointer-aligned, writable chunk of at least
    /// `size_of::<FreeChunk>()` bytes that nobody else uses.
    unsafe fn push(&mut self, chunk: NonNull<u8>) {
        let node = chunk.cast::<FreeChunk>();
        // SAFETY: caller hands over exclusive use of an aligned chunk.
        unsafe { node.as_ptr().write(FreeChunk { next: self.head }) };
        self.head = Some(node);
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = self.head?;
        // SAFETY: every node on the list was written by `push` and is not
        // handed out while linked.
        self.head = unsafe { node.as_ref().next };
        Some(node.cast())
    }

    /// Walk the list and count its nodes.
    fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            count += 1;
            // SAFETY: see `pop`.
            cursor = unsafe { node.as_ref().next };
        }
        count
    }
}

/// One OS mapping carved into chunks. Unmapped on drop.
struct Slab {
    base: NonNull<u8>,
    len: usize,
}

impl Slab {
    fn map(len: usize) -> BaseResult<Self> {
        let base =
            os::map_pages(len).map_err(|errno| BaseAllocError::OutOfMemory { len, errno })?;
        Ok(Self { base, len })
    }

    fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: the slab owns this mapping and its chunks are no longer
        // handed out once the owning allocator is gone.
        if let Err(errno) = unsafe { os::unmap_pages(self.base.as_ptr(), self.len) } {
            warn!(len = self.len, errno, "failed to unmap base allocator slab");
        }
    }
}

/// Mutable state guarded by the allocator mutex.
struct SlabState {
    /// Slab chain in creation order; the first entry is the main slab.
    slabs: Vec<Slab>,
    free_list: FreeList,
    /// Slabs linked so far, tracked separately from `slabs` for the
    /// structural check.
    n_slabs: usize,
    /// Chunks currently handed out.
    n_allocs: usize,
    /// Chunks ever carved.
    n_chunks: usize,
}

// SAFETY: the raw pointers in `SlabState` point into mappings owned by the
// same state; moving the state between threads moves that ownership too.
unsafe impl Send for SlabState {}

impl SlabState {
    /// Link `slab` into the chain and push all its chunks onto the free list.
    fn adopt(&mut self, slab: Slab, chunk_size: usize) {
        let count = slab.len / chunk_size;
        let base = slab.base.as_ptr();
        // Push in reverse so the lowest address ends up at the head.
        for index in (0..count).rev() {
            // SAFETY: `index * chunk_size + chunk_size <= slab.len`, the slab
            // is page-aligned and `chunk_size` is a multiple of CHUNK_ALIGN.
            unsafe {
                let chunk = NonNull::new_unchecked(base.add(index * chunk_size));
                self.free_list.push(chunk);
            }
        }
        self.slabs.push(slab);
        self.n_slabs += 1;
        self.n_chunks += count;
    }

    fn owns(&self, addr: usize) -> bool {
        self.slabs.iter().any(|slab| slab.contains(addr))
    }

    fn check_consistency(&self) {
        let free = self.free_list.len();
        assert_eq!(
            free,
            self.n_chunks - self.n_allocs,
            "base allocator free list out of sync: {free} free, {} carved, {} allocated",
            self.n_chunks,
            self.n_allocs,
        );
        assert_eq!(
            self.slabs.len(),
            self.n_slabs,
            "base allocator slab chain out of sync"
        );
    }
}

/// Snapshot of allocator bookkeeping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BaseAllocStats {
    /// Slabs currently mapped.
    pub slabs: usize,
    /// Chunks carved across all slabs.
    pub chunks: usize,
    /// Chunks currently handed out.
    pub allocated: usize,
}

impl BaseAllocStats {
    /// Chunks available without mapping a new slab.
    #[must_use]
    pub const fn free(&self) -> usize {
        self.chunks - self.allocated
    }
}

/// Thread-safe fixed-size chunk allocator backed by OS slabs.
pub struct BaseAllocator {
    chunk_size: usize,
    slab_size: usize,
    state: Mutex<SlabState>,
}

impl BaseAllocator {
    /// Create an allocator for objects of `object_size` bytes and map its
    /// first slab.
    pub fn new(object_size: usize) -> BaseResult<Self> {
        let overflow = BaseAllocError::SizeOverflow { object_size };
        let chunk_size =
            os::checked_align_up(object_size.max(CHUNK_ALIGN), CHUNK_ALIGN).ok_or(overflow)?;
        let page = os::page_size();
        let slab_size = MIN_CHUNKS_PER_SLAB
            .checked_mul(chunk_size)
            .and_then(|bytes| os::checked_align_up(bytes.max(page), page))
            .ok_or(overflow)?;

        let mut state = SlabState {
            slabs: Vec::new(),
            free_list: FreeList::new(),
            n_slabs: 0,
            n_allocs: 0,
            n_chunks: 0,
        };
        state.adopt(Slab::map(slab_size)?, chunk_size);
        debug!(
            chunk_size,
            slab_size,
            chunks = state.n_chunks,
            "base allocator created"
        );

        Ok(Self {
            chunk_size,
            slab_size,
            state: Mutex::new(state),
        })
    }

    /// Size of every chunk handed out by this allocator.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Size of every slab mapped by this allocator.
    #[must_use]
    pub const fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Chunks carved out of one slab.
    #[must_use]
    pub const fn chunks_per_slab(&self) -> usize {
        self.slab_size / self.chunk_size
    }

    /// Hand out one chunk, growing by a slab if none is free.
    ///
    /// Returns `None` only when the free list was empty and the OS refused
    /// a new slab. Chunk contents are unspecified.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        if state.free_list.is_empty() {
            match Slab::map(self.slab_size) {
                Ok(slab) => {
                    state.adopt(slab, self.chunk_size);
                    debug!(
                        chunk_size = self.chunk_size,
                        slabs = state.n_slabs,
                        "base allocator grew by one slab"
                    );
                }
                Err(err) => {
                    warn!(%err, chunk_size = self.chunk_size, "base allocator cannot grow");
                    return None;
                }
            }
        }
        let chunk = state.free_list.pop()?;
        state.n_allocs += 1;
        if checks_enabled() {
            state.check_consistency();
        }
        Some(chunk)
    }

    /// Return a chunk to the free list. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a chunk obtained from [`alloc`](Self::alloc)
    /// on this same allocator that has not been freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(chunk) = NonNull::new(ptr) else {
            return;
        };
        let mut state = self.state.lock();
        let checks = checks_enabled();
        if checks {
            assert!(
                state.owns(chunk.as_ptr() as usize),
                "pointer {chunk:p} was not allocated by this base allocator"
            );
            assert!(state.n_allocs > 0, "base allocator double free of {chunk:p}");
        }
        // SAFETY: the caller returns a chunk of ours that is no longer used.
        unsafe { state.free_list.push(chunk) };
        state.n_allocs -= 1;
        if checks {
            state.check_consistency();
        }
    }

    /// Whether `ptr` lies inside one of this allocator's slabs.
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.state.lock().owns(ptr as usize)
    }

    /// Current bookkeeping counters.
    #[must_use]
    pub fn stats(&self) -> BaseAllocStats {
        let state = self.state.lock();
        BaseAllocStats {
            slabs: state.n_slabs,
            chunks: state.n_chunks,
            allocated: state.n_allocs,
        }
    }

    /// Count free chunks by walking the free list.
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        self.state.lock().free_list.len()
    }
}

impl Drop for BaseAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug_assert_eq!(
            state.n_allocs, 0,
            "base allocator dropped with outstanding chunks"
        );
        if checks_enabled() {
            state.check_consistency();
        }
        debug!(
            chunk_size = self.chunk_size,
            slabs = state.n_slabs,
            "base allocator destroyed"
        );
    }
}

impl std::fmt::Debug for BaseAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseAllocator")
            .field("chunk_size", &self.chunk_size)
            .field("slab_size", &self.slab_size)
            .field("stats", &self.stats())
            .finish()
    }
}
