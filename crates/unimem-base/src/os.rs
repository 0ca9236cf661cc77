//! OS page primitives.
//!
//! Typed wrappers over `mmap`, `munmap`, `madvise` and `sysconf`. Every
//! fallible call returns `Err(errno)` instead of touching a global error
//! slot, so callers decide how the failure is reported.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The system page size, queried once and cached.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = usize::try_from(raw)
        .ok()
        .filter(|s| s.is_power_of_two())
        .unwrap_or(FALLBACK_PAGE_SIZE);
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` when the rounded value does not fit in `usize`.
#[must_use]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Errno of the last failed libc call on this thread.
#[must_use]
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

/// Map `len` bytes of anonymous memory with the given `PROT_*` and
/// `MAP_*` bits. `MAP_ANONYMOUS` is always added.
pub fn map_anonymous(len: usize, prot: i32, flags: i32) -> Result<NonNull<u8>, i32> {
    // SAFETY: anonymous mapping with no fixed address and no backing fd
    // cannot alias any existing Rust object.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            prot,
            flags | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(last_errno());
    }
    NonNull::new(addr.cast::<u8>()).ok_or(libc::ENOMEM)
}

/// Map `len` private read/write pages.
pub fn map_pages(len: usize) -> Result<NonNull<u8>, i32> {
    map_anonymous(len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE)
}

/// Unmap `[addr, addr + len)`.
///
/// # Safety
///
/// The range must be page-aligned, mapped, and no live Rust reference may
/// point into it.
pub unsafe fn unmap_pages(addr: *mut u8, len: usize) -> Result<(), i32> {
    // SAFETY: caller guarantees the range is an unreferenced mapping.
    let ret = unsafe { libc::munmap(addr.cast(), len) };
    if ret == 0 { Ok(()) } else { Err(last_errno()) }
}

/// Give the kernel `advice` about `[addr, addr + len)`.
///
/// # Safety
///
/// The range must be page-aligned and mapped. Advice such as
/// `MADV_DONTNEED` discards contents, so the caller must own the data.
pub unsafe fn advise(addr: *mut u8, len: usize, advice: i32) -> Result<(), i32> {
    // SAFETY: caller guarantees the range is mapped and owned.
    let ret = unsafe { libc::madvise(addr.cast(), len, advice) };
    if ret == 0 { Ok(()) } else { Err(last_errno()) }
}
