//! OS memory provider.
//!
//! Serves anonymous `mmap` regions. Alignments above the page size are
//! met by over-mapping `size + alignment` bytes and unmapping the slack on
//! both sides. Failures are reported as `ProviderSpecific`, with the
//! detail kept in the provider instance for `last_native_error`.

use std::ptr::NonNull;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::warn;
use unimem_base::os;

use crate::error::{MemError, MemResult};
use crate::ops::ProviderOps;
use crate::provider::{MemoryProviderOps, NativeError};

bitflags! {
    /// Page protection requested for OS provider mappings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// No access at all.
    pub const NONE: Self = Self::empty();

    fn to_prot(self) -> MemResult<i32> {
        if !Self::all().contains(self) {
            return Err(MemError::InvalidArgument);
        }
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        Ok(prot)
    }
}

/// Whether mappings are private to the process or shared with children.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    #[default]
    Private,
    Shared,
}

impl Visibility {
    const fn to_map_flags(self) -> i32 {
        match self {
            Self::Private => libc::MAP_PRIVATE,
            Self::Shared => libc::MAP_SHARED,
        }
    }
}

/// Creation params of the OS provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsMemoryProviderParams {
    pub protection: Protection,
    pub visibility: Visibility,
}

impl Default for OsMemoryProviderParams {
    fn default() -> Self {
        Self {
            protection: Protection::READ | Protection::WRITE,
            visibility: Visibility::Private,
        }
    }
}

/// Native error codes reported by the OS provider.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OsNativeError {
    #[default]
    Success = 0,
    AllocFailed = 1,
    AddressNotAligned = 2,
    FreeFailed = 3,
    PurgeLazyFailed = 4,
    PurgeForceFailed = 5,
}

impl OsNativeError {
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::AllocFailed => "memory allocation failed",
            Self::AddressNotAligned => "allocated address is not aligned",
            Self::FreeFailed => "memory deallocation failed",
            Self::PurgeLazyFailed => "lazy purging failed",
            Self::PurgeForceFailed => "force purging failed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LastError {
    kind: OsNativeError,
    errno: i32,
}

struct OsMemoryProvider {
    prot: i32,
    map_flags: i32,
    last_error: Mutex<LastError>,
}

/// Ops table of the OS provider.
pub static OS_MEMORY_PROVIDER_OPS: ProviderOps<OsMemoryProviderParams> =
    ProviderOps::new(os_provider_initialize);

fn os_provider_initialize(
    params: OsMemoryProviderParams,
) -> MemResult<Box<dyn MemoryProviderOps>> {
    let prot = params.protection.to_prot().inspect_err(|_| {
        warn!(
            bits = params.protection.bits(),
            "unknown protection bits for OS provider"
        );
    })?;
    Ok(Box::new(OsMemoryProvider {
        prot,
        map_flags: params.visibility.to_map_flags(),
        last_error: Mutex::new(LastError::default()),
    }))
}

/// Alignment is valid when zero, a divisor or a multiple of the page size.
fn alignment_is_valid(alignment: usize, page: usize) -> bool {
    alignment == 0 || alignment % page == 0 || page % alignment == 0
}

impl OsMemoryProvider {
    fn fail(&self, kind: OsNativeError, errno: i32) -> MemError {
        *self.last_error.lock() = LastError { kind, errno };
        MemError::ProviderSpecific
    }

    /// Map `size` bytes starting at a multiple of `alignment`.
    fn map_aligned(&self, size: usize, alignment: usize, page: usize) -> Result<NonNull<u8>, i32> {
        if alignment <= page {
            return os::map_anonymous(size, self.prot, self.map_flags);
        }

        let extended = size.checked_add(alignment).ok_or(libc::ENOMEM)?;
        let raw = os::map_anonymous(extended, self.prot, self.map_flags)?;
        let start = raw.as_ptr() as usize;
        let aligned = os::checked_align_up(start, alignment).ok_or(libc::ENOMEM)?;
        let head = aligned - start;
        let used_end = os::checked_align_up(aligned + size, page).ok_or(libc::ENOMEM)?;
        let tail = start + extended - used_end;

        // SAFETY: head and tail are page-aligned pieces of the mapping made
        // above that nothing references.
        unsafe {
            if head > 0 {
                let _ = os::unmap_pages(raw.as_ptr(), head);
            }
            if tail > 0 {
                let _ = os::unmap_pages(raw.as_ptr().add(used_end - start), tail);
            }
            Ok(NonNull::new_unchecked(raw.as_ptr().add(head)))
        }
    }
}

impl MemoryProviderOps for OsMemoryProvider {
    fn alloc(&self, size: usize, alignment: usize) -> MemResult<NonNull<u8>> {
        let page = os::page_size();
        if !alignment_is_valid(alignment, page) {
            warn!(alignment, page, "alignment must divide or be a multiple of the page size");
            return Err(MemError::InvalidArgument);
        }

        let addr = match self.map_aligned(size, alignment, page) {
            Ok(addr) => addr,
            Err(errno) => {
                warn!(size, alignment, errno, "OS provider mapping failed");
                return Err(self.fail(OsNativeError::AllocFailed, errno));
            }
        };

        if alignment > 0 && addr.as_ptr() as usize % alignment != 0 {
            warn!(addr = ?addr, alignment, "OS mapping is not aligned");
            // SAFETY: fresh mapping of `size` bytes nobody has seen.
            let _ = unsafe { os::unmap_pages(addr.as_ptr(), size) };
            return Err(self.fail(OsNativeError::AddressNotAligned, 0));
        }
        Ok(addr)
    }

    unsafe fn free(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        if ptr.is_null() {
            return Err(MemError::InvalidArgument);
        }
        // The size of the mapping is unknown, nothing can be unmapped.
        if size == 0 {
            return Ok(());
        }
        // SAFETY: caller hands back a mapping of ours.
        unsafe { os::unmap_pages(ptr, size) }.map_err(|errno| {
            warn!(ptr = ?ptr, size, errno, "OS provider unmap failed");
            self.fail(OsNativeError::FreeFailed, errno)
        })
    }

    fn last_native_error(&self) -> NativeError {
        let last = *self.last_error.lock();
        let message = if last.errno == 0 {
            last.kind.message().to_owned()
        } else {
            format!(
                "{}: {}",
                last.kind.message(),
                std::io::Error::from_raw_os_error(last.errno)
            )
        };
        NativeError::new(last.kind as i32, message)
    }

    fn name(&self) -> &'static str {
        "OS"
    }

    fn recommended_page_size(&self, _size: usize) -> MemResult<usize> {
        Ok(os::page_size())
    }

    fn min_page_size(&self, _ptr: *const u8) -> MemResult<usize> {
        Ok(os::page_size())
    }

    unsafe fn purge_lazy(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: caller owns the range.
        unsafe { os::advise(ptr, size, libc::MADV_FREE) }
            .map_err(|errno| self.fail(OsNativeError::PurgeLazyFailed, errno))
    }

    unsafe fn purge_force(&self, ptr: *mut u8, size: usize) -> MemResult<()> {
        // SAFETY: caller owns the range.
        unsafe { os::advise(ptr, size, libc::MADV_DONTNEED) }
            .map_err(|errno| self.fail(OsNativeError::PurgeForceFailed, errno))
    }

    unsafe fn allocation_split(
        &self,
        _ptr: *mut u8,
        _total_size: usize,
        _first_size: usize,
    ) -> MemResult<()> {
        Ok(())
    }

    unsafe fn allocation_merge(
        &self,
        _low: *mut u8,
        _high: *mut u8,
        _total_size: usize,
    ) -> MemResult<()> {
        Ok(())
    }
}
