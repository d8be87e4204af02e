// Memory mappings backing the frame arena and the four rings.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

use crate::api::{Errno, Error, Result};

/// An owned `mmap` region, unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain memory; who may touch which bytes is governed by the
// ring protocol, not by this type.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Map `len` bytes of zeroed, page-aligned private memory.
    ///
    /// Fails with `Error::OutOfMemory`.
    pub fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::OutOfMemory);
        }
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            tracing::warn!("anonymous mmap of {} bytes failed: {}", len, Errno::last());
            return Err(Error::OutOfMemory);
        }
        NonNull::new(ptr as *mut u8)
            .map(|ptr| MmapRegion { ptr, len })
            .ok_or(Error::OutOfMemory)
    }

    /// Map `len` bytes of a kernel object (an AF_XDP ring) shared with the kernel.
    pub fn shared(fd: BorrowedFd<'_>, len: usize, offset: i64) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(Errno::last()));
        }
        NonNull::new(ptr as *mut u8)
            .map(|ptr| MmapRegion { ptr, len })
            .ok_or(Error::Io(Errno::EFAULT))
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::warn!("munmap of {} bytes failed: {}", self.len, Errno::last());
        }
    }
}

impl std::fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// System page size.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}
