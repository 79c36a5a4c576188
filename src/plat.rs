// Abstract over system virtual memory functions

use std::fmt;
use std::io;

/// A platform call (or a read of platform state) failed. There is no retry of a single platform
/// call, so the caller is expected to give up.
#[derive(Debug)]
pub struct PlatFailed {
    pub op: &'static str,
    pub source: io::Error,
}

impl PlatFailed {
    pub fn new(op: &'static str, source: impl Into<io::Error>) -> Self {
        Self { op, source: source.into() }
    }
}

impl std::error::Error for PlatFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl fmt::Display for PlatFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.op, self.source)
    }
}

#[cfg(target_os = "linux")]
pub mod vendor {
    use crate::plat::PlatFailed;
    use crate::reservation::Backing;
    use rustix::mm::{Advice, MapFlags, MprotectFlags, ProtFlags, madvise, mmap_anonymous, mprotect, munmap};
    use std::ffi::c_void;
    use std::ptr::{self, NonNull};

    pub fn page_size() -> usize {
        rustix::param::page_size()
    }

    // Linux has no separate reservation quantum, so commits happen at page granularity.
    pub fn allocation_granularity() -> usize {
        page_size()
    }

    /// Reserve `reqsize` bytes of address space. Nothing in it is accessible or backed yet.
    pub fn sys_reserve(reqsize: usize) -> Result<*mut u8, PlatFailed> {
        match unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                reqsize,
                ProtFlags::empty(),
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        } {
            Ok(p) => Ok(p as *mut u8),
            Err(e) => Err(PlatFailed::new("mmap", e)),
        }
    }

    /// # Safety
    /// `p..p+size` must lie inside a region returned by `sys_reserve`.
    pub unsafe fn sys_commit(p: *mut u8, size: usize) -> Result<(), PlatFailed> {
        unsafe { mprotect(p as *mut c_void, size, MprotectFlags::READ | MprotectFlags::WRITE) }
            .map_err(|e| PlatFailed::new("mprotect", e))
    }

    /// Mark committed pages as disposable. Their contents may vanish at any time, and writing
    /// to them again makes them live without another commit.
    ///
    /// # Safety
    /// `p..p+size` must lie inside a committed part of a reserved region.
    pub unsafe fn sys_reset(p: *mut u8, size: usize) -> Result<(), PlatFailed> {
        unsafe { madvise(p as *mut c_void, size, Advice::LinuxFree) }
            .map_err(|e| PlatFailed::new("madvise(MADV_FREE)", e))
    }

    /// Ask the kernel to reclaim the pages right now instead of under pressure.
    ///
    /// Never fails: kernels older than 5.4 reject MADV_PAGEOUT, and the pages were already marked
    /// free by `sys_reset`.
    ///
    /// # Safety
    /// `p..p+size` must lie inside a reserved region.
    pub unsafe fn evict_from_working_set(p: *mut u8, size: usize) {
        let _ = unsafe { madvise(p as *mut c_void, size, Advice::LinuxPageOut) };
    }

    /// # Safety
    /// `p..p+size` must be a region returned by `sys_reserve` that is no longer used.
    pub unsafe fn sys_release(p: *mut u8, size: usize) {
        unsafe {
            munmap(p as *mut c_void, size).ok();
        }
    }

    /// The one big address range a memory-load process owns.
    #[derive(Debug)]
    pub struct Mapping {
        base: NonNull<u8>,
        len: usize,
        page_size: usize,
    }

    impl Mapping {
        pub fn reserve(len: usize) -> Result<Self, PlatFailed> {
            debug_assert!(len > 0);
            let p = sys_reserve(len)?;
            let base = NonNull::new(p).ok_or_else(|| {
                PlatFailed::new("mmap", std::io::Error::other("returned a null pointer"))
            })?;
            Ok(Self { base, len, page_size: page_size() })
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        /// Read back one byte, for checking what `touch` wrote.
        ///
        /// # Safety
        /// `offset` must be inside a committed range.
        pub unsafe fn read_byte(&self, offset: usize) -> u8 {
            assert!(offset < self.len);
            unsafe { self.base.as_ptr().add(offset).read_volatile() }
        }

        fn at(&self, offset: usize, len: usize) -> *mut u8 {
            assert!(offset.checked_add(len).is_some_and(|end| end <= self.len));
            unsafe { self.base.as_ptr().add(offset) }
        }
    }

    impl Backing for Mapping {
        fn commit(&mut self, offset: usize, len: usize) -> Result<(), PlatFailed> {
            let p = self.at(offset, len);
            unsafe { sys_commit(p, len) }
        }

        fn touch(&mut self, offset: usize, len: usize) {
            let p = self.at(offset, len);
            for i in (0..len).step_by(self.page_size) {
                // Volatile so the write to a page nobody reads is not optimized away.
                unsafe { p.add(i).write_volatile((i % 256) as u8) };
            }
        }

        fn reset(&mut self, offset: usize, len: usize) -> Result<(), PlatFailed> {
            let p = self.at(offset, len);
            unsafe { sys_reset(p, len) }
        }

        fn evict_from_working_set(&mut self, offset: usize, len: usize) {
            let p = self.at(offset, len);
            unsafe { evict_from_working_set(p, len) }
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe { sys_release(self.base.as_ptr(), self.len) }
        }
    }
}
