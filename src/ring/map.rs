// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Mirrored anonymous memory mapping.
//!
//! Provides safe wrappers around `memfd_create`, `ftruncate`, and `mmap`
//! for building a region whose contents appear twice, back to back, in
//! virtual memory.
//!
//! # Layout
//!
//! ```text
//! virtual:  [ base .. base+len )  [ base+len .. base+2*len )
//!                    |                       |
//!                    +-----------+-----------+
//!                                v
//! physical:            one memfd of len bytes
//! ```
//!
//! Both virtual halves are `MAP_SHARED` views of the same file, so a write
//! through either half is immediately visible through the other. A consumer
//! indexing past the seam at `len` keeps reading valid, contiguous data.
//!
//! # Lifecycle
//!
//! 1. Create with [`MirrorMap::new`] (len must be a page multiple)
//! 2. The backing fd is closed right after mapping; the mappings keep it alive
//! 3. The full `2 * len` range is unmapped on drop

use crate::error::{Error, Result};
use std::io;
use std::ptr;

/// Memory page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions and returns the
    // system page size; it cannot fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A region of `len` physical bytes mapped twice into adjacent virtual ranges.
///
/// Automatically unmaps the double range on drop.
pub struct MirrorMap {
    /// Base of the first virtual copy
    ptr: *mut u8,
    /// Size of one copy; the mapping spans `2 * len`
    len: usize,
}

// SAFETY: the mapping is plain process-private memory; concurrent access is
// governed by the owner (AtomicRing serializes element ownership through its
// atomic counters). The pointer itself is stable for the life of the map.
unsafe impl Send for MirrorMap {}
unsafe impl Sync for MirrorMap {}

impl MirrorMap {
    /// Create a new mirrored mapping of `len` bytes (visible as `2 * len`).
    ///
    /// # Arguments
    ///
    /// * `len` - Size of one copy in bytes; must be a non-zero page multiple
    ///
    /// # Errors
    ///
    /// Returns [`Error::MemFd`] if the anonymous file cannot be created or
    /// sized, [`Error::Mmap`] if either mapping fails.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 || len % page_size() != 0 {
            return Err(Error::InvalidCapacity(len));
        }

        // SAFETY:
        // - The name is a valid null-terminated string literal
        // - MFD_CLOEXEC is a valid flag; the fd never outlives this function
        // - memfd_create returns a valid fd on success or -1 (checked below)
        let fd =
            unsafe { libc::memfd_create(b"sockpool-ring\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::MemFd(io::Error::last_os_error()));
        }

        // Size the file to one copy's worth of bytes.
        // SAFETY:
        // - fd is valid from the successful memfd_create above
        // - len fits off_t (page-multiple sizes are bounded by address space)
        let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid; error path, fd is not reused.
            unsafe { libc::close(fd) };
            return Err(Error::MemFd(err));
        }

        // Reserve one contiguous range of 2*len bytes. PROT_NONE keeps the
        // range ours without committing memory; the overlays below replace it.
        // SAFETY:
        // - Null hint lets the kernel choose the address
        // - MAP_PRIVATE|MAP_ANONYMOUS with fd -1 is the standard reservation
        // - MAP_FAILED is checked below
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len * 2,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid; error path.
            unsafe { libc::close(fd) };
            return Err(Error::Mmap(err));
        }

        // Overlay the memfd on both halves of the reservation.
        // SAFETY:
        // - base and base+len are page-aligned addresses inside the range
        //   reserved above, so MAP_FIXED replaces only our own reservation
        // - fd is valid and sized to exactly len bytes
        // - MAP_SHARED makes both views coherent with the file and each other
        // - MAP_FAILED is checked after each call
        let lo = unsafe {
            libc::mmap(
                base,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        let hi = unsafe {
            libc::mmap(
                (base as *mut u8).add(len).cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };

        // The mappings hold their own reference to the file.
        // SAFETY: fd is valid from memfd_create; closing is safe whether or
        // not the overlays succeeded.
        unsafe { libc::close(fd) };

        if lo == libc::MAP_FAILED || hi == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: base covers the full 2*len reservation (MAP_FIXED
            // overlays stay inside it), so one munmap releases everything.
            unsafe { libc::munmap(base, len * 2) };
            return Err(Error::Mmap(err));
        }

        log::debug!("[RING] mirror map created: {len} bytes x2 at {base:p}");

        Ok(Self {
            ptr: base.cast(),
            len,
        })
    }

    /// Base pointer of the first copy. Valid for `2 * len()` bytes.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of one copy in bytes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping holds no bytes
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MirrorMap {
    fn drop(&mut self) {
        // SAFETY:
        // - self.ptr was returned by the successful reservation mmap in new()
        //   and the MAP_FIXED overlays kept the 2*len range contiguous
        // - Drop runs at most once, so the range is still mapped
        unsafe {
            libc::munmap(self.ptr.cast(), self.len * 2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_len() {
        assert!(matches!(MirrorMap::new(0), Err(Error::InvalidCapacity(0))));
    }

    #[test]
    fn test_rejects_unaligned_len() {
        let result = MirrorMap::new(page_size() + 1);
        assert!(matches!(result, Err(Error::InvalidCapacity(_))));
    }

    #[test]
    fn test_create_one_page() {
        let map = MirrorMap::new(page_size()).expect("Failed to map");
        assert_eq!(map.len(), page_size());
        assert!(!map.as_ptr().is_null());
    }

    #[test]
    fn test_halves_alias() {
        let len = page_size();
        let map = MirrorMap::new(len).expect("Failed to map");

        // SAFETY: the map spans 2*len bytes; offsets i and i+len are in
        // bounds, and the test holds the only reference.
        unsafe {
            for (i, byte) in [(0usize, 0x42u8), (1, 0x43), (len - 1, 0x44)] {
                *map.as_ptr().add(i) = byte;
                assert_eq!(*map.as_ptr().add(i + len), byte);
            }

            // Writes through the high half surface in the low half too.
            *map.as_ptr().add(len + 7) = 0x99;
            assert_eq!(*map.as_ptr().add(7), 0x99);
        }
    }

    #[test]
    fn test_multiple_pages() {
        let len = page_size() * 4;
        let map = MirrorMap::new(len).expect("Failed to map");

        // SAFETY: offsets below are within the 2*len mapping.
        unsafe {
            *map.as_ptr().add(len - 1) = 0xAB;
            assert_eq!(*map.as_ptr().add(2 * len - 1), 0xAB);
        }
    }
}
