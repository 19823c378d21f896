//! Reserved heap address ranges.
//!
//! On Unix the range is an anonymous private mapping, so released pages go
//! back to the kernel through `madvise(MADV_DONTNEED)`. Elsewhere it is a
//! page-aligned block from the global allocator and "release" only zeroes.

use std::fmt;
use std::ptr::NonNull;

use super::{HeapAddress, PAGE_SIZE};

/// A contiguous, page-aligned, zero-initialised address range.
pub struct HeapSpace {
    base: NonNull<u8>,
    size: usize,
}

// Safety: the space is a plain block of memory; synchronising access to its
// contents is the job of the allocators built on top of it.
unsafe impl Send for HeapSpace {}
unsafe impl Sync for HeapSpace {}

impl HeapSpace {
    /// Reserve `size` bytes, rounded up to whole pages.
    ///
    /// Returns `None` if the OS refuses the reservation.
    pub fn reserve(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let size = super::align_up(size, PAGE_SIZE);
        let base = os::map(size)?;
        tracing::debug!(base = ?base, size, "reserved heap space");
        Some(Self { base, size })
    }

    /// First address of the range.
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last address of the range.
    pub fn end(&self) -> usize {
        self.start() + self.size
    }

    /// Size of the range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Check whether an address falls inside the range.
    pub fn contains(&self, addr: HeapAddress) -> bool {
        let raw = addr.as_usize();
        raw >= self.start() && raw < self.end()
    }

    /// Return the physical pages backing `start..start + len` to the OS.
    ///
    /// The range reads back as zero afterwards.
    pub fn release(&self, start: usize, len: usize) {
        debug_assert!(start % PAGE_SIZE == 0 && len % PAGE_SIZE == 0);
        debug_assert!(start >= self.start() && start + len <= self.end());
        if len == 0 {
            return;
        }
        // Safety: the range is inside our mapping and the caller owns it.
        unsafe { os::release(start as *mut u8, len) }
    }

    /// Zero `start..start + len`.
    pub fn zero(&self, start: usize, len: usize) {
        debug_assert!(start >= self.start() && start + len <= self.end());
        // Safety: the range is inside our mapping and the caller owns it.
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, len) };
    }
}

impl Drop for HeapSpace {
    fn drop(&mut self) {
        // Safety: base/size came from os::map and are unmapped exactly once.
        unsafe { os::unmap(self.base, self.size) };
    }
}

impl fmt::Debug for HeapSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapSpace")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(unix)]
mod os {
    use std::ptr::{self, NonNull};

    pub(super) fn map(size: usize) -> Option<NonNull<u8>> {
        // Safety: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(ptr.cast::<u8>())
    }

    pub(super) unsafe fn release(start: *mut u8, len: usize) {
        let rc = libc::madvise(start.cast(), len, libc::MADV_DONTNEED);
        if rc != 0 {
            tracing::debug!(len, "madvise failed, zeroing instead");
            ptr::write_bytes(start, 0, len);
        } else if !cfg!(target_os = "linux") {
            // Only Linux guarantees zero-fill for private anonymous pages.
            ptr::write_bytes(start, 0, len);
        }
    }

    pub(super) unsafe fn unmap(base: NonNull<u8>, size: usize) {
        libc::munmap(base.as_ptr().cast(), size);
    }
}

#[cfg(not(unix))]
mod os {
    use std::alloc::{self, Layout};
    use std::ptr::{self, NonNull};

    use super::PAGE_SIZE;

    pub(super) fn map(size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        // Safety: size is non-zero.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    pub(super) unsafe fn release(start: *mut u8, len: usize) {
        ptr::write_bytes(start, 0, len);
    }

    pub(super) unsafe fn unmap(base: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size, PAGE_SIZE);
        alloc::dealloc(base.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_rounds_to_pages() {
        let space = HeapSpace::reserve(PAGE_SIZE + 1).unwrap();
        assert_eq!(space.size(), 2 * PAGE_SIZE);
        assert_eq!(space.start() % PAGE_SIZE, 0);
        assert_eq!(space.end() - space.start(), space.size());
    }

    #[test]
    fn test_reserve_zero_fails() {
        assert!(HeapSpace::reserve(0).is_none());
    }

    #[test]
    fn test_contains() {
        let space = HeapSpace::reserve(4 * PAGE_SIZE).unwrap();
        assert!(space.contains(HeapAddress::new(space.start())));
        assert!(space.contains(HeapAddress::new(space.end() - 1)));
        assert!(!space.contains(HeapAddress::new(space.end())));
        assert!(!space.contains(HeapAddress::NULL));
    }

    #[test]
    fn test_release_reads_back_zero() {
        let space = HeapSpace::reserve(2 * PAGE_SIZE).unwrap();
        unsafe { std::ptr::write_bytes(space.start() as *mut u8, 0xAB, 2 * PAGE_SIZE) };

        space.release(space.start(), PAGE_SIZE);
        let first = unsafe { *(space.start() as *const u8) };
        let second = unsafe { *((space.start() + PAGE_SIZE) as *const u8) };
        assert_eq!(first, 0);
        assert_eq!(second, 0xAB);
    }
}
