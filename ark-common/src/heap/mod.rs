//! # Managed Heap
//!
//! Object allocation for the runtime's garbage-collected heap.
//!
//! ## Design
//!
//! - A heap is one reserved address range ([`space::HeapSpace`]).
//! - Allocators ([`allocator::Allocator`]) carve objects out of it and hand
//!   back opaque [`HeapAddress`]es rather than Rust pointers.
//! - Every object starts with an 8-byte header word recording its size and
//!   [`AllocType`], which is all an allocator needs to walk its objects.
//! - Mutator threads allocate through thread-local
//!   [`alloc_buffer::AllocationBuffer`]s; exhausted buffers queue up as
//!   "hungry" and are fed either by the GC or by a [`replenish::ReplenishTask`]
//!   posted to the task pool.
//!
//! ## Allocators
//!
//! | Kind | Fast path | Reclaim unit |
//! |------|-----------|--------------|
//! | [`bump::BumpPointerAllocator`] | shared CAS cursor | whole space |
//! | [`region::RegionAllocator`] | thread-local region | region |
//! | [`large::LargeObjectAllocator`] | first-fit page spans | object |

pub mod alloc_buffer;
pub mod allocator;
pub mod bump;
pub mod large;
pub mod region;
pub mod replenish;
pub mod space;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub use alloc_buffer::{AllocBufferManager, AllocationBuffer, BufferId};
pub use allocator::{create_allocator, Allocator, AllocatorKind, GcHandler, GcReason};

/// OS page size assumed for reservation and release granularity.
pub const PAGE_SIZE: usize = 4096;

/// Alignment of every heap object.
pub const ALLOC_ALIGN: usize = 8;

/// Size of the header word at the start of every object.
pub const OBJECT_HEADER_SIZE: usize = 8;

/// Smallest object the allocators hand out (header plus one word).
pub const MIN_OBJECT_SIZE: usize = 16;

/// Largest size an object header can record.
pub const MAX_OBJECT_SIZE: usize = (1 << 48) - 1;

/// An address in the managed heap.
///
/// This is a plain integer, not a pointer. Callers must check it with
/// `Allocator::is_heap_address` or `Allocator::is_heap_object` before turning
/// it into a pointer with [`HeapAddress::as_ptr`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HeapAddress(usize);

impl HeapAddress {
    /// The failure sentinel.
    pub const NULL: HeapAddress = HeapAddress(0);

    /// Wrap a raw address.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Get the raw address.
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    /// Check if this is the failure sentinel.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// Raw pointer to the object's first byte (its header).
    ///
    /// Creating the pointer is safe; dereferencing it is only sound for an
    /// address that the owning allocator reports as a live heap object.
    pub fn as_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Debug for HeapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapAddress({:#x})", self.0)
    }
}

impl fmt::Display for HeapAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Allocation category, selecting the space and policy serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AllocType {
    /// Ordinary movable object.
    #[default]
    Normal = 1,
    /// Object that must never move (shared, non-thread-local space).
    Pinned = 2,
    /// Object served from its own contiguous span.
    Large = 3,
}

impl AllocType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(AllocType::Normal),
            2 => Some(AllocType::Pinned),
            3 => Some(AllocType::Large),
            _ => None,
        }
    }
}

/// An object as seen by heap walkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject {
    /// Address of the object header.
    pub address: HeapAddress,
    /// Total object size in bytes, header included.
    pub size: usize,
    /// Category the object was allocated with.
    pub alloc_type: AllocType,
}

/// Round a requested size up to a legal object size.
///
/// Returns `None` for zero-sized or oversized requests.
pub fn aligned_object_size(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_OBJECT_SIZE {
        return None;
    }
    let aligned = size.checked_add(ALLOC_ALIGN - 1)? & !(ALLOC_ALIGN - 1);
    Some(aligned.max(MIN_OBJECT_SIZE))
}

/// Round up to a multiple of a power-of-two `align`.
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ============================================================================
// Object headers
// ============================================================================

const SIZE_MASK: u64 = (1 << 48) - 1;
const TAG_SHIFT: u32 = 56;

fn encode_header(size: usize, alloc_type: AllocType) -> u64 {
    (size as u64 & SIZE_MASK) | ((alloc_type as u64) << TAG_SHIFT)
}

fn decode_header(word: u64) -> Option<(usize, AllocType)> {
    let size = (word & SIZE_MASK) as usize;
    let alloc_type = AllocType::from_tag((word >> TAG_SHIFT) as u8)?;
    if size < MIN_OBJECT_SIZE || size % ALLOC_ALIGN != 0 {
        return None;
    }
    Some((size, alloc_type))
}

/// # Safety
///
/// `addr` must be 8-byte aligned and lie inside memory mapped by a live
/// `HeapSpace`.
unsafe fn header_word<'a>(addr: usize) -> &'a AtomicU64 {
    &*(addr as *const AtomicU64)
}

/// Write an object header.
///
/// # Safety
///
/// See [`header_word`]; the range `addr..addr + size` must belong to the
/// caller.
pub(crate) unsafe fn write_header(addr: usize, size: usize, alloc_type: AllocType) {
    header_word(addr).store(encode_header(size, alloc_type), Ordering::Relaxed);
}

/// Read and validate an object header.
///
/// Returns `None` for a zero or malformed header word.
///
/// # Safety
///
/// See [`header_word`].
pub(crate) unsafe fn read_header(addr: usize) -> Option<HeapObject> {
    let word = header_word(addr).load(Ordering::Relaxed);
    decode_header(word).map(|(size, alloc_type)| HeapObject {
        address: HeapAddress::new(addr),
        size,
        alloc_type,
    })
}

/// Walk headers laid out back to back in `start..top`.
///
/// Returns `Ok(true)` when the range was walked completely, `Ok(false)` when
/// the visitor stopped the walk, and `Err(())` when a header was malformed or
/// overran `top`.
///
/// # Safety
///
/// `start..top` must be mapped heap memory whose objects were published
/// before `top` was observed.
pub(crate) unsafe fn walk_objects(
    start: usize,
    top: usize,
    visitor: &mut dyn FnMut(HeapObject) -> bool,
) -> Result<bool, ()> {
    let mut cursor = start;
    while cursor < top {
        let object = read_header(cursor).ok_or(())?;
        if cursor + object.size > top {
            return Err(());
        }
        if !visitor(object) {
            return Ok(false);
        }
        cursor += object.size;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_address_null() {
        assert!(HeapAddress::NULL.is_null());
        assert_eq!(HeapAddress::default(), HeapAddress::NULL);
        assert!(!HeapAddress::new(0x1000).is_null());
    }

    #[test]
    fn test_heap_address_ordering() {
        let a = HeapAddress::new(0x1000);
        let b = a.offset(16);
        assert!(a < b);
        assert_eq!(b.as_usize(), 0x1010);
        assert_eq!(format!("{}", b), "0x1010");
    }

    #[test]
    fn test_aligned_object_size() {
        assert_eq!(aligned_object_size(0), None);
        assert_eq!(aligned_object_size(1), Some(MIN_OBJECT_SIZE));
        assert_eq!(aligned_object_size(16), Some(16));
        assert_eq!(aligned_object_size(17), Some(24));
        assert_eq!(aligned_object_size(MAX_OBJECT_SIZE + 1), None);
    }

    #[test]
    fn test_header_encoding() {
        let word = encode_header(4096, AllocType::Pinned);
        assert_eq!(decode_header(word), Some((4096, AllocType::Pinned)));
        assert_eq!(decode_header(0), None);
        // Misaligned size is rejected.
        assert_eq!(decode_header(encode_header(17, AllocType::Normal)), None);
    }

    #[test]
    fn test_walk_objects() {
        let mut backing = vec![0u64; 16];
        let start = backing.as_mut_ptr() as usize;
        unsafe {
            write_header(start, 16, AllocType::Normal);
            write_header(start + 16, 32, AllocType::Pinned);
            write_header(start + 48, 16, AllocType::Normal);
        }

        let mut seen = Vec::new();
        let complete = unsafe {
            walk_objects(start, start + 64, &mut |obj| {
                seen.push((obj.address.as_usize() - start, obj.size));
                true
            })
        };
        assert_eq!(complete, Ok(true));
        assert_eq!(seen, vec![(0, 16), (16, 32), (48, 16)]);

        // A zero header inside the range is reported as corruption.
        let torn = unsafe { walk_objects(start, start + 80, &mut |_| true) };
        assert_eq!(torn, Err(()));

        let stopped = unsafe { walk_objects(start, start + 64, &mut |_| false) };
        assert_eq!(stopped, Ok(false));
    }
}
