//! Bump-pointer allocator.
//!
//! One shared space with a single cursor advanced by compare-and-swap. There
//! are no thread-local buffers, so the buffer manager stays empty. The space
//! can only be reclaimed as a whole, once a sweep found nothing alive in it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use super::allocator::{Allocator, AllocatorBase, AllocatorKind};
use super::space::HeapSpace;
use super::{aligned_object_size, align_up, walk_objects, write_header};
use super::{AllocType, HeapAddress, HeapObject, PAGE_SIZE};
use crate::config::HeapConfig;

/// Allocator with one shared CAS-bumped cursor.
pub struct BumpPointerAllocator {
    base: AllocatorBase,
    space: OnceLock<HeapSpace>,
    /// Next free address.
    cursor: AtomicUsize,
    /// Cursor value up to which a sweep found only dead objects, 0 if none.
    reclaimable_end: AtomicUsize,
}

impl BumpPointerAllocator {
    /// Create an uninitialised allocator.
    pub fn new() -> Self {
        Self::from_base(AllocatorBase::new())
    }

    /// Create an uninitialised allocator with an explicit async flag.
    pub fn with_async_allocation(async_allocation: bool) -> Self {
        Self::from_base(AllocatorBase::with_async_allocation(async_allocation))
    }

    fn from_base(base: AllocatorBase) -> Self {
        Self {
            base,
            space: OnceLock::new(),
            cursor: AtomicUsize::new(0),
            reclaimable_end: AtomicUsize::new(0),
        }
    }
}

impl Default for BumpPointerAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for BumpPointerAllocator {
    fn base(&self) -> &AllocatorBase {
        &self.base
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::BumpPointer
    }

    fn init(&self, config: &HeapConfig) {
        self.base.init_config(self.kind(), config);
        let Some(space) = HeapSpace::reserve(config.heap_size) else {
            tracing::error!(size = config.heap_size, "failed to reserve bump space");
            panic!("failed to reserve {} bytes of heap", config.heap_size);
        };
        self.cursor.store(space.start(), Ordering::Release);
        // `init_config` admits a single caller.
        let _ = self.space.set(space);
    }

    fn allocate_no_gc(&self, size: usize, alloc_type: AllocType) -> HeapAddress {
        let (Some(space), Some(size)) = (self.space.get(), aligned_object_size(size)) else {
            return HeapAddress::NULL;
        };

        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(size).filter(|&n| n <= space.end()) else {
                tracing::debug!(size, "bump space exhausted");
                return HeapAddress::NULL;
            };
            match self
                .cursor
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        // Safety: current..current + size was just claimed by the CAS.
        unsafe { write_header(current, size, alloc_type) };
        self.base.record_allocation(size);
        HeapAddress::new(current)
    }

    fn for_each_object(&self, visitor: &mut dyn FnMut(HeapObject) -> bool, _safe: bool) -> bool {
        let Some(space) = self.space.get() else {
            return true;
        };
        // Objects below an observed cursor are either published or still
        // have a zero header, which the walk reports as torn.
        let top = self.cursor.load(Ordering::Acquire);
        // Safety: start..top lies inside the mapped space.
        unsafe { walk_objects(space.start(), top, visitor) }.unwrap_or(false)
    }

    fn sweep(&self, is_live: &mut dyn FnMut(HeapObject) -> bool) -> usize {
        let Some(space) = self.space.get() else {
            return 0;
        };
        let top = self.cursor.load(Ordering::Acquire);
        let mut any_live = false;
        let complete = self.for_each_object(
            &mut |obj| {
                any_live = is_live(obj);
                !any_live
            },
            false,
        );
        if any_live || !complete {
            return 0;
        }

        let counted = match self.reclaimable_end.swap(top, Ordering::AcqRel) {
            0 => space.start(),
            end => end,
        };
        let bytes = top - counted;
        self.base.record_release(bytes);
        tracing::debug!(bytes, "bump space swept clean");
        bytes
    }

    fn reclaim_garbage_memory(&self, _release_all: bool) -> usize {
        let Some(space) = self.space.get() else {
            return 0;
        };
        let end = self.reclaimable_end.swap(0, Ordering::AcqRel);
        if end == 0 {
            return 0;
        }
        let start = space.start();
        if self
            .cursor
            .compare_exchange(end, start, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Objects were allocated after the sweep; the space stays in use.
            self.base.record_allocation(end - start);
            tracing::debug!("bump space reused since sweep, nothing reclaimed");
            return 0;
        }

        let released = align_up(end - start, PAGE_SIZE);
        space.release(start, released);
        tracing::debug!(released, "bump space reclaimed");
        released
    }

    fn max_capacity(&self) -> usize {
        self.space.get().map_or(0, HeapSpace::size)
    }

    fn current_capacity(&self) -> usize {
        self.space
            .get()
            .map_or(0, |space| self.cursor.load(Ordering::Relaxed) - space.start())
    }

    fn is_heap_address(&self, addr: HeapAddress) -> bool {
        self.space.get().is_some_and(|space| space.contains(addr))
    }
}

impl fmt::Debug for BumpPointerAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpPointerAllocator")
            .field("base", &self.base)
            .field("space", &self.space.get())
            .field("used", &self.current_capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn allocator(heap_size: usize) -> BumpPointerAllocator {
        let allocator = BumpPointerAllocator::with_async_allocation(false);
        allocator.init(&HeapConfig {
            heap_size,
            region_size: PAGE_SIZE,
            large_object_threshold: PAGE_SIZE,
            gc_threshold: 0,
            ..HeapConfig::default()
        });
        allocator
    }

    #[test]
    fn test_sequential_allocation() {
        let allocator = allocator(4 * PAGE_SIZE);
        let a = allocator.allocate(16, AllocType::Normal);
        let b = allocator.allocate(20, AllocType::Pinned);
        let c = allocator.allocate(8, AllocType::Normal);

        assert_eq!(b.as_usize() - a.as_usize(), 16);
        assert_eq!(c.as_usize() - b.as_usize(), 24);
        assert_eq!(allocator.allocated_bytes(), 16 + 24 + 16);
        assert_eq!(allocator.current_capacity(), 56);
        assert!(allocator.is_heap_address(a));
        assert!(allocator.alloc_buffer_manager().buffer_count() == 0);
    }

    #[test]
    fn test_exhaustion_returns_null() {
        let allocator = allocator(PAGE_SIZE);
        assert!(!allocator.allocate_no_gc(PAGE_SIZE - 16, AllocType::Normal).is_null());
        assert!(!allocator.allocate_no_gc(16, AllocType::Normal).is_null());
        assert!(allocator.allocate_no_gc(16, AllocType::Normal).is_null());
        assert!(allocator.allocate_no_gc(0, AllocType::Normal).is_null());
    }

    #[test]
    fn test_for_each_object_visits_in_order() {
        let allocator = allocator(PAGE_SIZE);
        let addrs: Vec<_> = (1..=4).map(|i| allocator.allocate(i * 16, AllocType::Normal)).collect();

        let mut seen = Vec::new();
        assert!(allocator.for_each_object(&mut |obj| {
            seen.push(obj.address);
            true
        }, true));
        assert_eq!(seen, addrs);

        let mut count = 0;
        assert!(!allocator.for_each_object(&mut |_| {
            count += 1;
            count < 2
        }, true));
        assert_eq!(count, 2);
    }

    #[test]
    fn test_in_flight_allocation_fails_safe_walk() {
        let allocator = allocator(PAGE_SIZE);
        allocator.allocate(16, AllocType::Normal);
        // Claim space without publishing a header, as a racing mutator would.
        allocator.cursor.fetch_add(16, Ordering::AcqRel);
        assert!(!allocator.for_each_object(&mut |_| true, true));
    }

    #[test]
    fn test_sweep_requires_everything_dead() {
        let allocator = allocator(2 * PAGE_SIZE);
        let keep = allocator.allocate(32, AllocType::Normal);
        allocator.allocate(32, AllocType::Normal);

        assert_eq!(allocator.sweep(&mut |obj| obj.address == keep), 0);
        assert_eq!(allocator.reclaim_garbage_memory(true), 0);

        assert_eq!(allocator.sweep(&mut |_| false), 64);
        assert_eq!(allocator.allocated_bytes(), 0);
        // A second sweep finds nothing new.
        assert_eq!(allocator.sweep(&mut |_| false), 0);
    }

    #[test]
    fn test_reclaim_resets_cursor() {
        let allocator = allocator(2 * PAGE_SIZE);
        let first = allocator.allocate(PAGE_SIZE + 16, AllocType::Normal);
        allocator.sweep(&mut |_| false);

        assert_eq!(allocator.reclaim_garbage_memory(false), 2 * PAGE_SIZE);
        assert_eq!(allocator.current_capacity(), 0);
        assert_eq!(allocator.allocate(16, AllocType::Normal), first);
        assert_eq!(allocator.reclaim_garbage_memory(true), 0);
    }

    #[test]
    fn test_reclaim_after_reuse_keeps_space() {
        let allocator = allocator(2 * PAGE_SIZE);
        allocator.allocate(64, AllocType::Normal);
        allocator.sweep(&mut |_| false);
        allocator.allocate(64, AllocType::Normal);

        assert_eq!(allocator.reclaim_garbage_memory(true), 0);
        assert_eq!(allocator.allocated_bytes(), 128);
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        let allocator = Arc::new(allocator(64 * PAGE_SIZE));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || {
                    (0..500)
                        .map(|_| allocator.allocate(32, AllocType::Normal).as_usize())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for addr in handle.join().unwrap() {
                assert_ne!(addr, 0);
                assert!(all.insert(addr));
            }
        }
        assert_eq!(allocator.allocated_bytes(), 4 * 500 * 32);

        let mut walked = 0;
        assert!(allocator.for_each_object(&mut |_| {
            walked += 1;
            true
        }, true));
        assert_eq!(walked, 2000);
    }
}
