//! Large-object allocator.
//!
//! Every object gets its own page-aligned span. Free space is a first-fit
//! map of spans keyed by start address; freed spans are merged with their
//! neighbours so the map never holds two adjacent entries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::allocator::{Allocator, AllocatorBase, AllocatorKind};
use super::space::HeapSpace;
use super::{aligned_object_size, align_up, read_header, write_header};
use super::{AllocType, HeapAddress, HeapObject, PAGE_SIZE};
use crate::config::HeapConfig;

#[derive(Default)]
struct SpanTable {
    /// Free spans, start -> length.
    free: BTreeMap<usize, usize>,
    /// Allocated objects by address.
    objects: BTreeMap<usize, HeapObject>,
    /// Dead spans awaiting reclamation, (start, length).
    garbage: Vec<(usize, usize)>,
    /// Bytes of spans not on the free map.
    committed: usize,
}

impl SpanTable {
    fn take_first_fit(&mut self, len: usize) -> Option<usize> {
        let (&start, &free_len) = self.free.iter().find(|&(_, &l)| l >= len)?;
        self.free.remove(&start);
        if free_len > len {
            self.free.insert(start + len, free_len - len);
        }
        self.committed += len;
        Some(start)
    }

    fn insert_free(&mut self, mut start: usize, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

fn span_len(size: usize) -> usize {
    align_up(size, PAGE_SIZE)
}

/// Visit `object` if its header still matches, else report a torn walk.
fn visit_checked(object: &HeapObject, visitor: &mut dyn FnMut(HeapObject) -> bool) -> bool {
    // Safety: spans stay mapped for the space's lifetime; a reclaimed one
    // reads back as zero.
    let current = unsafe { read_header(object.address.as_usize()) };
    current == Some(*object) && visitor(*object)
}

/// Allocator giving each object its own page span.
pub struct LargeObjectAllocator {
    base: AllocatorBase,
    space: OnceLock<HeapSpace>,
    spans: Mutex<SpanTable>,
}

impl LargeObjectAllocator {
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
            spans: Mutex::new(SpanTable::default()),
        }
    }

    /// Number of free spans.
    pub fn free_span_count(&self) -> usize {
        self.spans.lock().free.len()
    }
}

impl Default for LargeObjectAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for LargeObjectAllocator {
    fn base(&self) -> &AllocatorBase {
        &self.base
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::LargeObject
    }

    fn init(&self, config: &HeapConfig) {
        self.base.init_config(self.kind(), config);
        let Some(space) = HeapSpace::reserve(config.heap_size) else {
            tracing::error!(size = config.heap_size, "failed to reserve large object space");
            panic!("failed to reserve {} bytes of heap", config.heap_size);
        };
        self.spans.lock().free.insert(space.start(), space.size());
        let _ = self.space.set(space);
    }

    fn allocate_no_gc(&self, size: usize, alloc_type: AllocType) -> HeapAddress {
        let (Some(_), Some(size)) = (self.space.get(), aligned_object_size(size)) else {
            return HeapAddress::NULL;
        };
        let mut spans = self.spans.lock();
        let Some(start) = spans.take_first_fit(span_len(size)) else {
            tracing::debug!(size, "large object space exhausted");
            return HeapAddress::NULL;
        };
        // Safety: the span was just taken off the free map.
        unsafe { write_header(start, size, alloc_type) };
        let object = HeapObject {
            address: HeapAddress::new(start),
            size,
            alloc_type,
        };
        spans.objects.insert(start, object);
        drop(spans);

        self.base.record_allocation(size);
        object.address
    }

    fn for_each_object(&self, visitor: &mut dyn FnMut(HeapObject) -> bool, safe: bool) -> bool {
        if safe {
            let snapshot: Vec<_> = self.spans.lock().objects.values().copied().collect();
            snapshot.iter().all(|object| visit_checked(object, &mut *visitor))
        } else {
            let spans = self.spans.lock();
            spans.objects.values().all(|object| visit_checked(object, &mut *visitor))
        }
    }

    fn sweep(&self, is_live: &mut dyn FnMut(HeapObject) -> bool) -> usize {
        // Judge outside the lock so the predicate may query the allocator.
        let snapshot: Vec<_> = self.spans.lock().objects.values().copied().collect();
        let dead: Vec<_> = snapshot.into_iter().filter(|obj| !is_live(*obj)).collect();

        let mut spans = self.spans.lock();
        let mut bytes = 0;
        for object in dead {
            let start = object.address.as_usize();
            if spans.objects.remove(&start).is_some() {
                spans.garbage.push((start, span_len(object.size)));
                bytes += object.size;
            }
        }
        drop(spans);

        self.base.record_release(bytes);
        tracing::debug!(bytes, "large objects swept");
        bytes
    }

    /// Spans are always released whole, so `release_all` changes nothing.
    fn reclaim_garbage_memory(&self, _release_all: bool) -> usize {
        let Some(space) = self.space.get() else {
            return 0;
        };
        let mut spans = self.spans.lock();
        let garbage = std::mem::take(&mut spans.garbage);
        let mut released = 0;
        for (start, len) in garbage {
            space.release(start, len);
            spans.insert_free(start, len);
            spans.committed -= len;
            released += len;
        }
        released
    }

    fn max_capacity(&self) -> usize {
        self.space.get().map_or(0, HeapSpace::size)
    }

    fn current_capacity(&self) -> usize {
        self.spans.lock().committed
    }

    fn is_heap_address(&self, addr: HeapAddress) -> bool {
        self.space.get().is_some_and(|space| space.contains(addr))
    }

    fn is_heap_object(&self, addr: HeapAddress) -> bool {
        self.spans.lock().objects.contains_key(&addr.as_usize())
    }
}

impl fmt::Debug for LargeObjectAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spans = self.spans.lock();
        f.debug_struct("LargeObjectAllocator")
            .field("base", &self.base)
            .field("objects", &spans.objects.len())
            .field("free_spans", &spans.free.len())
            .field("committed", &spans.committed)
            .finish()
    }
}
