//! Region-based allocator.
//!
//! The heap is split into equally sized, power-of-two regions described by a
//! fixed region table. Each region is in exactly one [`RegionState`]:
//!
//! ```text
//!            acquire                retire / thread exit
//!   Free ───────────────▶ ThreadLocal ─────────────────▶ Retired ─┐
//!    ▲  ───────────────▶ Shared (pinned)  ───────────────────────┤ sweep
//!    │  ───────────────▶ LargeHead + LargeTail* ─────────────────┤ (all dead)
//!    │                                                           ▼
//!    └──────────────────────── reclaim ──────────────────────── Garbage
//! ```
//!
//! Normal objects are bumped into the calling thread's
//! [`AllocationBuffer`]. Pinned objects share one region under a mutex, and
//! large objects take a contiguous run of regions of their own.
//!
//! With async allocation enabled, an exhausted buffer refills from its
//! prepared region when it has one, then queues itself as hungry. Hungry
//! buffers get a fresh prepared region from [`Allocator::feed_hungry_buffers`]
//! or from a [`ReplenishTask`] posted to the attached task pool.
//!
//! Object publication: the owner writes the header, then stores the region
//! top with release ordering. Walkers load the top with acquire ordering and
//! never read past it.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use super::alloc_buffer::{AllocBufferManager, AllocationBuffer, HungryBuffers, NO_REGION};
use super::allocator::{Allocator, AllocatorBase, AllocatorKind};
use super::replenish::ReplenishTask;
use super::space::HeapSpace;
use super::{aligned_object_size, walk_objects, write_header};
use super::{AllocType, HeapAddress, HeapObject};
use crate::config::HeapConfig;
use crate::taskpool::Taskpool;

/// Lifecycle state of one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegionState {
    /// On the free set.
    Free = 0,
    /// Current or prepared region of an allocation buffer.
    ThreadLocal = 1,
    /// Former buffer region, no longer allocated into.
    Retired = 2,
    /// Shared region for pinned objects.
    Shared = 3,
    /// First region of a large object.
    LargeHead = 4,
    /// Continuation of a large object.
    LargeTail = 5,
    /// Found dead by a sweep, awaiting reclamation.
    Garbage = 6,
}

impl RegionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RegionState::ThreadLocal,
            2 => RegionState::Retired,
            3 => RegionState::Shared,
            4 => RegionState::LargeHead,
            5 => RegionState::LargeTail,
            6 => RegionState::Garbage,
            _ => RegionState::Free,
        }
    }

    /// Whether objects in this state are visible to heap walks.
    fn holds_objects(self) -> bool {
        matches!(
            self,
            RegionState::ThreadLocal | RegionState::Retired | RegionState::Shared | RegionState::LargeHead
        )
    }
}

struct RegionDesc {
    start: usize,
    top: AtomicUsize,
    state: AtomicU8,
    /// Regions in the run, for a large head.
    span: AtomicUsize,
    /// Committed pages may hold stale bytes.
    dirty: AtomicBool,
}

impl RegionDesc {
    fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn live_range(&self) -> Option<(usize, usize)> {
        self.state()
            .holds_objects()
            .then(|| (self.start, self.top.load(Ordering::Acquire)))
    }
}

/// Walk one region, reporting whether it was walked completely.
///
/// # Safety
///
/// `start..top` must be a published prefix of a mapped region.
unsafe fn walk_range(start: usize, top: usize, visitor: &mut dyn FnMut(HeapObject) -> bool) -> bool {
    matches!(walk_objects(start, top, visitor), Ok(true))
}

/// The region table and the free and garbage sets.
pub(crate) struct RegionManager {
    space: HeapSpace,
    region_size: usize,
    regions: Box<[RegionDesc]>,
    free: Mutex<BTreeSet<usize>>,
    garbage: Mutex<Vec<usize>>,
    /// Current pinned region, or `NO_REGION`.
    pinned: Mutex<usize>,
    retained_garbage_regions: usize,
}

impl RegionManager {
    pub(crate) fn new(config: &HeapConfig) -> Option<Self> {
        let space = HeapSpace::reserve(config.heap_size)?;
        let count = config.region_count();
        let regions = (0..count)
            .map(|i| {
                let start = space.start() + i * config.region_size;
                RegionDesc {
                    start,
                    top: AtomicUsize::new(start),
                    state: AtomicU8::new(RegionState::Free as u8),
                    span: AtomicUsize::new(0),
                    dirty: AtomicBool::new(false),
                }
            })
            .collect();
        Some(Self {
            space,
            region_size: config.region_size,
            regions,
            free: Mutex::new((0..count).collect()),
            garbage: Mutex::new(Vec::new()),
            pinned: Mutex::new(NO_REGION),
            retained_garbage_regions: config.retained_garbage_regions,
        })
    }

    pub(crate) fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub(crate) fn free_region_count(&self) -> usize {
        self.free.lock().len()
    }

    pub(crate) fn region_state(&self, idx: usize) -> RegionState {
        self.regions[idx].state()
    }

    fn region_index(&self, addr: HeapAddress) -> Option<usize> {
        self.space
            .contains(addr)
            .then(|| (addr.as_usize() - self.space.start()) / self.region_size)
    }

    /// Prepare a region taken off the free set for use.
    fn activate(&self, idx: usize, state: RegionState, span: usize) {
        let region = &self.regions[idx];
        if region.dirty.swap(false, Ordering::AcqRel) {
            self.space.zero(region.start, self.region_size);
        }
        region.top.store(region.start, Ordering::Relaxed);
        region.span.store(span, Ordering::Relaxed);
        region.set_state(state);
    }

    /// Take one free region.
    fn acquire_region(&self, state: RegionState) -> Option<usize> {
        let idx = self.free.lock().pop_first()?;
        self.activate(idx, state, 1);
        Some(idx)
    }

    /// Take `count` contiguous free regions, returning the first.
    fn acquire_run(&self, count: usize) -> Option<usize> {
        let head = {
            let mut free = self.free.lock();
            let mut run_start = 0;
            let mut run_len = 0;
            let mut prev: Option<usize> = None;
            let mut found = None;
            for &idx in free.iter() {
                if prev.is_some_and(|p| p + 1 == idx) {
                    run_len += 1;
                } else {
                    run_start = idx;
                    run_len = 1;
                }
                prev = Some(idx);
                if run_len == count {
                    found = Some(run_start);
                    break;
                }
            }
            let head = found?;
            for idx in head..head + count {
                free.remove(&idx);
            }
            head
        };

        for idx in head + 1..head + count {
            self.activate(idx, RegionState::LargeTail, 0);
        }
        self.activate(head, RegionState::LargeHead, count);
        Some(head)
    }

    /// Return an unused region straight to the free set.
    fn free_region(&self, idx: usize) {
        let region = &self.regions[idx];
        region.set_state(RegionState::Free);
        region.top.store(region.start, Ordering::Relaxed);
        self.free.lock().insert(idx);
    }

    fn retire(&self, idx: usize) {
        self.regions[idx].set_state(RegionState::Retired);
    }

    /// Bump `size` bytes in a region only the caller allocates into.
    fn bump(&self, idx: usize, size: usize, alloc_type: AllocType) -> Option<usize> {
        let region = &self.regions[idx];
        let top = region.top.load(Ordering::Relaxed);
        if top + size > region.start + self.region_size {
            return None;
        }
        // Safety: top..top + size is unpublished space owned by the caller.
        unsafe { write_header(top, size, alloc_type) };
        region.top.store(top + size, Ordering::Release);
        Some(top)
    }

    fn allocate_pinned(&self, size: usize) -> Option<usize> {
        let mut pinned = self.pinned.lock();
        if *pinned != NO_REGION {
            if let Some(addr) = self.bump(*pinned, size, AllocType::Pinned) {
                return Some(addr);
            }
        }
        let idx = self.acquire_region(RegionState::Shared)?;
        *pinned = idx;
        self.bump(idx, size, AllocType::Pinned)
    }

    fn allocate_large(&self, size: usize) -> Option<usize> {
        let count = size.div_ceil(self.region_size);
        let head = self.acquire_run(count)?;
        let region = &self.regions[head];
        // Safety: the run was just taken off the free set.
        unsafe { write_header(region.start, size, AllocType::Large) };
        region.top.store(region.start + size, Ordering::Release);
        Some(region.start)
    }

    /// Grant prepared regions to every hungry buffer. Returns how many were fed.
    pub(crate) fn feed_hungry_buffers(&self, buffers: &AllocBufferManager) -> usize {
        let mut hungry = HungryBuffers::new();
        buffers.swap_hungry_buffers(&mut hungry);
        let mut fed = 0;
        for buffer in hungry {
            if buffer.prepared_region().is_some() || !buffers.is_registered(buffer.id()) {
                continue;
            }
            let Some(idx) = self.acquire_region(RegionState::ThreadLocal) else {
                tracing::debug!(buffer = buffer.id().as_u64(), "no free region for hungry buffer");
                break;
            };
            if !buffer.offer_prepared(idx) {
                self.free_region(idx);
                continue;
            }
            // The owner may have detached while we were granting.
            if !buffers.is_registered(buffer.id()) {
                if let Some(idx) = buffer.take_prepared() {
                    self.free_region(idx);
                }
                continue;
            }
            fed += 1;
        }
        fed
    }

    fn for_each_object(&self, visitor: &mut dyn FnMut(HeapObject) -> bool, safe: bool) -> bool {
        // Safety (both arms): ranges are published prefixes of mapped regions.
        if safe {
            let snapshot: Vec<_> = self.regions.iter().filter_map(RegionDesc::live_range).collect();
            snapshot
                .into_iter()
                .all(|(start, top)| unsafe { walk_range(start, top, &mut *visitor) })
        } else {
            self.regions.iter().all(|region| match region.live_range() {
                Some((start, top)) => unsafe { walk_range(start, top, &mut *visitor) },
                None => true,
            })
        }
    }

    fn is_object_start(&self, addr: HeapAddress) -> bool {
        let Some(idx) = self.region_index(addr) else {
            return false;
        };
        let Some((start, top)) = self.regions[idx].live_range() else {
            return false;
        };
        let mut found = false;
        // Safety: start..top is a published prefix of a mapped region.
        let _ = unsafe {
            walk_objects(start, top, &mut |obj| {
                found = obj.address == addr;
                !found && obj.address < addr
            })
        };
        found
    }

    fn sweep(&self, is_live: &mut dyn FnMut(HeapObject) -> bool) -> (usize, usize) {
        let pinned = self.pinned.lock();
        let mut garbage = self.garbage.lock();
        let mut bytes = 0;
        let mut regions = 0;
        for (idx, region) in self.regions.iter().enumerate() {
            let state = region.state();
            let candidate = match state {
                RegionState::Retired | RegionState::LargeHead => true,
                RegionState::Shared => idx != *pinned,
                _ => false,
            };
            if !candidate {
                continue;
            }
            let top = region.top.load(Ordering::Acquire);
            let mut any_live = false;
            // Safety: start..top is a published prefix of a mapped region.
            let walked = unsafe {
                walk_objects(region.start, top, &mut |obj| {
                    any_live = is_live(obj);
                    !any_live
                })
            };
            if any_live || walked.is_err() {
                continue;
            }

            let span = if state == RegionState::LargeHead {
                region.span.load(Ordering::Relaxed)
            } else {
                1
            };
            for member in idx..idx + span {
                self.regions[member].set_state(RegionState::Garbage);
                garbage.push(member);
            }
            bytes += top - region.start;
            regions += span;
        }
        (bytes, regions)
    }

    fn reclaim(&self, release_all: bool) -> usize {
        let mut garbage = std::mem::take(&mut *self.garbage.lock());
        garbage.sort_unstable();
        let retain = if release_all { 0 } else { self.retained_garbage_regions };

        let mut released = 0;
        for (i, &idx) in garbage.iter().enumerate() {
            let region = &self.regions[idx];
            if i < retain {
                region.dirty.store(true, Ordering::Release);
            } else {
                self.space.release(region.start, self.region_size);
                region.dirty.store(false, Ordering::Release);
                released += self.region_size;
            }
            region.span.store(0, Ordering::Relaxed);
            region.top.store(region.start, Ordering::Relaxed);
            region.set_state(RegionState::Free);
        }
        self.free.lock().extend(garbage.iter().copied());
        released
    }
}

impl fmt::Debug for RegionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionManager")
            .field("space", &self.space)
            .field("region_size", &self.region_size)
            .field("regions", &self.regions.len())
            .field("free", &self.free_region_count())
            .finish()
    }
}

/// A thread's buffer for one allocator. Detaches on drop.
struct LocalBuffer {
    buffer: Arc<AllocationBuffer>,
    buffers: Weak<AllocBufferManager>,
    regions: Weak<RegionManager>,
}

impl Drop for LocalBuffer {
    fn drop(&mut self) {
        if let Some(buffers) = self.buffers.upgrade() {
            buffers.unregister_alloc_buffer(&self.buffer);
        }
        if let Some(regions) = self.regions.upgrade() {
            if let Some(idx) = self.buffer.set_region(None) {
                regions.retire(idx);
            }
            if let Some(idx) = self.buffer.take_prepared() {
                regions.free_region(idx);
            }
        }
    }
}

thread_local! {
    /// Allocation buffers of the current thread, keyed by allocator id.
    static LOCAL_BUFFERS: RefCell<HashMap<u64, LocalBuffer>> = RefCell::new(HashMap::new());
}

/// Allocator serving normal objects from thread-local regions.
pub struct RegionAllocator {
    base: AllocatorBase,
    manager: OnceLock<Arc<RegionManager>>,
    taskpool: RwLock<Option<Arc<Taskpool>>>,
    /// Set while a replenish task is queued.
    feed_pending: Arc<AtomicBool>,
}

impl RegionAllocator {
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
            manager: OnceLock::new(),
            taskpool: RwLock::new(None),
            feed_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of regions not on the free set.
    pub fn regions_in_use(&self) -> usize {
        self.manager
            .get()
            .map_or(0, |m| m.region_count() - m.free_region_count())
    }

    /// State of the region containing `addr`.
    pub fn region_state_of(&self, addr: HeapAddress) -> Option<RegionState> {
        let manager = self.manager.get()?;
        manager.region_index(addr).map(|idx| manager.region_state(idx))
    }

    /// Detach the calling thread's buffer.
    ///
    /// Its current region is retired and any prepared region returned to the
    /// free set. The next allocation on this thread attaches a new buffer.
    /// Thread exit does the same implicitly.
    pub fn detach_current_thread(&self) {
        let local = LOCAL_BUFFERS
            .try_with(|cell| cell.borrow_mut().remove(&self.base.id()))
            .ok()
            .flatten();
        drop(local);
    }

    fn attach_buffer(&self, manager: &Arc<RegionManager>) -> LocalBuffer {
        let buffer = Arc::new(AllocationBuffer::new());
        self.base.buffers().register_alloc_buffer(&buffer);
        tracing::trace!(buffer = buffer.id().as_u64(), "attached allocation buffer");
        LocalBuffer {
            buffer,
            buffers: Arc::downgrade(self.base.buffers()),
            regions: Arc::downgrade(manager),
        }
    }

    fn allocate_normal(&self, manager: &Arc<RegionManager>, size: usize) -> Option<usize> {
        LOCAL_BUFFERS
            .try_with(|cell| {
                let mut map = cell.borrow_mut();
                let local = map
                    .entry(self.base.id())
                    .or_insert_with(|| self.attach_buffer(manager));
                self.allocate_in_buffer(manager, &local.buffer, size)
            })
            .ok()
            .flatten()
    }

    fn allocate_in_buffer(
        &self,
        manager: &RegionManager,
        buffer: &Arc<AllocationBuffer>,
        size: usize,
    ) -> Option<usize> {
        if let Some(idx) = buffer.region() {
            if let Some(addr) = manager.bump(idx, size, AllocType::Normal) {
                buffer.record_allocation(size);
                return Some(addr);
            }
        }

        let next = self.refill(manager, buffer)?;
        if let Some(old) = buffer.set_region(Some(next)) {
            manager.retire(old);
        }
        let addr = manager.bump(next, size, AllocType::Normal)?;
        buffer.record_allocation(size);
        Some(addr)
    }

    fn refill(&self, manager: &RegionManager, buffer: &Arc<AllocationBuffer>) -> Option<usize> {
        if !self.base.is_async_allocation_enabled() {
            return manager.acquire_region(RegionState::ThreadLocal);
        }
        let region = buffer
            .take_prepared()
            .or_else(|| manager.acquire_region(RegionState::ThreadLocal));
        self.base.buffers().add_hungry_buffer(buffer);
        self.schedule_feed();
        region
    }

    /// Post a replenish task unless one is already queued.
    fn schedule_feed(&self) {
        let (Some(taskpool), Some(manager)) = (self.taskpool.read().clone(), self.manager.get()) else {
            return;
        };
        if self.feed_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = ReplenishTask::new(
            Arc::clone(self.base.buffers()),
            Arc::clone(manager),
            Arc::clone(&self.feed_pending),
        );
        if let Err(err) = taskpool.post_task(Box::new(task)) {
            self.feed_pending.store(false, Ordering::Release);
            tracing::debug!(error = %err, "could not schedule buffer replenishment");
        }
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for RegionAllocator {
    fn base(&self) -> &AllocatorBase {
        &self.base
    }

    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Region
    }

    fn init(&self, config: &HeapConfig) {
        self.base.init_config(self.kind(), config);
        let Some(manager) = RegionManager::new(config) else {
            tracing::error!(size = config.heap_size, "failed to reserve region space");
            panic!("failed to reserve {} bytes of heap", config.heap_size);
        };
        tracing::debug!(
            regions = manager.region_count(),
            region_size = config.region_size,
            "region table ready"
        );
        let _ = self.manager.set(Arc::new(manager));
    }

    fn allocate_no_gc(&self, size: usize, alloc_type: AllocType) -> HeapAddress {
        let (Some(manager), Some(config), Some(size)) =
            (self.manager.get(), self.base.config(), aligned_object_size(size))
        else {
            return HeapAddress::NULL;
        };

        let addr = if alloc_type == AllocType::Large || size >= config.large_object_threshold {
            manager.allocate_large(size)
        } else if alloc_type == AllocType::Pinned {
            manager.allocate_pinned(size)
        } else {
            self.allocate_normal(manager, size)
        };

        match addr {
            Some(addr) => {
                self.base.record_allocation(size);
                HeapAddress::new(addr)
            }
            None => {
                tracing::debug!(size, ?alloc_type, "region space exhausted");
                HeapAddress::NULL
            }
        }
    }

    fn for_each_object(&self, visitor: &mut dyn FnMut(HeapObject) -> bool, safe: bool) -> bool {
        self.manager
            .get()
            .map_or(true, |manager| manager.for_each_object(visitor, safe))
    }

    fn sweep(&self, is_live: &mut dyn FnMut(HeapObject) -> bool) -> usize {
        let Some(manager) = self.manager.get() else {
            return 0;
        };
        let (bytes, regions) = manager.sweep(is_live);
        self.base.record_release(bytes);
        tracing::debug!(bytes, regions, "regions swept");
        bytes
    }

    fn reclaim_garbage_memory(&self, release_all: bool) -> usize {
        let Some(manager) = self.manager.get() else {
            return 0;
        };
        let released = manager.reclaim(release_all);
        tracing::debug!(released, release_all, "garbage regions reclaimed");
        released
    }

    fn feed_hungry_buffers(&self) -> usize {
        self.manager
            .get()
            .map_or(0, |manager| manager.feed_hungry_buffers(self.base.buffers()))
    }

    fn max_capacity(&self) -> usize {
        self.manager.get().map_or(0, |m| m.space.size())
    }

    fn current_capacity(&self) -> usize {
        self.manager
            .get()
            .map_or(0, |m| self.regions_in_use() * m.region_size)
    }

    fn is_heap_address(&self, addr: HeapAddress) -> bool {
        self.manager.get().is_some_and(|m| m.space.contains(addr))
    }

    fn is_heap_object(&self, addr: HeapAddress) -> bool {
        self.manager.get().is_some_and(|m| m.is_object_start(addr))
    }

    fn attach_taskpool(&self, taskpool: Arc<Taskpool>) {
        *self.taskpool.write() = Some(taskpool);
    }
}

impl fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("base", &self.base)
            .field("manager", &self.manager.get())
            .finish()
    }
}
