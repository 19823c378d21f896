//! The allocator interface shared by every heap space.
//!
//! An [`Allocator`] hands out [`HeapAddress`]es from a reserved
//! [`HeapSpace`](super::space::HeapSpace). State common to every variant
//! (buffer manager, async-allocation flag, one-shot configuration, GC handler
//! and byte accounting) lives in [`AllocatorBase`], which concrete allocators
//! embed and expose through [`Allocator::base`].
//!
//! Allocation failure is reported with [`HeapAddress::NULL`]. Misusing
//! [`Allocator::init`] is fatal.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::alloc_buffer::AllocBufferManager;
use super::bump::BumpPointerAllocator;
use super::large::LargeObjectAllocator;
use super::region::RegionAllocator;
use super::{AllocType, HeapAddress, HeapObject};
use crate::config::{self, HeapConfig};
use crate::taskpool::Taskpool;

/// Why an allocator asks for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcReason {
    /// Allocated bytes crossed the configured threshold.
    Threshold,
    /// A request could not be satisfied from free space.
    AllocationFailure,
}

/// Receiver of collection requests.
///
/// For [`GcReason::Threshold`] the handler should only schedule work and
/// return. For [`GcReason::AllocationFailure`] the allocator retries once
/// right after the call returns, so a handler that can collect synchronously
/// should do so before returning.
pub trait GcHandler: Send + Sync {
    /// Handle a collection request.
    fn request_gc(&self, reason: GcReason);
}

/// The closed set of allocator variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    /// One shared space with a CAS-bumped cursor.
    BumpPointer,
    /// Power-of-two regions with thread-local buffers.
    Region,
    /// Page-granular first-fit spans.
    LargeObject,
}

impl AllocatorKind {
    /// Parse an allocator kind (`bump`, `region` or `large`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bump" | "bump-pointer" | "bump_pointer" => Some(AllocatorKind::BumpPointer),
            "region" => Some(AllocatorKind::Region),
            "large" | "large-object" | "large_object" => Some(AllocatorKind::LargeObject),
            _ => None,
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocatorKind::BumpPointer => "bump",
            AllocatorKind::Region => "region",
            AllocatorKind::LargeObject => "large",
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every allocator variant.
pub struct AllocatorBase {
    /// Allocator identity, used to key per-thread state.
    id: u64,
    /// Registered allocation buffers.
    buffers: Arc<AllocBufferManager>,
    /// Read once at construction.
    async_allocation: bool,
    /// Set exactly once by `init`.
    config: OnceLock<HeapConfig>,
    /// Collection request sink.
    gc_handler: RwLock<Option<Arc<dyn GcHandler>>>,
    /// Bytes currently allocated.
    allocated: AtomicUsize,
    /// Set after a threshold request until usage drops below the threshold.
    threshold_requested: AtomicBool,
}

impl AllocatorBase {
    /// Create a base, reading the async-allocation flag from the environment.
    pub fn new() -> Self {
        Self::with_async_allocation(config::async_allocation_from_env())
    }

    /// Create a base with an explicit async-allocation flag.
    pub fn with_async_allocation(async_allocation: bool) -> Self {
        Self {
            id: NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed),
            buffers: Arc::new(AllocBufferManager::new()),
            async_allocation,
            config: OnceLock::new(),
            gc_handler: RwLock::new(None),
            allocated: AtomicUsize::new(0),
            threshold_requested: AtomicBool::new(false),
        }
    }

    /// Allocator identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The buffer manager.
    pub fn buffers(&self) -> &Arc<AllocBufferManager> {
        &self.buffers
    }

    /// Whether exhausted buffers are replenished ahead of time.
    pub fn is_async_allocation_enabled(&self) -> bool {
        self.async_allocation
    }

    /// The heap configuration, once `init` has run.
    pub fn config(&self) -> Option<&HeapConfig> {
        self.config.get()
    }

    /// Record the configuration.
    ///
    /// # Panics
    ///
    /// Panics after logging if `config` is invalid or the allocator was
    /// already initialised. The heap cannot run misconfigured.
    pub fn init_config(&self, kind: AllocatorKind, config: &HeapConfig) {
        if let Err(err) = config.validate() {
            tracing::error!(allocator = %kind, error = %err, "invalid heap configuration");
            panic!("{} allocator: {}", kind, err);
        }
        if self.config.set(config.clone()).is_err() {
            tracing::error!(allocator = %kind, id = self.id, "allocator initialised twice");
            panic!("{} allocator {} initialised twice", kind, self.id);
        }
        tracing::info!(
            allocator = %kind,
            heap_size = config.heap_size,
            async_allocation = self.async_allocation,
            "allocator initialised"
        );
    }

    /// Install the collection request sink, replacing any previous one.
    pub fn set_gc_handler(&self, handler: Arc<dyn GcHandler>) {
        *self.gc_handler.write() = Some(handler);
    }

    /// Forward a request to the GC handler.
    ///
    /// Returns `false` when no handler is installed.
    pub fn request_gc(&self, reason: GcReason) -> bool {
        // Clone out so the handler may call back into the allocator.
        let handler = self.gc_handler.read().clone();
        match handler {
            Some(handler) => {
                tracing::debug!(allocator = self.id, ?reason, "requesting collection");
                handler.request_gc(reason);
                true
            }
            None => false,
        }
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Account for a successful allocation.
    pub fn record_allocation(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account for bytes the GC reported dead.
    pub fn record_release(&self, bytes: usize) {
        let prev = self.allocated.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "released more than was allocated");
        let threshold = self.config().map_or(0, |c| c.gc_threshold);
        if prev.saturating_sub(bytes) < threshold {
            self.threshold_requested.store(false, Ordering::Release);
        }
    }

    /// Post a threshold request if usage crossed `gc_threshold`.
    ///
    /// Only one request is posted per crossing.
    fn check_threshold(&self) {
        let threshold = match self.config() {
            Some(config) if config.gc_threshold > 0 => config.gc_threshold,
            _ => return,
        };
        if self.allocated_bytes() < threshold {
            return;
        }
        if !self.threshold_requested.swap(true, Ordering::AcqRel) {
            self.request_gc(GcReason::Threshold);
        }
    }
}

impl Default for AllocatorBase {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocatorBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorBase")
            .field("id", &self.id)
            .field("async_allocation", &self.async_allocation)
            .field("initialised", &self.config.get().is_some())
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

/// A managed-heap allocator.
pub trait Allocator: Send + Sync {
    /// Shared allocator state.
    fn base(&self) -> &AllocatorBase;

    /// Which variant this is.
    fn kind(&self) -> AllocatorKind;

    /// Reserve the heap and apply `config`. Must be called exactly once,
    /// before any allocation.
    ///
    /// # Panics
    ///
    /// Panics on a second call, an invalid configuration, or when the address
    /// range cannot be reserved.
    fn init(&self, config: &HeapConfig);

    /// Allocate `size` bytes without ever asking for a collection.
    ///
    /// Returns [`HeapAddress::NULL`] when the request cannot be satisfied.
    fn allocate_no_gc(&self, size: usize, alloc_type: AllocType) -> HeapAddress;

    /// Allocate `size` bytes.
    ///
    /// On failure the GC handler is asked for a collection once and the
    /// request retried once. Returns [`HeapAddress::NULL`] if that also fails.
    fn allocate(&self, size: usize, alloc_type: AllocType) -> HeapAddress {
        let addr = self.allocate_no_gc(size, alloc_type);
        if !addr.is_null() {
            self.base().check_threshold();
            return addr;
        }
        if !self.base().request_gc(GcReason::AllocationFailure) {
            return HeapAddress::NULL;
        }
        let addr = self.allocate_no_gc(size, alloc_type);
        if addr.is_null() {
            tracing::warn!(allocator = %self.kind(), size, ?alloc_type, "out of memory after collection");
        }
        addr
    }

    /// Visit every allocated object.
    ///
    /// The visitor returns `false` to stop. The result is `false` when the
    /// walk stopped early, either by the visitor or because a torn header
    /// was observed. With `safe` the walk covers a point-in-time snapshot and
    /// may run beside mutators; without it the caller guarantees exclusive
    /// access.
    fn for_each_object(&self, visitor: &mut dyn FnMut(HeapObject) -> bool, safe: bool) -> bool;

    /// Turn wholly dead space into garbage awaiting reclamation.
    ///
    /// `is_live` reports the GC's verdict per object. Returns the number of
    /// bytes that became garbage.
    fn sweep(&self, is_live: &mut dyn FnMut(HeapObject) -> bool) -> usize;

    /// Return garbage memory to the OS and make it allocatable again.
    ///
    /// Returns the bytes released. `release_all` releases every free page,
    /// otherwise a small reserve stays committed.
    fn reclaim_garbage_memory(&self, release_all: bool) -> usize;

    /// Grant prepared space to hungry buffers. Returns how many were fed.
    fn feed_hungry_buffers(&self) -> usize {
        0
    }

    /// Bytes currently allocated.
    fn allocated_bytes(&self) -> usize {
        self.base().allocated_bytes()
    }

    /// Size of the reserved space, 0 before `init`.
    fn max_capacity(&self) -> usize;

    /// Bytes of the space currently handed out to allocation (in use or
    /// committed to buffers).
    fn current_capacity(&self) -> usize;

    /// Check whether `addr` lies inside this allocator's space.
    fn is_heap_address(&self, addr: HeapAddress) -> bool;

    /// Check whether `addr` is the start of an allocated object.
    fn is_heap_object(&self, addr: HeapAddress) -> bool {
        if !self.is_heap_address(addr) {
            return false;
        }
        let mut found = false;
        self.for_each_object(
            &mut |obj| {
                found = obj.address == addr;
                !found && obj.address < addr
            },
            true,
        );
        found
    }

    /// The buffer manager.
    fn alloc_buffer_manager(&self) -> &Arc<AllocBufferManager> {
        self.base().buffers()
    }

    /// Whether exhausted buffers are replenished ahead of time.
    fn is_async_allocation_enabled(&self) -> bool {
        self.base().is_async_allocation_enabled()
    }

    /// Install the collection request sink.
    fn set_gc_handler(&self, handler: Arc<dyn GcHandler>) {
        self.base().set_gc_handler(handler);
    }

    /// Let the allocator post background work to `taskpool`.
    fn attach_taskpool(&self, _taskpool: Arc<Taskpool>) {}
}

/// Build an uninitialised allocator of the given kind.
pub fn create_allocator(kind: AllocatorKind) -> Box<dyn Allocator> {
    match kind {
        AllocatorKind::BumpPointer => Box::new(BumpPointerAllocator::new()),
        AllocatorKind::Region => Box::new(RegionAllocator::new()),
        AllocatorKind::LargeObject => Box::new(LargeObjectAllocator::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ASYNC_ALLOCATION_DEFAULT, ASYNC_ALLOCATION_ENV};
    use parking_lot::Mutex;
    use std::env;
    use std::sync::Weak;

    fn small_config() -> HeapConfig {
        HeapConfig {
            allocator: AllocatorKind::BumpPointer,
            heap_size: 64 * 1024,
            region_size: 16 * 1024,
            large_object_threshold: 8 * 1024,
            gc_threshold: 0,
            retained_garbage_regions: 0,
        }
    }

    #[test]
    fn test_allocator_kind_parse() {
        assert_eq!(AllocatorKind::parse("bump"), Some(AllocatorKind::BumpPointer));
        assert_eq!(AllocatorKind::parse("REGION"), Some(AllocatorKind::Region));
        assert_eq!(AllocatorKind::parse("large"), Some(AllocatorKind::LargeObject));
        assert_eq!(AllocatorKind::parse("slab"), None);
        assert_eq!(AllocatorKind::Region.to_string(), "region");
    }

    #[test]
    fn test_create_allocator_kinds() {
        for kind in [AllocatorKind::BumpPointer, AllocatorKind::Region, AllocatorKind::LargeObject] {
            let allocator = create_allocator(kind);
            assert_eq!(allocator.kind(), kind);
            assert_eq!(allocator.max_capacity(), 0);
            assert!(allocator.allocate(64, AllocType::Normal).is_null());
        }
    }

    #[test]
    fn test_allocator_ids_unique() {
        let a = AllocatorBase::with_async_allocation(false);
        let b = AllocatorBase::with_async_allocation(false);
        assert_ne!(a.id(), b.id());
    }

    // The only test in this crate's unit suite that touches the flag variable.
    #[test]
    fn test_async_allocation_env_flag() {
        env::remove_var(ASYNC_ALLOCATION_ENV);
        assert_eq!(
            create_allocator(AllocatorKind::Region).is_async_allocation_enabled(),
            ASYNC_ALLOCATION_DEFAULT
        );

        env::set_var(ASYNC_ALLOCATION_ENV, "1");
        assert!(create_allocator(AllocatorKind::Region).is_async_allocation_enabled());

        env::set_var(ASYNC_ALLOCATION_ENV, "0");
        assert!(!create_allocator(AllocatorKind::Region).is_async_allocation_enabled());

        env::set_var(ASYNC_ALLOCATION_ENV, "a");
        assert_eq!(
            create_allocator(AllocatorKind::Region).is_async_allocation_enabled(),
            ASYNC_ALLOCATION_DEFAULT
        );

        env::remove_var(ASYNC_ALLOCATION_ENV);
    }

    #[test]
    #[should_panic(expected = "initialised twice")]
    fn test_double_init_panics() {
        let allocator = BumpPointerAllocator::with_async_allocation(false);
        allocator.init(&small_config());
        allocator.init(&small_config());
    }

    #[test]
    #[should_panic]
    fn test_invalid_init_panics() {
        let allocator = BumpPointerAllocator::with_async_allocation(false);
        let mut config = small_config();
        config.region_size = 1000;
        allocator.init(&config);
    }

    /// Collects everything on allocation failure.
    struct SweepAll {
        allocator: Mutex<Weak<dyn Allocator>>,
        requests: Mutex<Vec<GcReason>>,
    }

    impl GcHandler for SweepAll {
        fn request_gc(&self, reason: GcReason) {
            self.requests.lock().push(reason);
            if reason == GcReason::AllocationFailure {
                if let Some(allocator) = self.allocator.lock().upgrade() {
                    allocator.sweep(&mut |_| false);
                    allocator.reclaim_garbage_memory(true);
                }
            }
        }
    }

    fn with_handler(config: &HeapConfig) -> (Arc<dyn Allocator>, Arc<SweepAll>) {
        let allocator: Arc<dyn Allocator> = Arc::new(BumpPointerAllocator::with_async_allocation(false));
        allocator.init(config);
        let handler = Arc::new(SweepAll {
            allocator: Mutex::new(Arc::downgrade(&allocator)),
            requests: Mutex::new(Vec::new()),
        });
        allocator.set_gc_handler(handler.clone());
        (allocator, handler)
    }

    #[test]
    fn test_allocate_retries_after_gc() {
        let (allocator, handler) = with_handler(&small_config());

        // Fill the space.
        while !allocator.allocate_no_gc(4096, AllocType::Normal).is_null() {}
        assert!(handler.requests.lock().is_empty());

        // The handler frees everything, so the single retry succeeds.
        let addr = allocator.allocate(4096, AllocType::Normal);
        assert!(!addr.is_null());
        assert_eq!(*handler.requests.lock(), vec![GcReason::AllocationFailure]);
    }

    #[test]
    fn test_allocate_without_handler_fails() {
        let allocator = BumpPointerAllocator::with_async_allocation(false);
        allocator.init(&small_config());
        while !allocator.allocate(4096, AllocType::Normal).is_null() {}
        assert!(allocator.allocate(16, AllocType::Normal).is_null());
    }

    #[test]
    fn test_threshold_requests_once_per_crossing() {
        let mut config = small_config();
        config.gc_threshold = 8 * 1024;
        let (allocator, handler) = with_handler(&config);

        for _ in 0..6 {
            assert!(!allocator.allocate(2048, AllocType::Normal).is_null());
        }
        assert_eq!(*handler.requests.lock(), vec![GcReason::Threshold]);

        // Dropping below the threshold re-arms the trigger.
        allocator.sweep(&mut |_| false);
        allocator.reclaim_garbage_memory(true);
        for _ in 0..4 {
            allocator.allocate(2048, AllocType::Normal);
        }
        assert_eq!(handler.requests.lock().len(), 2);
    }

    #[test]
    fn test_is_heap_object() {
        let allocator = BumpPointerAllocator::with_async_allocation(false);
        allocator.init(&small_config());
        let a = allocator.allocate(32, AllocType::Normal);
        let b = allocator.allocate(64, AllocType::Normal);

        assert!(allocator.is_heap_object(a));
        assert!(allocator.is_heap_object(b));
        assert!(!allocator.is_heap_object(a.offset(8)));
        assert!(!allocator.is_heap_object(HeapAddress::NULL));
    }
}
