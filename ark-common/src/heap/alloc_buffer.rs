//! Thread-local allocation buffers and their manager.
//!
//! An [`AllocationBuffer`] is the bump-pointer fast path of one mutator
//! thread. It points at the region it is currently filling and, when async
//! allocation is enabled, at most one *prepared* region granted ahead of time.
//!
//! The [`AllocBufferManager`] tracks every registered buffer and the list of
//! hungry buffers waiting for a prepared region. Mutators push onto the
//! hungry list concurrently; a single feeder drains it with
//! [`AllocBufferManager::swap_hungry_buffers`]. Both sides hold the hungry
//! mutex only long enough to push or take the whole list, and the buffer's
//! hungry flag is only ever changed under that mutex, so a buffer is hungry
//! exactly while it sits in the list.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// Sentinel for "no region".
pub(crate) const NO_REGION: usize = usize::MAX;

/// Unique identifier for an allocation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> BufferId {
    BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
}

fn region_slot(idx: usize) -> Option<usize> {
    (idx != NO_REGION).then_some(idx)
}

/// Bump-pointer allocation buffer owned by one mutator thread.
///
/// The current region is only replaced by the owner thread. The prepared
/// region is written by the feeder and taken by the owner, both atomically.
pub struct AllocationBuffer {
    /// Buffer identity.
    id: BufferId,
    /// Thread the buffer allocates for.
    owner: ThreadId,
    /// Region currently being filled.
    region: AtomicUsize,
    /// Region granted ahead of time by the feeder.
    prepared: AtomicUsize,
    /// Set while the buffer is on the manager's hungry list.
    hungry: AtomicBool,
    /// Bytes allocated through this buffer.
    allocated: AtomicUsize,
}

impl AllocationBuffer {
    /// Create a buffer owned by the calling thread.
    pub fn new() -> Self {
        Self {
            id: next_buffer_id(),
            owner: thread::current().id(),
            region: AtomicUsize::new(NO_REGION),
            prepared: AtomicUsize::new(NO_REGION),
            hungry: AtomicBool::new(false),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Get the buffer ID.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Get the owning thread.
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Index of the region being filled.
    pub fn region(&self) -> Option<usize> {
        region_slot(self.region.load(Ordering::Acquire))
    }

    /// Index of the prepared region, if one has been granted.
    pub fn prepared_region(&self) -> Option<usize> {
        region_slot(self.prepared.load(Ordering::Acquire))
    }

    /// Check whether the buffer is waiting for a prepared region.
    pub fn is_hungry(&self) -> bool {
        self.hungry.load(Ordering::Acquire)
    }

    /// Bytes allocated through this buffer so far.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Install a new current region, returning the previous one.
    pub(crate) fn set_region(&self, idx: Option<usize>) -> Option<usize> {
        region_slot(self.region.swap(idx.unwrap_or(NO_REGION), Ordering::AcqRel))
    }

    /// Take the prepared region, leaving none.
    pub(crate) fn take_prepared(&self) -> Option<usize> {
        region_slot(self.prepared.swap(NO_REGION, Ordering::AcqRel))
    }

    /// Offer a prepared region. Fails if the buffer already has one.
    pub(crate) fn offer_prepared(&self, idx: usize) -> bool {
        self.prepared
            .compare_exchange(NO_REGION, idx, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn record_allocation(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl Default for AllocationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationBuffer")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("region", &self.region())
            .field("prepared", &self.prepared_region())
            .field("hungry", &self.is_hungry())
            .finish()
    }
}

/// Buffers handed out by [`AllocBufferManager::swap_hungry_buffers`].
pub type HungryBuffers = Vec<Arc<AllocationBuffer>>;

/// Registry of allocation buffers plus the hungry list.
#[derive(Default)]
pub struct AllocBufferManager {
    /// Registered buffers by identity.
    buffers: Mutex<HashMap<BufferId, Arc<AllocationBuffer>>>,
    /// Buffers waiting for a prepared region.
    hungry: Mutex<HungryBuffers>,
}

impl AllocBufferManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer.
    ///
    /// Returns `false` if it was already registered.
    pub fn register_alloc_buffer(&self, buffer: &Arc<AllocationBuffer>) -> bool {
        let mut buffers = self.buffers.lock();
        if buffers.contains_key(&buffer.id) {
            return false;
        }
        buffers.insert(buffer.id, Arc::clone(buffer));
        true
    }

    /// Drop a buffer from the registry and the hungry list.
    ///
    /// Returns `false` if it was not registered.
    pub fn unregister_alloc_buffer(&self, buffer: &AllocationBuffer) -> bool {
        let removed = self.buffers.lock().remove(&buffer.id).is_some();
        let mut hungry = self.hungry.lock();
        if buffer.hungry.load(Ordering::Acquire) {
            hungry.retain(|b| b.id != buffer.id);
            buffer.hungry.store(false, Ordering::Release);
        }
        removed
    }

    /// Check whether a buffer is registered.
    pub fn is_registered(&self, id: BufferId) -> bool {
        self.buffers.lock().contains_key(&id)
    }

    /// Number of registered buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Queue a buffer for replenishment.
    ///
    /// Returns `false` if the buffer was already hungry.
    pub fn add_hungry_buffer(&self, buffer: &Arc<AllocationBuffer>) -> bool {
        let mut hungry = self.hungry.lock();
        if buffer.hungry.load(Ordering::Acquire) {
            return false;
        }
        buffer.hungry.store(true, Ordering::Release);
        hungry.push(Arc::clone(buffer));
        true
    }

    /// Take every hungry buffer, appending them to `out`.
    ///
    /// The list is emptied in the same critical section, so each buffer is
    /// handed out by exactly one swap. Buffers that turn hungry afterwards
    /// land in the next swap.
    pub fn swap_hungry_buffers(&self, out: &mut HungryBuffers) {
        let mut hungry = self.hungry.lock();
        for buffer in hungry.iter() {
            buffer.hungry.store(false, Ordering::Release);
        }
        out.append(&mut hungry);
    }

    /// Number of buffers currently hungry.
    pub fn hungry_count(&self) -> usize {
        self.hungry.lock().len()
    }

    /// Visit a snapshot of the registered buffers.
    ///
    /// The registry lock is released before the visitor runs, so visitors may
    /// call back into the manager.
    pub fn visit_alloc_buffers<F>(&self, mut visitor: F)
    where
        F: FnMut(&AllocationBuffer),
    {
        let snapshot: Vec<_> = self.buffers.lock().values().cloned().collect();
        for buffer in &snapshot {
            visitor(buffer);
        }
    }
}

impl fmt::Debug for AllocBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocBufferManager")
            .field("buffers", &self.buffer_count())
            .field("hungry", &self.hungry_count())
            .finish()
    }
}
