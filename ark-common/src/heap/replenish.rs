//! Background feeding of hungry allocation buffers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::alloc_buffer::AllocBufferManager;
use super::region::RegionManager;
use crate::taskpool::{Task, TaskMeta, TaskType, GLOBAL_TASK_ID};

/// Grants prepared regions to every buffer on the hungry list.
///
/// At most one is queued per allocator; `pending` is the allocator's
/// "already scheduled" flag and is cleared as soon as the task starts, so
/// buffers that go hungry during the run schedule a fresh task.
pub struct ReplenishTask {
    meta: TaskMeta,
    buffers: Arc<AllocBufferManager>,
    regions: Arc<RegionManager>,
    pending: Arc<AtomicBool>,
}

impl ReplenishTask {
    pub(crate) fn new(
        buffers: Arc<AllocBufferManager>,
        regions: Arc<RegionManager>,
        pending: Arc<AtomicBool>,
    ) -> Self {
        Self {
            meta: TaskMeta::new(GLOBAL_TASK_ID, TaskType::ReplenishBuffers),
            buffers,
            regions,
            pending,
        }
    }
}

impl Task for ReplenishTask {
    fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    fn run(&mut self, thread_index: u32) -> bool {
        self.pending.store(false, Ordering::Release);
        if self.is_terminate() {
            return false;
        }
        let fed = self.regions.feed_hungry_buffers(&self.buffers);
        tracing::trace!(thread_index, fed, "hungry buffers replenished");
        true
    }
}

impl fmt::Debug for ReplenishTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplenishTask")
            .field("meta", &self.meta)
            .field("hungry", &self.buffers.hungry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::heap::alloc_buffer::AllocationBuffer;
    use crate::heap::AllocatorKind;

    const REGION: usize = 16 * 1024;

    fn regions() -> Arc<RegionManager> {
        let config = HeapConfig {
            allocator: AllocatorKind::Region,
            heap_size: 4 * REGION,
            region_size: REGION,
            large_object_threshold: REGION / 2,
            gc_threshold: 0,
            retained_garbage_regions: 0,
        };
        Arc::new(RegionManager::new(&config).unwrap())
    }

    fn hungry_buffer(buffers: &AllocBufferManager) -> Arc<AllocationBuffer> {
        let buffer = Arc::new(AllocationBuffer::new());
        assert!(buffers.register_alloc_buffer(&buffer));
        assert!(buffers.add_hungry_buffer(&buffer));
        buffer
    }

    #[test]
    fn test_run_feeds_hungry_buffers() {
        let buffers = Arc::new(AllocBufferManager::new());
        let regions = regions();
        let pending = Arc::new(AtomicBool::new(true));
        let a = hungry_buffer(&buffers);
        let b = hungry_buffer(&buffers);

        let mut task = ReplenishTask::new(Arc::clone(&buffers), Arc::clone(&regions), Arc::clone(&pending));
        assert_eq!(task.task_type(), TaskType::ReplenishBuffers);
        assert!(task.run(0));

        assert!(!pending.load(Ordering::Acquire));
        assert!(a.prepared_region().is_some());
        assert!(b.prepared_region().is_some());
        assert_ne!(a.prepared_region(), b.prepared_region());
        assert_eq!(buffers.hungry_count(), 0);
        assert_eq!(regions.free_region_count(), 2);
    }

    #[test]
    fn test_terminated_task_only_clears_pending() {
        let buffers = Arc::new(AllocBufferManager::new());
        let regions = regions();
        let pending = Arc::new(AtomicBool::new(true));
        let buffer = hungry_buffer(&buffers);

        let mut task = ReplenishTask::new(Arc::clone(&buffers), regions, Arc::clone(&pending));
        task.terminate();
        assert!(!task.run(0));

        assert!(!pending.load(Ordering::Acquire));
        assert!(buffer.prepared_region().is_none());
        assert_eq!(buffers.hungry_count(), 1);
    }

    #[test]
    fn test_unregistered_buffer_is_skipped() {
        let buffers = Arc::new(AllocBufferManager::new());
        let regions = regions();
        let buffer = hungry_buffer(&buffers);
        assert!(buffers.unregister_alloc_buffer(&buffer));

        let mut task = ReplenishTask::new(buffers, Arc::clone(&regions), Arc::new(AtomicBool::new(true)));
        assert!(task.run(0));
        assert!(buffer.prepared_region().is_none());
        assert_eq!(regions.free_region_count(), 4);
    }
}
