//! End-to-end tests for the task pool and the heap runtime.
//!
//! These drive the public API from outside the crate, with real worker
//! threads and real address-space reservations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use ark_common::heap::region::RegionAllocator;
use ark_common::taskpool::{TaskQueue, ALL_TASK_ID, GLOBAL_TASK_ID};
use ark_common::{
    AllocType, Allocator, AllocatorKind, FnTask, HeapRuntime, PostError, RuntimeConfig, TaskType, Taskpool,
};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn runtime_config(threads: u32) -> RuntimeConfig {
    RuntimeConfig::builder()
        .allocator(AllocatorKind::Region)
        .heap_size(8 * 1024 * 1024)
        .region_size(64 * 1024)
        .large_object_threshold(32 * 1024)
        .gc_threshold(0)
        .taskpool_threads(threads)
        .build()
        .unwrap()
}

#[test]
fn test_terminate_finished_task_is_harmless() {
    let pool = Taskpool::new();
    pool.initialize(2, None, None);

    let ran = Arc::new(AtomicU32::new(0));
    for id in [1, 2] {
        let ran = Arc::clone(&ran);
        pool.post_task(FnTask::boxed(id, TaskType::Maintenance, move |_, _| {
            ran.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }
    thread::sleep(Duration::from_millis(100));

    pool.terminate_task(1, TaskType::All);
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    let mut terminated = false;
    pool.for_each_task(|task| terminated |= task.id() == 1 && task.is_terminate());
    assert!(!terminated);

    pool.destroy(GLOBAL_TASK_ID);
    assert_eq!(pool.post_task(FnTask::boxed(3, TaskType::Maintenance, |_, _| {})), Err(PostError::NotInitialized));
}

#[test]
fn test_delayed_tasks_resolve_by_deadline() {
    let queue = TaskQueue::new();
    let t0 = Instant::now();
    for (id, delay) in [(1, 800), (2, 500), (3, 1000)] {
        queue
            .post_delayed_task(FnTask::boxed(id, TaskType::Maintenance, |_, _| {}), Duration::from_millis(delay))
            .unwrap();
    }

    thread::sleep(Duration::from_millis(600));
    assert_eq!(queue.pop_task().unwrap().id(), 2);
    assert_eq!(queue.pop_task().unwrap().id(), 1);
    assert!(t0.elapsed() >= Duration::from_millis(800));
    assert_eq!(queue.pop_task().unwrap().id(), 3);
    assert!(t0.elapsed() >= Duration::from_millis(1000));
}

#[test]
fn test_pool_runs_delayed_tasks_in_deadline_order() {
    let pool = Taskpool::new();
    pool.initialize(1, None, None);

    let (tx, rx) = mpsc::channel();
    for (id, delay) in [(1, 80), (2, 50), (3, 100)] {
        let tx = tx.clone();
        pool.post_delayed_task(
            FnTask::boxed(id, TaskType::Maintenance, move |_, meta| tx.send(meta.id()).unwrap()),
            Duration::from_millis(delay),
        )
        .unwrap();
    }

    let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
    assert_eq!(order, vec![2, 1, 3]);
    pool.destroy(GLOBAL_TASK_ID);
}

#[test]
fn test_every_task_runs_exactly_once() {
    const TASKS: i32 = 500;
    let pool = Arc::new(Taskpool::new());
    pool.initialize(4, None, None);

    let (tx, rx) = mpsc::channel();
    let posters: Vec<_> = (0..4)
        .map(|p| {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..TASKS / 4 {
                    let id = p * (TASKS / 4) + i;
                    let tx = tx.clone();
                    pool.post_task(FnTask::boxed(id, TaskType::Maintenance, move |_, _| tx.send(id).unwrap()))
                        .unwrap();
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }
    drop(tx);

    pool.destroy(GLOBAL_TASK_ID);
    let seen: Vec<_> = rx.iter().collect();
    let unique: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(seen.len(), TASKS as usize);
    assert_eq!(unique.len(), TASKS as usize);
}

#[test]
fn test_runtime_replenishes_hungry_buffers_in_background() {
    let allocator: Arc<dyn Allocator> = Arc::new(RegionAllocator::with_async_allocation(true));
    let runtime = HeapRuntime::with_allocator(runtime_config(2), allocator).unwrap();

    assert!(!runtime.allocate(64, AllocType::Normal).is_null());
    let me = thread::current().id();
    let fed = wait_until(Duration::from_secs(5), || {
        let mut prepared = false;
        runtime
            .allocator()
            .alloc_buffer_manager()
            .visit_alloc_buffers(|b| prepared |= b.owner() == me && b.prepared_region().is_some());
        prepared
    });
    assert!(fed, "the pool never fed the hungry buffer");
    assert_eq!(runtime.allocator().alloc_buffer_manager().hungry_count(), 0);

    runtime.shutdown();
}

#[test]
fn test_concurrent_allocation_through_runtime() {
    const THREADS: usize = 4;
    const OBJECTS: usize = 2000;

    let allocator: Arc<dyn Allocator> = Arc::new(RegionAllocator::with_async_allocation(true));
    let runtime = HeapRuntime::with_allocator(runtime_config(3), allocator).unwrap();

    let addrs: Vec<usize> = thread::scope(|s| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let runtime = &runtime;
                s.spawn(move || {
                    (0..OBJECTS)
                        .map(|i| {
                            let ty = if i % 50 == 0 { AllocType::Pinned } else { AllocType::Normal };
                            let addr = runtime.allocate(32 + (t * 8) % 64, ty);
                            assert!(!addr.is_null());
                            addr.as_usize()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    let unique: HashSet<_> = addrs.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * OBJECTS);

    let mut walked = 0;
    assert!(runtime.allocator().for_each_object(
        &mut |_| {
            walked += 1;
            true
        },
        true,
    ));
    assert_eq!(walked, THREADS * OBJECTS);
    // Every worker thread has exited and detached its buffer.
    assert_eq!(runtime.allocator().alloc_buffer_manager().buffer_count(), 0);

    runtime.taskpool().terminate_task(ALL_TASK_ID, TaskType::All);
    runtime.shutdown();
    assert!(!runtime.taskpool().is_initialized());
}
