//! Units of work and their bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Wildcard id matching every task in `terminate_task`.
pub const ALL_TASK_ID: i32 = -1;

/// Id for tasks not tied to a particular owner.
pub const GLOBAL_TASK_ID: i32 = 0;

/// Category of a task, used for targeted cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Wildcard matching every type in `terminate_task`.
    All,
    /// Concurrent marking.
    ConcurrentMark,
    /// Parallel marking during a pause.
    ParallelMark,
    /// Object evacuation.
    Evacuate,
    /// Sweeping dead space.
    Sweep,
    /// Feeding hungry allocation buffers.
    ReplenishBuffers,
    /// Returning memory to the OS.
    ReclaimMemory,
    /// Other background upkeep.
    Maintenance,
}

/// Identity and cancellation state shared by every task.
///
/// Clones share the cancellation flag, so the runner can keep a handle to a
/// running task's flag without owning the task.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    id: i32,
    task_type: TaskType,
    terminate: Arc<AtomicBool>,
}

impl TaskMeta {
    /// Create metadata for a task.
    pub fn new(id: i32, task_type: TaskType) -> Self {
        Self {
            id,
            task_type,
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Task id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Task type.
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Whether cancellation was requested.
    pub fn is_terminate(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Request cancellation.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Whether this task is selected by an `(id, type)` filter.
    pub fn matches(&self, id: i32, task_type: TaskType) -> bool {
        (id == ALL_TASK_ID || id == self.id) && (task_type == TaskType::All || task_type == self.task_type)
    }
}

/// A unit of work run by the task pool.
///
/// Cancellation is cooperative: a long-running body should poll
/// [`Task::is_terminate`] and return early once it is set.
pub trait Task: Send {
    /// Identity and cancellation state.
    fn meta(&self) -> &TaskMeta;

    /// Run the task on worker `thread_index`.
    fn run(&mut self, thread_index: u32) -> bool;

    /// Task id.
    fn id(&self) -> i32 {
        self.meta().id()
    }

    /// Task type.
    fn task_type(&self) -> TaskType {
        self.meta().task_type()
    }

    /// Whether cancellation was requested.
    fn is_terminate(&self) -> bool {
        self.meta().is_terminate()
    }

    /// Request cancellation.
    fn terminate(&self) {
        self.meta().terminate();
    }
}

impl fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("type", &self.task_type())
            .field("terminate", &self.is_terminate())
            .finish()
    }
}

/// A task built from a closure.
pub struct FnTask<F> {
    meta: TaskMeta,
    body: Option<F>,
}

impl<F> FnTask<F>
where
    F: FnOnce(u32, &TaskMeta) + Send,
{
    /// Wrap `body`, which receives the worker index and the task metadata.
    pub fn new(id: i32, task_type: TaskType, body: F) -> Self {
        Self {
            meta: TaskMeta::new(id, task_type),
            body: Some(body),
        }
    }

    /// Boxed, ready to post.
    pub fn boxed(id: i32, task_type: TaskType, body: F) -> Box<dyn Task>
    where
        F: 'static,
    {
        Box::new(Self::new(id, task_type, body))
    }
}

impl<F> Task for FnTask<F>
where
    F: FnOnce(u32, &TaskMeta) + Send,
{
    fn meta(&self) -> &TaskMeta {
        &self.meta
    }

    fn run(&mut self, thread_index: u32) -> bool {
        match self.body.take() {
            Some(body) => {
                body(thread_index, &self.meta);
                true
            }
            None => false,
        }
    }
}

/// Counts the running members of a task pack and lets the poster wait for
/// all of them to finish.
#[derive(Debug)]
pub struct TaskPackMonitor {
    running: Mutex<i32>,
    max_running: i32,
    finished: Condvar,
}

impl TaskPackMonitor {
    /// Create a monitor with `running` members already started and room for
    /// at most `max_running`.
    pub fn new(running: i32, max_running: i32) -> Self {
        debug_assert!(running >= 0 && running <= max_running);
        Self {
            running: Mutex::new(running),
            max_running,
            finished: Condvar::new(),
        }
    }

    /// Block until every member has called [`notify_finish_one`].
    ///
    /// [`notify_finish_one`]: TaskPackMonitor::notify_finish_one
    pub fn wait_all_finished(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            self.finished.wait(&mut running);
        }
    }

    /// Reserve a slot for one more member. Fails when the pack is full.
    pub fn try_add_new_one(&self) -> bool {
        let mut running = self.running.lock();
        if *running < self.max_running {
            *running += 1;
            true
        } else {
            false
        }
    }

    /// Report one member finished.
    pub fn notify_finish_one(&self) {
        let mut running = self.running.lock();
        debug_assert!(*running > 0, "more finishes than members");
        *running -= 1;
        if *running == 0 {
            self.finished.notify_all();
        }
    }

    /// Members currently running.
    pub fn running(&self) -> i32 {
        *self.running.lock()
    }
}
