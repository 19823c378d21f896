//! # Task Pool
//!
//! Background worker threads for the collector and other runtime upkeep.
//!
//! ## Design
//!
//! - [`Taskpool`] is the entry point. It is an ordinary object owned by the
//!   embedding runtime, not a process global.
//! - It wraps one [`Runner`]: a fixed set of OS threads, sized once at
//!   initialisation, draining one [`TaskQueue`].
//! - Work is a boxed [`Task`]. Cancellation is cooperative through the
//!   task's [`TaskMeta`] flag.
//! - Initialisation is counted: every [`Taskpool::initialize`] must be paired
//!   with a [`Taskpool::destroy`], and the runner is torn down with the last
//!   one.
//!
//! ## Example
//!
//! ```rust,ignore
//! use ark_common::taskpool::{FnTask, TaskType, Taskpool, GLOBAL_TASK_ID};
//!
//! let pool = Taskpool::new();
//! pool.initialize(0, None, None);
//! pool.post_task(FnTask::boxed(GLOBAL_TASK_ID, TaskType::Maintenance, |index, _| {
//!     tracing::info!(index, "running on a pool worker");
//! }))?;
//! pool.destroy(GLOBAL_TASK_ID);
//! ```

pub mod runner;
pub mod task;
pub mod task_queue;

use std::fmt;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub use runner::{PriorityMode, Runner, ThreadHook};
pub use task::{FnTask, Task, TaskMeta, TaskPackMonitor, TaskType, ALL_TASK_ID, GLOBAL_TASK_ID};
pub use task_queue::TaskQueue;

/// Fewest workers an auto-sized pool gets.
pub const MIN_TASKPOOL_THREAD_NUM: u32 = 3;

/// Most workers any pool gets.
pub const MAX_TASKPOOL_THREAD_NUM: u32 = 5;

/// Why a task could not be posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PostError {
    /// The queue was already terminated.
    #[error("task queue has been terminated")]
    Terminated,

    /// The pool was never initialised, or has been destroyed.
    #[error("task pool is not initialized")]
    NotInitialized,
}

/// Lifecycle-gated wrapper around a [`Runner`].
pub struct Taskpool {
    /// Present exactly while the initialisation count is positive.
    runner: RwLock<Option<Runner>>,
    /// Outstanding `initialize` calls.
    is_initialized: Mutex<i32>,
}

impl Taskpool {
    /// Create an uninitialised pool.
    pub fn new() -> Self {
        Self {
            runner: RwLock::new(None),
            is_initialized: Mutex::new(0),
        }
    }

    /// Worker count for a requested `thread_num`.
    ///
    /// A positive request is capped at [`MAX_TASKPOOL_THREAD_NUM`]. Zero
    /// picks half the available CPUs, clamped to
    /// `[MIN_TASKPOOL_THREAD_NUM, MAX_TASKPOOL_THREAD_NUM]`.
    pub fn the_most_suitable_thread_num(thread_num: u32) -> u32 {
        if thread_num > 0 {
            return thread_num.min(MAX_TASKPOOL_THREAD_NUM);
        }
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        let half = u32::try_from(cpus / 2).unwrap_or(u32::MAX);
        half.clamp(MIN_TASKPOOL_THREAD_NUM, MAX_TASKPOOL_THREAD_NUM)
    }

    /// Start the pool, or count one more user of an already started pool.
    ///
    /// Only the first call spawns workers; later calls ignore their
    /// arguments.
    pub fn initialize(&self, thread_num: u32, prologue: Option<ThreadHook>, epilogue: Option<ThreadHook>) {
        let mut count = self.is_initialized.lock();
        if *count <= 0 {
            let threads = Self::the_most_suitable_thread_num(thread_num);
            *self.runner.write() = Some(Runner::new(threads, prologue, epilogue));
            *count = 0;
        }
        *count += 1;
    }

    /// Release one `initialize`, cancelling tasks posted under `id`.
    ///
    /// The last release terminates and joins the workers.
    pub fn destroy(&self, id: i32) {
        let mut count = self.is_initialized.lock();
        if *count <= 0 {
            tracing::warn!(id, "destroy on a task pool that is not initialized");
            return;
        }
        if let Some(runner) = self.runner.read().as_ref() {
            runner.terminate_task(id, TaskType::All);
        }
        *count -= 1;
        if *count > 0 {
            return;
        }

        let runner = self.runner.write().take();
        drop(count);
        if let Some(runner) = runner {
            runner.terminate_thread();
        }
    }

    /// Whether the pool currently has workers.
    pub fn is_initialized(&self) -> bool {
        *self.is_initialized.lock() > 0
    }

    fn with_runner<R>(&self, f: impl FnOnce(&Runner) -> R) -> Option<R> {
        self.runner.read().as_ref().map(f)
    }

    /// Queue a task.
    pub fn post_task(&self, task: Box<dyn Task>) -> Result<(), PostError> {
        let runner = self.runner.read();
        match runner.as_ref() {
            Some(runner) => runner.post_task(task),
            None => {
                tracing::error!(id = task.id(), task_type = ?task.task_type(), "task posted to uninitialized pool");
                Err(PostError::NotInitialized)
            }
        }
    }

    /// Queue a task to become ready after `delay`.
    pub fn post_delayed_task(&self, task: Box<dyn Task>, delay: Duration) -> Result<(), PostError> {
        let runner = self.runner.read();
        match runner.as_ref() {
            Some(runner) => runner.post_delayed_task(task, delay),
            None => {
                tracing::error!(id = task.id(), task_type = ?task.task_type(), "delayed task posted to uninitialized pool");
                Err(PostError::NotInitialized)
            }
        }
    }

    /// Flag queued and running tasks matching `(id, task_type)`.
    pub fn terminate_task(&self, id: i32, task_type: TaskType) {
        self.with_runner(|runner| runner.terminate_task(id, task_type));
    }

    /// Visit the queued, not yet running, tasks.
    pub fn for_each_task<F>(&self, visitor: F)
    where
        F: FnMut(&dyn Task),
    {
        self.with_runner(|runner| runner.for_each_task(visitor));
    }

    /// Visit the running tasks with their worker index.
    pub fn for_each_running_task<F>(&self, visitor: F)
    where
        F: FnMut(u32, &TaskMeta),
    {
        self.with_runner(|runner| runner.for_each_running_task(visitor));
    }

    /// Apply a scheduling class to the workers.
    pub fn set_thread_priority(&self, mode: PriorityMode) {
        self.with_runner(|runner| runner.set_qos_priority(mode));
    }

    /// Number of workers, 0 when not initialised.
    pub fn total_thread_num(&self) -> u32 {
        self.with_runner(Runner::total_thread_num).unwrap_or(0)
    }

    /// Whether `id` is one of the workers.
    pub fn is_in_thread_pool(&self, id: ThreadId) -> bool {
        self.with_runner(|runner| runner.is_in_thread_pool(id)).unwrap_or(false)
    }
}

impl Default for Taskpool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Taskpool {
    fn drop(&mut self) {
        *self.is_initialized.get_mut() = 0;
        if let Some(runner) = self.runner.get_mut().take() {
            runner.terminate_thread();
        }
    }
}

impl fmt::Debug for Taskpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Taskpool")
            .field("initialized", &*self.is_initialized.lock())
            .field("runner", &*self.runner.read())
            .finish()
    }
}
