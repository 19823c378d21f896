//! Fixed pool of worker threads draining one [`TaskQueue`].
//!
//! Workers are numbered `1..=thread_num`; index 0 is conventionally the
//! thread that owns the pool. Each worker runs the optional prologue hook,
//! records its OS thread id, then pops and runs tasks until the queue is
//! terminated and drained, and finally runs the optional epilogue hook.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use super::task::{Task, TaskMeta, TaskType, ALL_TASK_ID};
use super::task_queue::TaskQueue;
use super::PostError;

/// Hook run on a worker with its index.
pub type ThreadHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Scheduling class requested for the pool's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityMode {
    /// Workers run a stop-the-world pause.
    Stw,
    /// Collection runs while the app is in the foreground.
    Foreground,
    /// Collection runs while the app is in the background.
    Background,
}

impl PriorityMode {
    /// Nice value applied on platforms with per-thread priorities.
    pub fn nice(self) -> i32 {
        match self {
            PriorityMode::Stw => -10,
            PriorityMode::Foreground => 0,
            PriorityMode::Background => 10,
        }
    }
}

/// State shared with the workers.
struct RunnerShared {
    queue: TaskQueue,
    /// Running task per worker index.
    running: Mutex<Vec<Option<TaskMeta>>>,
    /// OS thread ids recorded by the workers.
    os_tids: Mutex<Vec<i64>>,
}

impl RunnerShared {
    fn set_running(&self, index: u32, meta: Option<TaskMeta>) {
        self.running.lock()[index as usize] = meta;
    }

    fn work(&self, index: u32, prologue: Option<ThreadHook>, epilogue: Option<ThreadHook>) {
        if let Some(hook) = &prologue {
            hook(index);
        }
        if let Some(tid) = os::current_tid() {
            self.os_tids.lock().push(tid);
        }
        tracing::debug!(index, "task pool worker started");

        while let Some(mut task) = self.queue.pop_task() {
            self.set_running(index, Some(task.meta().clone()));
            let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(index)));
            self.set_running(index, None);
            if result.is_err() {
                tracing::error!(index, id = task.id(), task_type = ?task.task_type(), "task panicked");
            }
        }

        if let Some(hook) = &epilogue {
            hook(index);
        }
        tracing::debug!(index, "task pool worker exiting");
    }
}

/// Worker threads plus their queue.
pub struct Runner {
    shared: Arc<RunnerShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Vec<ThreadId>,
    terminated: AtomicBool,
}

impl Runner {
    /// Spawn `thread_num` workers.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to create a thread.
    pub fn new(thread_num: u32, prologue: Option<ThreadHook>, epilogue: Option<ThreadHook>) -> Self {
        let shared = Arc::new(RunnerShared {
            queue: TaskQueue::new(),
            running: Mutex::new(vec![None; thread_num as usize + 1]),
            os_tids: Mutex::new(Vec::with_capacity(thread_num as usize)),
        });

        let mut threads = Vec::with_capacity(thread_num as usize);
        let mut thread_ids = Vec::with_capacity(thread_num as usize);
        for index in 1..=thread_num {
            let shared = Arc::clone(&shared);
            let prologue = prologue.clone();
            let epilogue = epilogue.clone();
            let handle = thread::Builder::new()
                .name(format!("ark-taskpool-{}", index))
                .spawn(move || shared.work(index, prologue, epilogue))
                .expect("failed to spawn task pool worker");
            thread_ids.push(handle.thread().id());
            threads.push(handle);
        }
        tracing::info!(threads = thread_num, "task pool runner started");

        Self {
            shared,
            threads: Mutex::new(threads),
            thread_ids,
            terminated: AtomicBool::new(false),
        }
    }

    /// Queue a task.
    pub fn post_task(&self, task: Box<dyn Task>) -> Result<(), PostError> {
        self.shared.queue.post_task(task)
    }

    /// Queue a task to become ready after `delay`.
    pub fn post_delayed_task(&self, task: Box<dyn Task>, delay: Duration) -> Result<(), PostError> {
        self.shared.queue.post_delayed_task(task, delay)
    }

    /// Flag queued and running tasks matching `(id, task_type)`.
    pub fn terminate_task(&self, id: i32, task_type: TaskType) {
        self.shared.queue.terminate_task(id, task_type);
        for meta in self.shared.running.lock().iter().flatten() {
            if meta.matches(id, task_type) {
                meta.terminate();
            }
        }
    }

    /// Cancel everything, terminate the queue and join the workers.
    ///
    /// Only the first call does anything. Called from a worker, that worker
    /// is left to exit on its own instead of being joined.
    pub fn terminate_thread(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminate_task(ALL_TASK_ID, TaskType::All);
        self.shared.queue.terminate();

        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.thread().id() == current {
                tracing::warn!("task pool terminated from one of its own workers");
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("task pool worker panicked during shutdown");
            }
        }
        tracing::info!("task pool runner stopped");
    }

    /// Whether [`terminate_thread`](Runner::terminate_thread) has run.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Visit the queued, not yet running, tasks.
    pub fn for_each_task<F>(&self, visitor: F)
    where
        F: FnMut(&dyn Task),
    {
        self.shared.queue.for_each_task(visitor);
    }

    /// Visit the running tasks with their worker index.
    pub fn for_each_running_task<F>(&self, mut visitor: F)
    where
        F: FnMut(u32, &TaskMeta),
    {
        let snapshot: Vec<_> = self
            .shared
            .running
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(index, meta)| meta.clone().map(|meta| (index as u32, meta)))
            .collect();
        for (index, meta) in &snapshot {
            visitor(*index, meta);
        }
    }

    /// Number of workers.
    pub fn total_thread_num(&self) -> u32 {
        self.thread_ids.len() as u32
    }

    /// Whether `id` is one of the workers.
    pub fn is_in_thread_pool(&self, id: ThreadId) -> bool {
        self.thread_ids.contains(&id)
    }

    /// Apply `mode` to every worker that has recorded its OS thread id.
    ///
    /// Best effort: failures are logged at debug level and otherwise
    /// ignored, and platforms without per-thread priorities do nothing.
    pub fn set_qos_priority(&self, mode: PriorityMode) {
        let tids = self.shared.os_tids.lock().clone();
        for tid in tids {
            if let Err(err) = os::set_priority(tid, mode.nice()) {
                tracing::debug!(tid, ?mode, error = %err, "failed to set worker priority");
            }
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.terminate_thread();
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("threads", &self.thread_ids.len())
            .field("queue", &self.shared.queue)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(target_os = "linux")]
mod os {
    use std::io;

    pub(super) fn current_tid() -> Option<i64> {
        // Safety: gettid has no preconditions.
        Some(unsafe { libc::syscall(libc::SYS_gettid) } as i64)
    }

    pub(super) fn set_priority(tid: i64, nice: i32) -> io::Result<()> {
        // Safety: plain syscall on a thread id we recorded.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod os {
    use std::io;

    pub(super) fn current_tid() -> Option<i64> {
        None
    }

    pub(super) fn set_priority(_tid: i64, _nice: i32) -> io::Result<()> {
        Ok(())
    }
}
