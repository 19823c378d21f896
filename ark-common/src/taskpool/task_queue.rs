//! Blocking task queue with delayed tasks.
//!
//! Ready tasks sit in a FIFO. Delayed tasks sit in a min-heap keyed by
//! `(deadline, sequence)` and move to the FIFO tail once their deadline has
//! passed. Both collections live under one mutex with one condition variable.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::task::{Task, TaskType};
use super::PostError;

struct DelayedTask {
    deadline: Instant,
    seq: u64,
    task: Box<dyn Task>,
}

impl DelayedTask {
    fn key(&self) -> (Instant, u64) {
        (self.deadline, self.seq)
    }
}

impl PartialEq for DelayedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DelayedTask {}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedTask {
    // Reversed: the heap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Box<dyn Task>>,
    delayed: BinaryHeap<DelayedTask>,
    next_seq: u64,
    terminated: bool,
}

impl QueueState {
    fn promote_expired(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.deadline <= now) {
            if let Some(expired) = self.delayed.pop() {
                self.ready.push_back(expired.task);
            }
        }
    }
}

/// Thread-safe FIFO plus delayed-task heap.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the FIFO and wake one waiter.
    ///
    /// Posting after [`terminate`](TaskQueue::terminate) is a programming
    /// error: it is logged, the task is dropped unrun and
    /// [`PostError::Terminated`] is returned.
    pub fn post_task(&self, task: Box<dyn Task>) -> Result<(), PostError> {
        let mut state = self.state.lock();
        if state.terminated {
            drop(state);
            tracing::error!(id = task.id(), task_type = ?task.task_type(), "task posted to terminated queue");
            return Err(PostError::Terminated);
        }
        state.ready.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Schedule a task to become ready after `delay`.
    pub fn post_delayed_task(&self, task: Box<dyn Task>, delay: Duration) -> Result<(), PostError> {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.terminated {
            drop(state);
            tracing::error!(id = task.id(), task_type = ?task.task_type(), "delayed task posted to terminated queue");
            return Err(PostError::Terminated);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.delayed.push(DelayedTask { deadline, seq, task });
        drop(state);
        // The new task may now be the earliest deadline.
        self.available.notify_one();
        Ok(())
    }

    /// Block until a task is ready, or return `None` once the queue is
    /// terminated and its FIFO drained.
    ///
    /// Delayed tasks that have not expired when the queue terminates are
    /// never returned.
    pub fn pop_task(&self) -> Option<Box<dyn Task>> {
        let mut state = self.state.lock();
        loop {
            if !state.terminated {
                state.promote_expired(Instant::now());
            }
            if let Some(task) = state.ready.pop_front() {
                return Some(task);
            }
            if state.terminated {
                self.available.notify_all();
                return None;
            }
            match state.delayed.peek().map(|d| d.deadline) {
                Some(deadline) => {
                    self.available.wait_until(&mut state, deadline);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Flag every pending task matching `(id, task_type)` for cancellation.
    ///
    /// Flagged tasks stay queued and still run; their bodies are expected to
    /// return early.
    pub fn terminate_task(&self, id: i32, task_type: TaskType) {
        let state = self.state.lock();
        let ready = state.ready.iter().map(|t| t.meta());
        let delayed = state.delayed.iter().map(|d| d.task.meta());
        for meta in ready.chain(delayed) {
            if meta.matches(id, task_type) {
                meta.terminate();
            }
        }
    }

    /// Stop accepting tasks and wake every waiter.
    pub fn terminate(&self) {
        self.state.lock().terminated = true;
        self.available.notify_all();
    }

    /// Whether [`terminate`](TaskQueue::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Visit the ready tasks in FIFO order.
    ///
    /// The queue lock is held during the walk, so the visitor must not post.
    pub fn for_each_task<F>(&self, mut visitor: F)
    where
        F: FnMut(&dyn Task),
    {
        let state = self.state.lock();
        for task in &state.ready {
            visitor(task.as_ref());
        }
    }

    /// Number of ready tasks.
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Whether no task is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks waiting for their deadline.
    pub fn delayed_len(&self) -> usize {
        self.state.lock().delayed.len()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("ready", &state.ready.len())
            .field("delayed", &state.delayed.len())
            .field("terminated", &state.terminated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskpool::task::{FnTask, ALL_TASK_ID};
    use std::sync::Arc;
    use std::thread;

    fn task(id: i32) -> Box<dyn Task> {
        FnTask::boxed(id, TaskType::Maintenance, |_, _| {})
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        for id in 1..=5 {
            queue.post_task(task(id)).unwrap();
        }
        let order: Vec<_> = (0..5).map(|_| queue.pop_task().unwrap().id()).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_delayed_tasks_resolve_by_deadline() {
        let queue = TaskQueue::new();
        queue.post_delayed_task(task(1), Duration::from_millis(80)).unwrap();
        queue.post_delayed_task(task(2), Duration::from_millis(50)).unwrap();
        queue.post_delayed_task(task(3), Duration::from_millis(100)).unwrap();

        let start = Instant::now();
        let order: Vec<_> = (0..3).map(|_| queue.pop_task().unwrap().id()).collect();
        assert_eq!(order, vec![2, 1, 3]);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_equal_deadlines_keep_post_order() {
        let queue = TaskQueue::new();
        for id in 1..=4 {
            queue.post_delayed_task(task(id), Duration::ZERO).unwrap();
        }
        let order: Vec<_> = (0..4).map(|_| queue.pop_task().unwrap().id()).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_ready_tasks_before_unexpired_delayed() {
        let queue = TaskQueue::new();
        queue.post_delayed_task(task(1), Duration::from_millis(30)).unwrap();
        queue.post_task(task(2)).unwrap();
        assert_eq!(queue.pop_task().unwrap().id(), 2);
        assert_eq!(queue.pop_task().unwrap().id(), 1);
    }

    #[test]
    fn test_post_after_terminate_is_rejected() {
        let queue = TaskQueue::new();
        queue.terminate();
        assert_eq!(queue.post_task(task(1)), Err(PostError::Terminated));
        assert_eq!(
            queue.post_delayed_task(task(2), Duration::from_millis(1)),
            Err(PostError::Terminated)
        );
        assert!(queue.pop_task().is_none());
    }

    #[test]
    fn test_terminate_wakes_all_waiters() {
        let queue = Arc::new(TaskQueue::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop_task().is_none())
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        queue.terminate();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_terminate_drains_ready_and_abandons_delayed() {
        let queue = TaskQueue::new();
        queue.post_task(task(1)).unwrap();
        queue.post_delayed_task(task(2), Duration::from_secs(60)).unwrap();
        queue.terminate();

        assert_eq!(queue.pop_task().unwrap().id(), 1);
        assert!(queue.pop_task().is_none());
        assert_eq!(queue.delayed_len(), 1);
    }

    #[test]
    fn test_terminate_task_flags_matching_pending() {
        let queue = TaskQueue::new();
        queue.post_task(FnTask::boxed(1, TaskType::Sweep, |_, _| {})).unwrap();
        queue.post_task(FnTask::boxed(2, TaskType::Sweep, |_, _| {})).unwrap();
        queue
            .post_delayed_task(FnTask::boxed(1, TaskType::Evacuate, |_, _| {}), Duration::ZERO)
            .unwrap();

        queue.terminate_task(1, TaskType::All);
        let first = queue.pop_task().unwrap();
        let second = queue.pop_task().unwrap();
        let third = queue.pop_task().unwrap();
        assert!(first.is_terminate());
        assert!(!second.is_terminate());
        assert!(third.is_terminate());
    }

    #[test]
    fn test_terminate_all_flags_everything() {
        let queue = TaskQueue::new();
        for id in 1..=4 {
            queue.post_task(task(id)).unwrap();
        }
        queue.terminate_task(ALL_TASK_ID, TaskType::All);
        let mut flagged = 0;
        queue.for_each_task(|t| {
            if t.is_terminate() {
                flagged += 1;
            }
        });
        assert_eq!(flagged, 4);

        // Flagged tasks still pop and run harmlessly.
        for _ in 0..4 {
            let mut t = queue.pop_task().unwrap();
            assert!(t.is_terminate());
            t.run(0);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_for_each_task_skips_delayed() {
        let queue = TaskQueue::new();
        queue.post_task(task(1)).unwrap();
        queue.post_delayed_task(task(2), Duration::from_secs(60)).unwrap();
        queue.post_task(task(3)).unwrap();

        let mut ids = Vec::new();
        queue.for_each_task(|t| ids.push(t.id()));
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.delayed_len(), 1);
    }
}
