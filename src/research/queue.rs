//! Task queues
//!
//! [`JoinableQueue`] is a blocking multi-producer/multi-consumer queue with
//! `task_done`/`join` accounting. [`DynamicQueue`] sits on top of it and
//! turns domain configurations into tasks on demand.
//!
//! Only the distributor calls [`DynamicQueue::next_tasks`],
//! [`DynamicQueue::update_domain`] and [`DynamicQueue::join`]; workers only
//! see the shared [`TaskHandle`].

use crate::config::Config;
use crate::domain::Domain;
use crate::research::ResearchResults;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Operations of a joinable work queue.
pub trait TaskQueue<T>: Send + Sync {
    /// Enqueue an item.
    fn put(&self, item: T);

    /// Block until an item is available and take it.
    fn get(&self) -> T;

    /// Mark one previously taken item as processed.
    fn task_done(&self);

    /// Block until every enqueued item has been marked done.
    fn join(&self);

    /// Whether no item is waiting.
    fn is_empty(&self) -> bool;
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    unfinished: usize,
}

/// Blocking queue with `task_done`/`join` accounting.
#[derive(Debug)]
pub struct JoinableQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    all_done: Condvar,
}

impl<T> Default for JoinableQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JoinableQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                unfinished: 0,
            }),
            not_empty: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Items waiting plus items taken but not marked done.
    #[must_use]
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }

    /// Number of items waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }
}

impl<T: Send> TaskQueue<T> for JoinableQueue<T> {
    fn put(&self, item: T) {
        let mut state = self.lock();
        state.items.push_back(item);
        state.unfinished += 1;
        drop(state);
        self.not_empty.notify_one();
    }

    fn get(&self) -> T {
        let mut state = self.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return item;
            }
            state = self
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn task_done(&self) {
        let mut state = self.lock();
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
    }

    fn join(&self) {
        let mut state = self.lock();
        while state.unfinished > 0 {
            state = self
                .all_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

/// A group of configurations, one per branch, dispatched together.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Withdrawal-order id, never reused
    pub id: usize,
    /// One configuration per branch (fewer at the domain's end)
    pub configs: Vec<Config>,
}

/// Queue item: a task, or `None` telling one worker to stop.
pub type TaskItem = Option<Task>;

/// Consumer side of the task queue, shared with workers.
pub type TaskHandle = Arc<JoinableQueue<TaskItem>>;

/// Queue of tasks generated from a (replaceable) domain.
pub struct DynamicQueue {
    domain: Domain,
    feedback: Arc<ResearchResults>,
    n_branches: usize,
    queue: TaskHandle,
    withdrawn_tasks: usize,
    finished_tasks: usize,
    updated_at: Option<usize>,
}

impl std::fmt::Debug for DynamicQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicQueue")
            .field("domain", &self.domain)
            .field("n_branches", &self.n_branches)
            .field("withdrawn_tasks", &self.withdrawn_tasks)
            .field("finished_tasks", &self.finished_tasks)
            .finish_non_exhaustive()
    }
}

impl DynamicQueue {
    /// Create a queue drawing `n_branches` configs per task from `domain`.
    ///
    /// `feedback` is handed to the domain's update function.
    #[must_use]
    pub fn new(domain: Domain, feedback: Arc<ResearchResults>, n_branches: usize) -> Self {
        Self {
            domain,
            feedback,
            n_branches: n_branches.max(1),
            queue: Arc::new(JoinableQueue::new()),
            withdrawn_tasks: 0,
            finished_tasks: 0,
            updated_at: None,
        }
    }

    /// Shared consumer handle for workers.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        Arc::clone(&self.queue)
    }

    /// Current domain.
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Branches per task.
    #[must_use]
    pub const fn n_branches(&self) -> usize {
        self.n_branches
    }

    /// Tasks put on the queue so far.
    #[must_use]
    pub const fn withdrawn_tasks(&self) -> usize {
        self.withdrawn_tasks
    }

    /// Completed `join` waves.
    #[must_use]
    pub const fn finished_tasks(&self) -> usize {
        self.finished_tasks
    }

    /// Estimated number of tasks before the next domain update.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn total(&self) -> Option<f64> {
        self.domain
            .size()
            .map(|size| size as f64 / self.n_branches as f64)
    }

    /// Whether withdrawn and finished counters differ.
    #[must_use]
    pub const fn in_progress(&self) -> bool {
        self.withdrawn_tasks != self.finished_tasks
    }

    /// Replace the domain if its update function yields a new one.
    ///
    /// At most one update is applied per finished count. Must only be called
    /// while no task is being drawn.
    pub fn update_domain(&mut self) -> bool {
        if self.updated_at == Some(self.finished_tasks) {
            return false;
        }
        match self.domain.update(self.finished_tasks, &self.feedback) {
            Some(domain) => {
                self.updated_at = Some(self.finished_tasks);
                info!(
                    finished = self.finished_tasks,
                    updates = domain.updates(),
                    size = ?domain.size(),
                    "domain updated"
                );
                self.domain = domain;
                true
            }
            None => false,
        }
    }

    /// Draw up to `n_tasks` tasks from the domain and enqueue them.
    ///
    /// A task takes `n_branches` configs; a partial task is still enqueued
    /// when the domain runs out mid-draw, and drawing stops there.
    /// Returns the number of tasks enqueued.
    pub fn next_tasks(&mut self, n_tasks: usize) -> usize {
        let mut batches = Vec::with_capacity(n_tasks);
        for _ in 0..n_tasks {
            let branch_configs: Vec<Config> = self.domain.by_ref().take(self.n_branches).collect();
            let exhausted = branch_configs.len() < self.n_branches;
            if !branch_configs.is_empty() {
                batches.push(branch_configs);
            }
            if exhausted {
                break;
            }
        }

        let n = batches.len();
        for (i, configs) in batches.into_iter().enumerate() {
            self.queue.put(Some(Task {
                id: self.withdrawn_tasks + i,
                configs,
            }));
        }
        self.withdrawn_tasks += n;
        debug!(requested = n_tasks, enqueued = n, withdrawn = self.withdrawn_tasks, "tasks enqueued");
        n
    }

    /// Enqueue one stop sentinel per worker.
    pub fn stop_workers(&self, n_workers: usize) {
        for _ in 0..n_workers {
            self.queue.put(None);
        }
    }

    /// Wait until every enqueued item is done, then count one finished wave.
    pub fn join(&mut self) {
        self.queue.join();
        self.finished_tasks += 1;
    }

    /// Enqueue an item directly.
    pub fn put(&self, item: TaskItem) {
        self.queue.put(item);
    }

    /// Take the next item (blocking).
    #[must_use]
    pub fn get(&self) -> TaskItem {
        self.queue.get()
    }

    /// Mark one taken item as processed.
    pub fn task_done(&self) {
        self.queue.task_done();
    }

    /// Whether no item is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Opt, UpdateEach};
    use std::thread;

    fn queue_over(values: Vec<i64>, n_branches: usize) -> DynamicQueue {
        let domain = Domain::grid(vec![Opt::new("x", values)]);
        let feedback = Arc::new(ResearchResults::new("queue-test", false));
        DynamicQueue::new(domain, feedback, n_branches)
    }

    fn drain(queue: &DynamicQueue) -> Vec<TaskItem> {
        let mut items = Vec::new();
        while !queue.is_empty() {
            items.push(queue.get());
            queue.task_done();
        }
        items
    }

    #[test]
    fn test_partial_last_batch() {
        let mut queue = queue_over(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(queue.total(), Some(2.5));

        assert_eq!(queue.next_tasks(10), 3);
        let tasks: Vec<Task> = drain(&queue).into_iter().flatten().collect();
        assert_eq!(tasks.iter().map(|t| t.id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(tasks[2].configs.len(), 1);
        assert_eq!(queue.next_tasks(1), 0);
        assert_eq!(queue.withdrawn_tasks(), 3);
    }

    #[test]
    fn test_ids_continue_across_calls() {
        let mut queue = queue_over(vec![1, 2, 3, 4], 1);
        assert_eq!(queue.next_tasks(2), 2);
        assert_eq!(queue.next_tasks(2), 2);
        let ids: Vec<usize> = drain(&queue).into_iter().flatten().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_join_counts_one_wave() {
        let mut queue = queue_over(vec![1, 2, 3], 1);
        queue.next_tasks(3);
        assert!(queue.in_progress());
        drain(&queue);
        queue.join();
        assert_eq!(queue.finished_tasks(), 1);
        assert_eq!(queue.withdrawn_tasks(), 3);
        assert!(queue.in_progress());
    }

    #[test]
    fn test_stop_workers_one_sentinel_each() {
        let queue = queue_over(vec![], 1);
        let handle = queue.handle();
        queue.stop_workers(4);

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    let item = handle.get();
                    handle.task_done();
                    item.is_none()
                })
            })
            .collect();
        let seen: Vec<bool> = consumers.into_iter().map(|c| c.join().unwrap()).collect();
        assert_eq!(seen, vec![true; 4]);
        assert!(queue.is_empty());
        handle.join();
    }

    #[test]
    fn test_update_domain_swaps() {
        let mut domain = Domain::grid(vec![Opt::new("x", [1])]);
        domain.set_update(
            |_, _| Some(Domain::grid(vec![Opt::new("x", [7, 8])])),
            UpdateEach::Last,
            Some(1),
        );
        let feedback = Arc::new(ResearchResults::new("queue-test", false));
        let mut queue = DynamicQueue::new(domain, feedback, 1);

        assert!(!queue.update_domain());
        assert_eq!(queue.next_tasks(5), 1);
        assert!(queue.update_domain());
        assert_eq!(queue.next_tasks(5), 2);
        assert!(!queue.update_domain());
        assert_eq!(queue.withdrawn_tasks(), 3);
    }

    #[test]
    fn test_one_update_per_finished_count() {
        let mut domain = Domain::grid(vec![Opt::new("x", [1])]);
        domain.set_update(|_, _| Some(Domain::empty()), UpdateEach::Every(1), Some(5));
        let feedback = Arc::new(ResearchResults::new("queue-test", false));
        let mut queue = DynamicQueue::new(domain, feedback, 1);

        queue.next_tasks(1);
        drain(&queue);
        queue.join();
        assert!(queue.update_domain());
        assert!(!queue.update_domain());
        assert_eq!(queue.domain().updates(), 1);

        queue.join();
        assert!(queue.update_domain());
        assert_eq!(queue.domain().updates(), 2);
    }
}
