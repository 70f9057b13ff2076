//! Distributor - worker pool over the dynamic task queue
//!
//! ```text
//!             next_tasks(W)                      get / task_done
//! Domain ──> DynamicQueue ──> [task queue] ──> worker 0..W ──> Executor
//!    ^            │                                              │
//!    └─ update ───┘ <── join (one wave) ─────────────────────────┘
//! ```
//!
//! The distributor is the only producer: it primes one task per worker,
//! then repeatedly waits for the wave to drain, applies domain updates and
//! refills. Workers run until they receive their stop sentinel.

use super::devices::Partition;
use super::queue::{DynamicQueue, TaskHandle, TaskItem, TaskQueue};
use super::{ResearchLayout, ResearchMonitor, ResearchResults};
use crate::config::{Config, ExecutorTarget};
use crate::domain::UpdateEach;
use crate::experiment::{ExecutorClass, ExecutorParams, Experiment, TaskExecutor, WorkerInfo};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn, Dispatch};

/// Everything a worker needs to turn a task into an executor.
#[derive(Debug, Clone)]
struct WorkerSetup {
    experiment: Arc<Experiment>,
    workers_configs: Vec<Config>,
    branches_configs: Vec<Config>,
    devices: Partition,
    n_iters: Option<usize>,
    target: ExecutorTarget,
    executor_class: ExecutorClass,
    layout: Option<ResearchLayout>,
}

impl WorkerSetup {
    /// Branch configs of one worker, with its devices attached.
    fn branches_for(&self, worker: usize) -> Vec<Config> {
        self.branches_configs
            .iter()
            .enumerate()
            .map(|(branch, config)| {
                let devices = self
                    .devices
                    .get(worker)
                    .and_then(|w| w.get(branch))
                    .cloned()
                    .unwrap_or_default();
                if devices.is_empty() {
                    config.clone()
                } else {
                    let value = Value::from(devices.clone());
                    let mut config = config.clone();
                    config.set_with_alias("device", value, devices.join(","));
                    config
                }
            })
            .collect()
    }
}

/// Runs `W` worker threads over a [`DynamicQueue`].
pub struct Distributor {
    queue: DynamicQueue,
    setup: WorkerSetup,
    dispatch: Option<Dispatch>,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("queue", &self.queue)
            .field("workers", &self.setup.workers_configs.len())
            .field("branches", &self.setup.branches_configs.len())
            .finish_non_exhaustive()
    }
}

impl Distributor {
    /// One worker and one branch, no devices, unbounded iterations.
    #[must_use]
    pub fn new(queue: DynamicQueue, experiment: Arc<Experiment>) -> Self {
        let n_branches = queue.n_branches();
        Self {
            queue,
            setup: WorkerSetup {
                experiment,
                workers_configs: vec![Config::new()],
                branches_configs: vec![Config::new(); n_branches],
                devices: Vec::new(),
                n_iters: None,
                target: ExecutorTarget::default(),
                executor_class: ExecutorClass::default(),
                layout: None,
            },
            dispatch: None,
        }
    }

    /// One executor-level config per worker.
    #[must_use]
    pub fn workers(mut self, configs: Vec<Config>) -> Self {
        self.setup.workers_configs = if configs.is_empty() {
            vec![Config::new()]
        } else {
            configs
        };
        self
    }

    /// One supplementary config per branch.
    #[must_use]
    pub fn branches(mut self, configs: Vec<Config>) -> Self {
        self.setup.branches_configs = configs;
        self
    }

    /// Device sets per worker and branch.
    #[must_use]
    pub fn devices(mut self, devices: Partition) -> Self {
        self.setup.devices = devices;
        self
    }

    /// Iterations per executor.
    #[must_use]
    pub const fn n_iters(mut self, n_iters: Option<usize>) -> Self {
        self.setup.n_iters = n_iters;
        self
    }

    /// Branch execution strategy inside a worker.
    #[must_use]
    pub const fn target(mut self, target: ExecutorTarget) -> Self {
        self.setup.target = target;
        self
    }

    /// Factory of the executor run for every task.
    #[must_use]
    pub fn executor_class(mut self, class: ExecutorClass) -> Self {
        self.setup.executor_class = class;
        self
    }

    /// Persist configs and checkpoints into `layout`.
    #[must_use]
    pub fn layout(mut self, layout: Option<ResearchLayout>) -> Self {
        self.setup.layout = layout;
        self
    }

    /// Log through `dispatch` on worker threads.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Number of worker threads.
    #[must_use]
    pub fn n_workers(&self) -> usize {
        self.setup.workers_configs.len()
    }

    /// The underlying queue.
    #[must_use]
    pub const fn queue(&self) -> &DynamicQueue {
        &self.queue
    }

    /// Run until the domain is exhausted and no update yields more tasks.
    ///
    /// # Errors
    /// Returns error if a worker thread cannot be spawned
    pub fn run(&mut self, monitor: &ResearchMonitor, results: &ResearchResults) -> Result<()> {
        let n_workers = self.n_workers();
        let Self { queue, setup, dispatch } = self;
        let setup: &WorkerSetup = setup;
        let dispatch: &Option<Dispatch> = dispatch;
        let handle = queue.handle();
        info!(
            workers = n_workers,
            branches = queue.n_branches(),
            total = ?queue.total(),
            executor = setup.executor_class.name(),
            "distributor started"
        );

        thread::scope(|scope| -> Result<()> {
            for index in 0..n_workers {
                let worker = Worker {
                    index,
                    handle: Arc::clone(&handle),
                    setup,
                    monitor,
                    results,
                };
                let dispatch = dispatch.clone();
                let spawned = thread::Builder::new()
                    .name(format!("research-worker-{index}"))
                    .spawn_scoped(scope, move || match dispatch {
                        Some(dispatch) => tracing::dispatcher::with_default(&dispatch, || worker.run()),
                        None => worker.run(),
                    });
                if let Err(e) = spawned {
                    queue.stop_workers(index);
                    return Err(e.into());
                }
            }

            dispatch_tasks(queue, n_workers);
            queue.stop_workers(n_workers);
            handle.join();
            Ok(())
        })?;

        info!(
            withdrawn = queue.withdrawn_tasks(),
            waves = queue.finished_tasks(),
            "distributor finished"
        );
        Ok(())
    }
}

/// Prime one task per worker, then refill after every drained wave.
fn dispatch_tasks(queue: &mut DynamicQueue, n_workers: usize) {
    let mut added = refill(queue, n_workers);
    while added > 0 {
        queue.join();
        if matches!(queue.domain().update_each(), Some(UpdateEach::Every(_))) {
            queue.update_domain();
        }
        added = refill(queue, n_workers);
        debug!(added, withdrawn = queue.withdrawn_tasks(), "queue refilled");
    }
}

/// Draw new tasks; an empty draw gets one more chance after a domain update.
fn refill(queue: &mut DynamicQueue, n_workers: usize) -> usize {
    let added = queue.next_tasks(n_workers);
    if added == 0 && queue.update_domain() {
        return queue.next_tasks(n_workers);
    }
    added
}

struct Worker<'a> {
    index: usize,
    handle: TaskHandle,
    setup: &'a WorkerSetup,
    monitor: &'a ResearchMonitor,
    results: &'a ResearchResults,
}

impl Worker<'_> {
    fn run(self) {
        let info = WorkerInfo::current(self.index);
        let branches = self.setup.branches_for(self.index);
        let executor_config = self
            .setup
            .workers_configs
            .get(self.index)
            .cloned()
            .unwrap_or_default();
        debug!(worker = self.index, pid = %info.pid, "worker started");

        loop {
            let item: TaskItem = self.handle.get();
            let Some(task) = item else {
                self.handle.task_done();
                break;
            };
            debug!(worker = self.index, task = task.id, configs = task.configs.len(), "task claimed");

            let mut params = ExecutorParams::new()
                .target(self.setup.target)
                .task_id(task.id)
                .branches_configs(branches[..task.configs.len().min(branches.len())].to_vec())
                .configs(task.configs)
                .executor_config(executor_config.clone())
                .n_iters(self.setup.n_iters)
                .worker(info.clone());
            if let Some(layout) = &self.setup.layout {
                params = params.layout(layout.clone());
            }

            let mut executor = self
                .setup
                .executor_class
                .build(Arc::clone(&self.setup.experiment), params);
            let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                executor.run(self.monitor, self.results);
            }));
            if run.is_err() {
                warn!(worker = self.index, task = task.id, "executor panicked");
            }
            self.handle.task_done();
        }
        debug!(worker = self.index, "worker stopped");
    }
}
